//! Durable Low-Latency Event Pipeline
//!
//! Accepts small high-frequency events and:
//! - delivers them to live subscribers through a low-latency transport
//! - records each delivered event in the local durable log
//! - mirrors each delivered event to a remote broker, best-effort
//! - replays the log through the transport after a restart
//!
//! # Architecture
//!
//! ```text
//!             Producer
//!                │ publish (sync, retried)
//!        ┌───────▼────────┐
//!        │  Coordinator   │
//!        └──┬─────┬─────┬─┘
//!           │     │     │
//!   ┌───────▼─┐ ┌─▼───┐ ┌▼──────────┐
//!   │Transport│ │ Log │ │ Forwarder │
//!   └────┬────┘ └──┬──┘ └─────┬─────┘
//!        │         │          │
//!   Subscriber   Replay     Broker
//!    poll loop
//! ```
//!
//! The transport step is the only one whose failure reaches the caller.
//! Log and broker work runs on bounded background queues.

pub mod assembler;
pub mod broker;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod forwarder;
pub mod metrics;
pub mod replay;
pub mod retry;
pub mod subscriber;
pub mod transport;

pub use config::PipelineConfig;
pub use coordinator::{Pipeline, PipelineBuilder};
pub use error::{PipelineError, PublishError, ReplayError};
pub use metrics::{AlertThresholds, MetricsSnapshot};
pub use replay::ReplayStats;
pub use subscriber::{EventHandler, SubscriberHandle};
