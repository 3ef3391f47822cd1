//! Error taxonomy for the pipeline.
//!
//! Only transport-level failures reach a `publish` caller. Log and broker
//! failures happen after acceptance; they are logged and counted instead.

use crate::broker::BrokerError;
use crate::config::ConfigError;
use persistence::LogError;
use thiserror::Error;

/// Failure of `Pipeline::publish`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PublishError {
    /// Transport stayed back-pressured through every retry.
    #[error("Transport not accepting after {retries} retries")]
    Exhausted { retries: u32 },

    #[error("Transport closed")]
    Closed,

    #[error("Transport max position exceeded")]
    MaxPositionExceeded,
}

impl PublishError {
    /// Whether the failure ends the transport for every later call too.
    pub fn is_fatal(&self) -> bool {
        matches!(self, PublishError::Closed | PublishError::MaxPositionExceeded)
    }
}

/// Failure of `Pipeline::replay_since`.
#[derive(Error, Debug)]
pub enum ReplayError {
    #[error("Log read failed during replay: {0}")]
    Log(#[from] LogError),

    #[error("Transport failed during replay: {0}")]
    Publish(PublishError),

    #[error("Replay task aborted: {0}")]
    Aborted(String),
}

/// Failure to start or stop the pipeline.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Durable log error: {0}")]
    Log(#[from] LogError),

    #[error("Broker setup failed: {0}")]
    Broker(#[from] BrokerError),

    #[error("Failed to spawn subscriber thread: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("Pipeline already stopped")]
    Stopped,

    #[error("Background task failed: {0}")]
    Task(String),
}
