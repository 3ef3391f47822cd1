//! Local Durable Log
//!
//! Embedded, ordered, crash-recoverable key-value store used as the
//! pipeline's write-ahead log. Provides checksummed append-only segment
//! writing, corruption-tolerant segment reading, and a sorted in-memory key
//! index for time-range scans.
//!
//! # Layout
//! - `journal`: frame format and the segment writer (flush/fsync policies,
//!   rotation, optional zstd compression)
//! - `reader`: sequential frame reader with corruption detection
//! - `log`: `DurableLog`, the `LogStore` trait, and lazy range scans

pub mod journal;
pub mod log;
pub mod reader;

pub use crate::log::{DurableLog, LogConfig, LogError, LogRecord, LogScan, LogStats, LogStore};
