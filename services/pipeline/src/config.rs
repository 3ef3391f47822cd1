//! Pipeline configuration
//!
//! TOML-based with every section defaulted, so an empty file is a valid
//! configuration. A few settings can be overridden from the environment:
//!
//! | variable | field |
//! |---|---|
//! | `WAL_PATH` | `log.dir` |
//! | `KAFKA_BOOTSTRAP_SERVERS` | `broker.bootstrap_servers` |
//! | `PIPELINE_TOPIC` | `broker.topic` |
//!
//! ```toml
//! shutdown_grace_ms = 30000
//!
//! [log]
//! dir = "./data/wal"
//!
//! [broker]
//! bootstrap_servers = "localhost:9092"
//! ```

use persistence::journal::Compression;
use persistence::LogConfig;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use types::codec::MAX_ENCODED_LEN;

use crate::retry::RetryPolicy;
use crate::transport::{framed_len, TransportConfig};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

// ── Sections ────────────────────────────────────────────────────────

/// Durable log settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogSection {
    pub dir: PathBuf,
    pub max_segment_bytes: u64,
    /// Flush buffered frames to the OS every N appends.
    pub flush_every: usize,
    pub sync_writes: bool,
    pub compression_level: i32,
    pub compression_min_bytes: usize,
}

impl Default for LogSection {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./data/wal"),
            max_segment_bytes: 256 * 1024 * 1024,
            flush_every: 64,
            sync_writes: false,
            compression_level: 3,
            compression_min_bytes: 512,
        }
    }
}

/// Transport channel settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TransportSection {
    pub capacity_bytes: u64,
    pub term_length: u64,
    pub mtu: usize,
    pub max_position: u64,
    /// Fragments drained per subscriber poll.
    pub fragment_limit: usize,
    /// Subscriber sleep after an empty poll, in nanoseconds.
    pub idle_sleep_ns: u64,
}

impl Default for TransportSection {
    fn default() -> Self {
        let t = TransportConfig::default();
        Self {
            capacity_bytes: t.capacity_bytes,
            term_length: t.term_length,
            mtu: t.mtu,
            max_position: t.max_position,
            fragment_limit: 10,
            idle_sleep_ns: 1_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetrySection {
    pub max_retries: u32,
    pub initial_backoff_us: u64,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_retries: 10,
            initial_backoff_us: 1,
        }
    }
}

/// Background worker queue sizes.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkerSection {
    pub log_queue_capacity: usize,
    /// Most entries folded into one `append_batch`.
    pub log_batch_max: usize,
    pub forward_queue_capacity: usize,
    /// Broker sends awaiting completion at once.
    pub forward_max_in_flight: usize,
}

impl Default for WorkerSection {
    fn default() -> Self {
        Self {
            log_queue_capacity: 65_536,
            log_batch_max: 256,
            forward_queue_capacity: 65_536,
            forward_max_in_flight: 1024,
        }
    }
}

/// Replication broker settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BrokerSection {
    pub topic: String,
    /// Empty means no external broker; an in-memory broker is used.
    pub bootstrap_servers: String,
    pub acks: String,
    pub linger_ms: u64,
    pub batch_size: u64,
    pub compression: String,
}

impl Default for BrokerSection {
    fn default() -> Self {
        Self {
            topic: "market-data".to_string(),
            bootstrap_servers: String::new(),
            acks: "1".to_string(),
            linger_ms: 10,
            batch_size: 65_536,
            compression: "lz4".to_string(),
        }
    }
}

// ── Pipeline Config ─────────────────────────────────────────────────

/// Top-level configuration. All sections are optional.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub log: LogSection,
    pub transport: TransportSection,
    pub retry: RetrySection,
    pub workers: WorkerSection,
    pub broker: BrokerSection,
    /// Bound on how long `stop` waits for background work to drain.
    pub shutdown_grace_ms: u64,
    /// Default tracing filter when `RUST_LOG` is unset.
    pub log_level: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            log: LogSection::default(),
            transport: TransportSection::default(),
            retry: RetrySection::default(),
            workers: WorkerSection::default(),
            broker: BrokerSection::default(),
            shutdown_grace_ms: 30_000,
            log_level: "info".to_string(),
        }
    }
}

impl PipelineConfig {
    /// Defaults with the log rooted at `dir`.
    pub fn with_log_dir(dir: impl Into<PathBuf>) -> Self {
        let mut config = Self::default();
        config.log.dir = dir.into();
        config
    }

    /// Load from a TOML file, then apply environment overrides.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.display().to_string(),
            source: e,
        })?;
        let mut config = Self::from_str(&contents)?;
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Apply overrides from the process environment.
    pub fn apply_env(&mut self) {
        self.apply_overrides(|name| std::env::var(name).ok());
    }

    /// Apply overrides from an arbitrary variable lookup.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(dir) = lookup("WAL_PATH").filter(|v| !v.is_empty()) {
            self.log.dir = PathBuf::from(dir);
        }
        if let Some(servers) = lookup("KAFKA_BOOTSTRAP_SERVERS") {
            self.broker.bootstrap_servers = servers;
        }
        if let Some(topic) = lookup("PIPELINE_TOPIC").filter(|v| !v.is_empty()) {
            self.broker.topic = topic;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |field, reason: &str| {
            Err(ConfigError::Invalid {
                field,
                reason: reason.to_string(),
            })
        };

        if self.transport.mtu == 0 {
            return invalid("transport.mtu", "must be greater than zero");
        }
        if self.transport.capacity_bytes < framed_len(MAX_ENCODED_LEN, self.transport.mtu) {
            return invalid(
                "transport.capacity_bytes",
                "must hold the largest encoded event with its fragment headers",
            );
        }
        if self.transport.term_length == 0 {
            return invalid("transport.term_length", "must be greater than zero");
        }
        if self.transport.fragment_limit == 0 {
            return invalid("transport.fragment_limit", "must be greater than zero");
        }
        if self.log.max_segment_bytes == 0 {
            return invalid("log.max_segment_bytes", "must be greater than zero");
        }
        if self.workers.log_queue_capacity == 0 || self.workers.forward_queue_capacity == 0 {
            return invalid("workers", "queue capacities must be greater than zero");
        }
        if self.workers.forward_max_in_flight == 0 {
            return invalid("workers.forward_max_in_flight", "must be greater than zero");
        }
        if self.workers.log_batch_max == 0 {
            return invalid("workers.log_batch_max", "must be greater than zero");
        }
        if self.broker.topic.is_empty() {
            return invalid("broker.topic", "must not be empty");
        }
        if self.retry.max_retries > 30 {
            return invalid("retry.max_retries", "backoff would overflow past 30 doublings");
        }
        Ok(())
    }

    // ── Derived component configs ───────────────────────────────────

    pub fn log_config(&self) -> LogConfig {
        LogConfig {
            dir: self.log.dir.clone(),
            max_segment_bytes: self.log.max_segment_bytes,
            flush_every: self.log.flush_every,
            sync_writes: self.log.sync_writes,
            compression: Compression {
                level: self.log.compression_level,
                min_bytes: self.log.compression_min_bytes,
            },
        }
    }

    pub fn transport_config(&self) -> TransportConfig {
        TransportConfig {
            capacity_bytes: self.transport.capacity_bytes,
            term_length: self.transport.term_length,
            mtu: self.transport.mtu,
            max_position: self.transport.max_position,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.retry.max_retries,
            initial_backoff: Duration::from_micros(self.retry.initial_backoff_us),
        }
    }

    pub fn idle_sleep(&self) -> Duration {
        Duration::from_nanos(self.transport.idle_sleep_ns)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

impl FromStr for PipelineConfig {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let config: PipelineConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }
}
