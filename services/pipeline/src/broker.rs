//! Replication brokers
//!
//! The forwarder mirrors each accepted event to a `Broker`. The broker's
//! error is seen only by the forwarder, which logs and counts it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BrokerError {
    #[error("Broker connection error: {0}")]
    Connection(String),

    #[error("Broker send failed: {0}")]
    Send(String),
}

/// Remote durable broker: one method, fixed topic per caller.
#[async_trait]
pub trait Broker: Send + Sync {
    async fn send(&self, topic: &str, key: &[u8], value: &[u8]) -> Result<(), BrokerError>;

    /// Short name for log fields.
    fn name(&self) -> &'static str {
        "broker"
    }
}

// ── In-memory broker ────────────────────────────────────────────────

/// A record accepted by `MemoryBroker`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentRecord {
    pub topic: String,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

/// Broker that keeps every record in memory.
///
/// Used when no external broker is configured and by tests, which can
/// script failures with `fail_next`.
#[derive(Default)]
pub struct MemoryBroker {
    sent: Mutex<Vec<SentRecord>>,
    failures_pending: AtomicU64,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` sends fail.
    pub fn fail_next(&self, n: u64) {
        self.failures_pending.store(n, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<SentRecord> {
        self.sent.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn len(&self) -> usize {
        self.sent.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn send(&self, topic: &str, key: &[u8], value: &[u8]) -> Result<(), BrokerError> {
        let should_fail = self
            .failures_pending
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if should_fail {
            return Err(BrokerError::Send("scripted failure".to_string()));
        }

        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(SentRecord {
                topic: topic.to_string(),
                key: key.to_vec(),
                value: value.to_vec(),
            });
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

// ── Kafka broker ────────────────────────────────────────────────────

#[cfg(feature = "kafka")]
pub use kafka::KafkaBroker;

#[cfg(feature = "kafka")]
mod kafka {
    use std::time::Duration;

    use async_trait::async_trait;
    use rdkafka::producer::{FutureProducer, FutureRecord};
    use rdkafka::ClientConfig;
    use tracing::info;

    use super::{Broker, BrokerError};
    use crate::config::BrokerSection;

    /// Kafka producer tuned for throughput over per-message latency.
    pub struct KafkaBroker {
        producer: FutureProducer,
        send_timeout: Duration,
    }

    impl KafkaBroker {
        pub fn new(config: &BrokerSection) -> Result<Self, BrokerError> {
            let producer: FutureProducer = ClientConfig::new()
                .set("bootstrap.servers", &config.bootstrap_servers)
                .set("acks", &config.acks)
                .set("batch.size", config.batch_size.to_string())
                .set("linger.ms", config.linger_ms.to_string())
                .set("compression.type", &config.compression)
                .create()
                .map_err(|e| {
                    BrokerError::Connection(format!("Failed to create Kafka producer: {}", e))
                })?;

            info!(
                bootstrap_servers = %config.bootstrap_servers,
                topic = %config.topic,
                "Connected to Kafka"
            );

            Ok(Self {
                producer,
                send_timeout: Duration::from_secs(5),
            })
        }
    }

    #[async_trait]
    impl Broker for KafkaBroker {
        async fn send(&self, topic: &str, key: &[u8], value: &[u8]) -> Result<(), BrokerError> {
            let record = FutureRecord::to(topic).key(key).payload(value);
            self.producer
                .send(record, self.send_timeout)
                .await
                .map_err(|(e, _)| BrokerError::Send(e.to_string()))?;
            Ok(())
        }

        fn name(&self) -> &'static str {
            "kafka"
        }
    }
}
