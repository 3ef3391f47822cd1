//! Replication Forwarder — best-effort mirror to an external broker
//!
//! `forward` never blocks: records go to a bounded queue drained by one
//! background task, which keeps up to `max_in_flight` broker sends
//! running at once. A full queue drops the record. A failed send is
//! logged and counted and never retried. Sends may complete out of
//! order. Replication is a convenience channel; the durable log is the
//! recovery source.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::Semaphore;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};
use types::key::LogKey;

use crate::broker::Broker;
use crate::metrics::PipelineMetrics;

/// A record waiting to be replicated.
#[derive(Debug, Clone)]
pub struct ForwardItem {
    pub key: LogKey,
    pub value: Vec<u8>,
}

/// Producer side of the forward queue.
#[derive(Clone)]
pub struct ReplicationForwarder {
    sender: mpsc::Sender<ForwardItem>,
    in_flight: Arc<AtomicUsize>,
    metrics: Arc<PipelineMetrics>,
}

impl ReplicationForwarder {
    /// Create the queue and spawn its worker on the current runtime.
    ///
    /// The worker drains what is queued, waits for in-flight sends and
    /// exits once `shutdown` fires.
    pub fn spawn(
        broker: Arc<dyn Broker>,
        topic: String,
        capacity: usize,
        max_in_flight: usize,
        metrics: Arc<PipelineMetrics>,
        shutdown: CancellationToken,
    ) -> (Self, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let in_flight = Arc::new(AtomicUsize::new(0));
        let worker = ForwardWorker {
            broker,
            topic: Arc::from(topic),
            receiver,
            permits: Arc::new(Semaphore::new(max_in_flight.max(1))),
            sends: JoinSet::new(),
            in_flight: Arc::clone(&in_flight),
            metrics: Arc::clone(&metrics),
        };
        let handle = tokio::spawn(worker.run(shutdown));
        (
            Self {
                sender,
                in_flight,
                metrics,
            },
            handle,
        )
    }

    /// Hand a record to the worker. Returns `false` if it was dropped.
    pub fn forward(&self, key: LogKey, value: Vec<u8>) -> bool {
        match self.sender.try_send(ForwardItem { key, value }) {
            Ok(()) => true,
            Err(TrySendError::Full(item)) => {
                self.metrics.record_forward_dropped();
                debug!(key = %item.key, "Forward queue full; record dropped");
                false
            }
            Err(TrySendError::Closed(_)) => {
                self.metrics.record_forward_dropped();
                false
            }
        }
    }

    /// Records queued or being sent.
    pub fn pending(&self) -> usize {
        self.sender.max_capacity() - self.sender.capacity() + self.in_flight()
    }

    /// Records taken off the queue whose send has not completed.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }
}

struct ForwardWorker {
    broker: Arc<dyn Broker>,
    topic: Arc<str>,
    receiver: mpsc::Receiver<ForwardItem>,
    permits: Arc<Semaphore>,
    sends: JoinSet<()>,
    in_flight: Arc<AtomicUsize>,
    metrics: Arc<PipelineMetrics>,
}

impl ForwardWorker {
    async fn run(mut self, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                biased;
                Some(joined) = self.sends.join_next(), if !self.sends.is_empty() => {
                    reap(joined);
                }
                item = self.receiver.recv() => match item {
                    Some(item) => self.dispatch(item).await,
                    None => break,
                },
                _ = shutdown.cancelled() => {
                    self.receiver.close();
                    while let Some(item) = self.receiver.recv().await {
                        self.dispatch(item).await;
                    }
                    break;
                }
            }
        }
        while let Some(joined) = self.sends.join_next().await {
            reap(joined);
        }
        debug!(broker = self.broker.name(), "Forward worker stopped");
    }

    /// Start a send once a permit is free.
    async fn dispatch(&mut self, item: ForwardItem) {
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        let permit = match Arc::clone(&self.permits).acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => {
                self.in_flight.fetch_sub(1, Ordering::AcqRel);
                self.metrics.record_forward_dropped();
                return;
            }
        };

        let broker = Arc::clone(&self.broker);
        let topic = Arc::clone(&self.topic);
        let in_flight = Arc::clone(&self.in_flight);
        let metrics = Arc::clone(&self.metrics);
        self.sends.spawn(async move {
            send(broker.as_ref(), &topic, item, &metrics).await;
            in_flight.fetch_sub(1, Ordering::AcqRel);
            drop(permit);
        });
    }
}

fn reap(joined: Result<(), tokio::task::JoinError>) {
    if let Err(e) = joined {
        if e.is_panic() {
            error!(error = %e, "Forward send task panicked");
        }
    }
}

async fn send(broker: &dyn Broker, topic: &str, item: ForwardItem, metrics: &PipelineMetrics) {
    match broker.send(topic, item.key.as_bytes(), &item.value).await {
        Ok(()) => metrics.record_forwarded(),
        Err(e) => {
            metrics.record_forward_failure();
            warn!(
                broker = broker.name(),
                topic = %topic,
                key = %item.key,
                error = %e,
                "Replication forward failed"
            );
        }
    }
}
