//! Pipeline Coordinator
//!
//! The façade application code calls. Per event:
//!
//! 1. encode
//! 2. offer to the transport with retry (failures go back to the caller)
//! 3. queue the bytes for the log worker
//! 4. queue a copy for the replication forwarder
//! 5. update metrics
//!
//! Steps 3 and 4 never block the caller. Their failures are logged and
//! counted and never undo a delivery the transport already made. An event
//! the transport refused is neither persisted nor forwarded.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use persistence::{DurableLog, LogStats, LogStore};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use types::codec;
use types::event::Event;
use types::key::LogKey;

use crate::broker::{Broker, MemoryBroker};
use crate::config::{BrokerSection, PipelineConfig};
use crate::error::{PipelineError, PublishError, ReplayError};
use crate::forwarder::ReplicationForwarder;
use crate::metrics::{Alert, AlertThresholds, MetricsSnapshot, PipelineMetrics};
use crate::replay::{replay_range, ReplayStats};
use crate::retry::{offer_with_retry, RetryPolicy};
use crate::subscriber::{spawn_subscriber, EventHandler, SubscriberConfig, SubscriberHandle};
use crate::transport::{Publisher, Transport};

// ── Builder ─────────────────────────────────────────────────────────

/// Assembles a `Pipeline`. Any collaborator left unset is built from the
/// configuration.
pub struct PipelineBuilder {
    config: PipelineConfig,
    log: Option<Arc<dyn LogStore>>,
    publisher: Option<Arc<dyn Publisher>>,
    broker: Option<Arc<dyn Broker>>,
}

impl PipelineBuilder {
    pub fn new(config: PipelineConfig) -> Self {
        Self {
            config,
            log: None,
            publisher: None,
            broker: None,
        }
    }

    pub fn with_log(mut self, log: Arc<dyn LogStore>) -> Self {
        self.log = Some(log);
        self
    }

    /// Publish through `publisher` instead of the pipeline's own transport.
    /// Subscriptions still attach to the internal transport.
    pub fn with_publisher(mut self, publisher: Arc<dyn Publisher>) -> Self {
        self.publisher = Some(publisher);
        self
    }

    pub fn with_broker(mut self, broker: Arc<dyn Broker>) -> Self {
        self.broker = Some(broker);
        self
    }

    /// Open the log, wire the transport and spawn the background workers.
    ///
    /// Must be called inside a Tokio runtime.
    pub async fn start(self) -> Result<Pipeline, PipelineError> {
        let config = self.config;
        config.validate()?;

        let log: Arc<dyn LogStore> = match self.log {
            Some(log) => log,
            None => {
                let log_config = config.log_config();
                let log = tokio::task::spawn_blocking(move || DurableLog::open(log_config))
                    .await
                    .map_err(|e| PipelineError::Task(e.to_string()))??;
                Arc::new(log)
            }
        };

        let transport = Transport::new(config.transport_config());
        let publisher: Arc<dyn Publisher> = match self.publisher {
            Some(publisher) => publisher,
            None => Arc::new(transport.publication()),
        };
        let broker = match self.broker {
            Some(broker) => broker,
            None => default_broker(&config.broker)?,
        };

        let metrics = Arc::new(PipelineMetrics::new());
        let drain_token = CancellationToken::new();

        let (forwarder, forward_task) = ReplicationForwarder::spawn(
            Arc::clone(&broker),
            config.broker.topic.clone(),
            config.workers.forward_queue_capacity,
            config.workers.forward_max_in_flight,
            Arc::clone(&metrics),
            drain_token.clone(),
        );

        let (log_tx, log_rx) = mpsc::channel(config.workers.log_queue_capacity);
        let log_task = tokio::spawn(run_log_worker(
            Arc::clone(&log),
            log_rx,
            config.workers.log_batch_max,
            Arc::clone(&metrics),
            drain_token.clone(),
        ));

        info!(
            log_dir = %config.log.dir.display(),
            topic = %config.broker.topic,
            broker = broker.name(),
            mtu = config.transport.mtu,
            capacity_bytes = config.transport.capacity_bytes,
            "Pipeline started"
        );

        Ok(Pipeline {
            path: Arc::new(PublishPath {
                publisher,
                retry: config.retry_policy(),
                log_tx,
                forwarder,
                metrics,
                stopping: AtomicBool::new(false),
            }),
            config,
            transport,
            log,
            subscribers_token: CancellationToken::new(),
            drain_token,
            log_task: Mutex::new(Some(log_task)),
            forward_task: Mutex::new(Some(forward_task)),
            subscribers: Mutex::new(Vec::new()),
            next_subscriber: AtomicU64::new(0),
        })
    }
}

fn default_broker(config: &BrokerSection) -> Result<Arc<dyn Broker>, PipelineError> {
    if config.bootstrap_servers.is_empty() {
        return Ok(Arc::new(MemoryBroker::new()));
    }

    #[cfg(feature = "kafka")]
    let broker: Arc<dyn Broker> = Arc::new(crate::broker::KafkaBroker::new(config)?);

    #[cfg(not(feature = "kafka"))]
    let broker: Arc<dyn Broker> = {
        warn!(
            bootstrap_servers = %config.bootstrap_servers,
            "Built without the kafka feature; replicating to memory only"
        );
        Arc::new(MemoryBroker::new())
    };

    Ok(broker)
}

// ── Publish Path ────────────────────────────────────────────────────

struct LogItem {
    key: LogKey,
    value: Vec<u8>,
}

/// State shared by live publishing and replay.
struct PublishPath {
    publisher: Arc<dyn Publisher>,
    retry: RetryPolicy,
    log_tx: mpsc::Sender<LogItem>,
    forwarder: ReplicationForwarder,
    metrics: Arc<PipelineMetrics>,
    stopping: AtomicBool,
}

impl PublishPath {
    fn publish(&self, event: &Event, persist: bool) -> Result<(), PublishError> {
        let started = Instant::now();
        if self.stopping.load(Ordering::Acquire) {
            return Err(PublishError::Closed);
        }

        let bytes = codec::encode(event);
        let metrics = &self.metrics;
        metrics.record_accepted();

        if let Err(e) = offer_with_retry(self.publisher.as_ref(), &bytes, &self.retry, |_| {
            metrics.record_offer_retry()
        }) {
            metrics.record_publish_failure();
            debug!(symbol = %event.symbol, timestamp = event.timestamp, error = %e, "Publish failed");
            return Err(e);
        }
        metrics.record_delivered(started.elapsed().as_nanos() as u64);

        let key = LogKey::for_event(event);
        if persist {
            let item = LogItem {
                key,
                value: bytes.clone(),
            };
            if self.log_tx.try_send(item).is_err() {
                metrics.record_log_dropped();
                warn!(key = %key, "Log queue unavailable; event delivered but not persisted");
            }
        }
        self.forwarder.forward(key, bytes);
        Ok(())
    }
}

// ── Log Worker ──────────────────────────────────────────────────────

/// Drain the log queue into `append_batch` calls of up to `batch_max`
/// entries, each on a blocking thread. On shutdown, stop accepting and
/// write out what is queued.
async fn run_log_worker(
    store: Arc<dyn LogStore>,
    mut receiver: mpsc::Receiver<LogItem>,
    batch_max: usize,
    metrics: Arc<PipelineMetrics>,
    shutdown: CancellationToken,
) {
    let mut draining = false;
    loop {
        let first = if draining {
            receiver.recv().await
        } else {
            tokio::select! {
                biased;
                item = receiver.recv() => item,
                _ = shutdown.cancelled() => {
                    draining = true;
                    receiver.close();
                    continue;
                }
            }
        };
        let Some(first) = first else {
            break;
        };

        let mut batch = vec![(first.key, first.value)];
        while batch.len() < batch_max {
            match receiver.try_recv() {
                Ok(item) => batch.push((item.key, item.value)),
                Err(_) => break,
            }
        }

        let n = batch.len() as u64;
        let target = Arc::clone(&store);
        match tokio::task::spawn_blocking(move || target.append_batch(&batch)).await {
            Ok(Ok(())) => {
                metrics.record_log_appends(n);
                debug!(entries = n, "Log batch appended");
            }
            Ok(Err(e)) => {
                metrics.record_log_failures(n);
                warn!(entries = n, error = %e, "Log append failed; events delivered but not persisted");
            }
            Err(e) => {
                metrics.record_log_failures(n);
                error!(entries = n, error = %e, "Log append task failed");
            }
        }
    }
    debug!("Log worker stopped");
}

// ── Pipeline ────────────────────────────────────────────────────────

/// A running pipeline. Share it behind an `Arc` to publish from several
/// tasks or threads.
pub struct Pipeline {
    config: PipelineConfig,
    path: Arc<PublishPath>,
    transport: Transport,
    log: Arc<dyn LogStore>,
    subscribers_token: CancellationToken,
    drain_token: CancellationToken,
    log_task: Mutex<Option<JoinHandle<()>>>,
    forward_task: Mutex<Option<JoinHandle<()>>>,
    subscribers: Mutex<Vec<SubscriberHandle>>,
    next_subscriber: AtomicU64,
}

impl Pipeline {
    /// Start with defaults for every collaborator.
    pub async fn start(config: PipelineConfig) -> Result<Self, PipelineError> {
        PipelineBuilder::new(config).start().await
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Deliver `event` to the transport, then persist and forward it in
    /// the background.
    ///
    /// Blocks only for the bounded retry backoff. Returns `Closed` once
    /// `stop` has begun.
    pub fn publish(&self, event: &Event) -> Result<(), PublishError> {
        self.path.publish(event, true)
    }

    /// Start a subscriber loop on the pipeline's transport.
    pub fn subscribe<H: EventHandler>(&self, handler: H) -> Result<SubscriberHandle, PipelineError> {
        if self.path.stopping.load(Ordering::Acquire) {
            return Err(PipelineError::Stopped);
        }

        let n = self.next_subscriber.fetch_add(1, Ordering::Relaxed);
        let config = SubscriberConfig {
            name: format!("pipeline-sub-{}", n),
            fragment_limit: self.config.transport.fragment_limit,
            idle_sleep: self.config.idle_sleep(),
            ..SubscriberConfig::default()
        };
        let handle = spawn_subscriber(
            self.transport.subscription(),
            handler,
            config,
            self.subscribers_token.child_token(),
            Arc::clone(&self.path.metrics),
        )?;

        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handle.clone());
        Ok(handle)
    }

    /// Re-publish every logged event at or after `cutover`.
    ///
    /// Replayed events are forwarded again but not re-appended; they
    /// already sit in the log under the same key.
    pub async fn replay_since(&self, cutover: u64) -> Result<ReplayStats, ReplayError> {
        let path = Arc::clone(&self.path);
        let log = Arc::clone(&self.log);

        tokio::task::spawn_blocking(move || {
            replay_range(log.as_ref(), cutover, |event| {
                path.publish(event, false)?;
                path.metrics.record_replayed();
                Ok(())
            })
        })
        .await
        .map_err(|e| ReplayError::Aborted(e.to_string()))?
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.path.metrics.snapshot(self.path.publisher.is_connected())
    }

    pub fn log_stats(&self) -> Option<LogStats> {
        self.log.log_stats()
    }

    /// Evaluate `thresholds`, logging each breach.
    pub fn check_health(&self, thresholds: &AlertThresholds) -> Vec<Alert> {
        let alerts = self.path.metrics.check_thresholds(thresholds);
        for alert in &alerts {
            warn!(metric = %alert.metric, level = ?alert.level, "{}", alert.message);
        }
        alerts
    }

    pub fn is_stopping(&self) -> bool {
        self.path.stopping.load(Ordering::Acquire)
    }

    /// Shut down in order: refuse new publishes, stop subscriber loops,
    /// drain the workers within the grace period, close the log, close
    /// the transport, join subscriber threads.
    ///
    /// A second call returns immediately.
    pub async fn stop(&self) -> Result<(), PipelineError> {
        if self.path.stopping.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        info!("Pipeline stopping");

        self.subscribers_token.cancel();
        self.drain_token.cancel();

        let deadline = tokio::time::Instant::now() + self.config.shutdown_grace();
        let log_task = take(&self.log_task);
        let forward_task = take(&self.forward_task);
        if let Some(task) = log_task {
            let tx = self.path.log_tx.clone();
            drain_worker("log", task, deadline, || tx.max_capacity() - tx.capacity()).await;
        }
        if let Some(task) = forward_task {
            let forwarder = self.path.forwarder.clone();
            drain_worker("forward", task, deadline, || forwarder.pending()).await;
        }

        let mut result = Ok(());
        let log = Arc::clone(&self.log);
        match tokio::task::spawn_blocking(move || log.close()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                error!(error = %e, "Failed to close durable log");
                result = Err(PipelineError::Log(e));
            }
            Err(e) => result = Err(PipelineError::Task(e.to_string())),
        }

        self.path.publisher.close();
        self.transport.close();

        let subscribers = std::mem::take(
            &mut *self
                .subscribers
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        let joined = subscribers.len();
        if let Err(e) = tokio::task::spawn_blocking(move || subscribers.iter().for_each(|s| s.join())).await {
            result = result.and(Err(PipelineError::Task(e.to_string())));
        }

        let snapshot = self.metrics();
        info!(
            subscribers = joined,
            events_delivered = snapshot.events_delivered,
            log_appends = snapshot.log_appends,
            forwarded = snapshot.forwarded,
            "Pipeline stopped"
        );
        result
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        if !self.path.stopping.swap(true, Ordering::AcqRel) {
            warn!("Pipeline dropped without stop; background work abandoned");
            self.subscribers_token.cancel();
            self.drain_token.cancel();
            self.transport.close();
        }
    }
}

fn take(slot: &Mutex<Option<JoinHandle<()>>>) -> Option<JoinHandle<()>> {
    slot.lock().unwrap_or_else(PoisonError::into_inner).take()
}

/// Wait for a worker until `deadline`, aborting it after.
async fn drain_worker<F>(name: &'static str, mut task: JoinHandle<()>, deadline: tokio::time::Instant, pending: F)
where
    F: Fn() -> usize,
{
    match tokio::time::timeout_at(deadline, &mut task).await {
        Ok(Ok(())) => debug!(worker = name, "Worker drained"),
        Ok(Err(e)) => error!(worker = name, error = %e, "Worker task failed"),
        Err(_) => {
            let abandoned = pending();
            task.abort();
            warn!(worker = name, abandoned, "Shutdown grace elapsed; abandoning queued work");
        }
    }
}
