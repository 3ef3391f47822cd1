//! End-to-end pipeline tests: live delivery, persistence, replication,
//! retry bounds and recovery replay.

use std::collections::HashMap;
use std::io;
use std::str::FromStr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use persistence::log::BoxedScan;
use persistence::{DurableLog, LogError, LogRecord, LogStore};
use pipeline::broker::{Broker, BrokerError, MemoryBroker};
use pipeline::transport::{OfferResult, Publisher};
use pipeline::{Pipeline, PipelineBuilder, PipelineConfig, PublishError};
use rust_decimal::Decimal;
use tempfile::TempDir;
use types::codec;
use types::event::Event;
use types::key::LogKey;

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

fn config(tmp: &TempDir) -> PipelineConfig {
    PipelineConfig::with_log_dir(tmp.path())
}

fn tick(symbol: &str, ts: u64) -> Event {
    Event::tick(symbol, Decimal::new(10_000 + ts as i64, 2), 100, ts).unwrap()
}

/// Subscribe a handler that forwards every event into a channel.
fn collect_events(pipeline: &Pipeline) -> mpsc::Receiver<Event> {
    let (tx, rx) = mpsc::channel();
    pipeline
        .subscribe(move |event: Event| -> anyhow::Result<()> {
            tx.send(event)?;
            Ok(())
        })
        .unwrap();
    rx
}

// ── Test doubles ────────────────────────────────────────────────────

/// Log store whose writes always fail.
struct FailingLog;

impl LogStore for FailingLog {
    fn append(&self, _key: LogKey, _value: &[u8]) -> Result<(), LogError> {
        Err(LogError::IoFailure(io::Error::new(io::ErrorKind::Other, "disk on fire")))
    }

    fn append_batch(&self, _entries: &[LogRecord]) -> Result<(), LogError> {
        Err(LogError::IoFailure(io::Error::new(io::ErrorKind::Other, "disk on fire")))
    }

    fn scan_range(&self, _start: LogKey, _end: LogKey) -> BoxedScan<'_> {
        Box::new(std::iter::empty())
    }

    fn last_key(&self) -> Option<LogKey> {
        None
    }

    fn close(&self) -> Result<(), LogError> {
        Ok(())
    }
}

/// Transport that is always back-pressured.
#[derive(Default)]
struct StalledPublisher {
    offers: AtomicU32,
}

impl Publisher for StalledPublisher {
    fn offer(&self, _message: &[u8]) -> OfferResult {
        self.offers.fetch_add(1, Ordering::SeqCst);
        OfferResult::BackPressured
    }

    fn close(&self) {}

    fn is_connected(&self) -> bool {
        true
    }
}

/// Broker whose sends never complete.
struct HangingBroker;

#[async_trait]
impl Broker for HangingBroker {
    async fn send(&self, _topic: &str, _key: &[u8], _value: &[u8]) -> Result<(), BrokerError> {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Ok(())
    }
}

// ── Scenario ────────────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_aapl_scenario() {
    let tmp = TempDir::new().unwrap();
    let broker = Arc::new(MemoryBroker::new());
    let pipeline = PipelineBuilder::new(config(&tmp))
        .with_broker(broker.clone())
        .start()
        .await
        .unwrap();
    let events = collect_events(&pipeline);

    let event = Event::tick(
        "AAPL",
        Decimal::from_str("150.25").unwrap(),
        1_000_000,
        1_700_000_000_000_000_000,
    )
    .unwrap();
    assert_eq!(pipeline.publish(&event), Ok(()));

    let observed = events.recv_timeout(RECV_TIMEOUT).unwrap();
    assert_eq!(observed.symbol.as_str(), "AAPL");
    assert_eq!(observed.price, Decimal::from_str("150.25").unwrap());
    assert_eq!(observed.volume, 1_000_000);
    assert_eq!(observed.timestamp, 1_700_000_000_000_000_000);

    pipeline.stop().await.unwrap();
    assert!(events.try_recv().is_err(), "handler invoked more than once");

    let mut expected_key = 1_700_000_000_000_000_000u64.to_be_bytes().to_vec();
    expected_key.extend_from_slice(b"AAPL\0\0\0\0");

    let log = DurableLog::open(config(&tmp).log_config()).unwrap();
    let entries: Vec<_> = log
        .scan(LogKey::range_start(0), LogKey::range_end(u64::MAX))
        .map(|r| r.unwrap())
        .collect();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].0.as_bytes().as_slice(), expected_key.as_slice());
    assert_eq!(codec::decode(&entries[0].1).unwrap(), event);

    let sent = broker.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].topic, "market-data");
    assert_eq!(sent[0].key, expected_key);
}

// ── Publish path ────────────────────────────────────────────────────

#[tokio::test]
async fn test_retry_bound_when_always_back_pressured() {
    let tmp = TempDir::new().unwrap();
    let publisher = Arc::new(StalledPublisher::default());
    let broker = Arc::new(MemoryBroker::new());
    let pipeline = PipelineBuilder::new(config(&tmp))
        .with_publisher(publisher.clone())
        .with_broker(broker.clone())
        .start()
        .await
        .unwrap();

    let started = Instant::now();
    let result = pipeline.publish(&tick("AAPL", 1));
    let elapsed = started.elapsed();

    assert_eq!(result, Err(PublishError::Exhausted { retries: 10 }));
    assert_eq!(publisher.offers.load(Ordering::SeqCst), 11);
    assert!(elapsed >= Duration::from_micros(1023), "elapsed {:?}", elapsed);

    pipeline.stop().await.unwrap();
    let snap = pipeline.metrics();
    assert_eq!(snap.publish_failures, 1);
    assert_eq!(snap.offer_retries, 10);
    assert_eq!(snap.events_delivered, 0);
    assert_eq!(snap.log_appends, 0);
    assert!(broker.is_empty(), "refused events must not be forwarded");
    assert_eq!(pipeline.log_stats().unwrap().entries, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_log_failure_does_not_fail_publish() {
    let tmp = TempDir::new().unwrap();
    let pipeline = PipelineBuilder::new(config(&tmp))
        .with_log(Arc::new(FailingLog))
        .start()
        .await
        .unwrap();
    let events = collect_events(&pipeline);

    assert_eq!(pipeline.publish(&tick("AAPL", 5)), Ok(()));
    assert_eq!(events.recv_timeout(RECV_TIMEOUT).unwrap().timestamp, 5);

    pipeline.stop().await.unwrap();
    let snap = pipeline.metrics();
    assert_eq!(snap.events_delivered, 1);
    assert_eq!(snap.log_failures, 1);
    assert_eq!(snap.log_appends, 0);
    assert_eq!(snap.forwarded, 1);
    assert!(pipeline.log_stats().is_none());
}

#[tokio::test]
async fn test_forward_failure_counted_not_retried() {
    let tmp = TempDir::new().unwrap();
    let broker = Arc::new(MemoryBroker::new());
    broker.fail_next(1);
    let pipeline = PipelineBuilder::new(config(&tmp))
        .with_broker(broker.clone())
        .start()
        .await
        .unwrap();

    assert_eq!(pipeline.publish(&tick("AAPL", 1)), Ok(()));
    assert_eq!(pipeline.publish(&tick("AAPL", 2)), Ok(()));
    pipeline.stop().await.unwrap();

    let snap = pipeline.metrics();
    assert_eq!(snap.forward_failures, 1);
    assert_eq!(snap.forwarded, 1);
    assert_eq!(snap.log_appends, 2);
    assert_eq!(broker.len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_concurrent_producers_keep_per_producer_order() {
    let tmp = TempDir::new().unwrap();
    let pipeline = Arc::new(Pipeline::start(config(&tmp)).await.unwrap());
    let events = collect_events(&pipeline);

    let producers: Vec<_> = (0..4)
        .map(|p| {
            let pipeline = Arc::clone(&pipeline);
            std::thread::spawn(move || {
                let symbol = format!("P{}", p);
                for ts in 1..=250u64 {
                    pipeline.publish(&tick(&symbol, ts)).unwrap();
                }
            })
        })
        .collect();
    for producer in producers {
        producer.join().unwrap();
    }

    let mut last_seen: HashMap<String, u64> = HashMap::new();
    for _ in 0..1000 {
        let event = events.recv_timeout(RECV_TIMEOUT).unwrap();
        let last = last_seen.entry(event.symbol.to_string()).or_insert(0);
        assert!(event.timestamp > *last, "out of order for {}", event.symbol);
        *last = event.timestamp;
    }
    assert!(last_seen.values().all(|ts| *ts == 250));

    pipeline.stop().await.unwrap();
    assert_eq!(pipeline.metrics().log_appends, 1000);
    assert_eq!(pipeline.log_stats().unwrap().entries, 1000);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stop_abandons_stuck_forwards_after_grace() {
    let tmp = TempDir::new().unwrap();
    let mut cfg = config(&tmp);
    cfg.shutdown_grace_ms = 100;
    let pipeline = PipelineBuilder::new(cfg)
        .with_broker(Arc::new(HangingBroker))
        .start()
        .await
        .unwrap();

    for ts in 1..=5 {
        pipeline.publish(&tick("AAPL", ts)).unwrap();
    }

    let started = Instant::now();
    pipeline.stop().await.unwrap();
    let elapsed = started.elapsed();

    assert!(elapsed >= Duration::from_millis(100), "stop took {:?}", elapsed);
    assert!(elapsed < Duration::from_secs(2), "stop took {:?}", elapsed);

    let snap = pipeline.metrics();
    assert_eq!(snap.events_delivered, 5);
    assert_eq!(snap.log_appends, 5, "log is drained before the forwarder");
    assert!(snap.forwarded < 5);
    assert_eq!(pipeline.log_stats().unwrap().entries, 5);
}

// ── Recovery ────────────────────────────────────────────────────────

/// Write events at the given timestamps through a pipeline and stop it.
async fn seed_log(tmp: &TempDir, stamps: &[u64]) {
    let pipeline = Pipeline::start(config(tmp)).await.unwrap();
    for ts in stamps {
        pipeline.publish(&tick("AAPL", *ts)).unwrap();
    }
    pipeline.stop().await.unwrap();
    assert_eq!(pipeline.metrics().log_appends, stamps.len() as u64);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_replay_since_filters_by_cutover() {
    let tmp = TempDir::new().unwrap();
    seed_log(&tmp, &[100, 200, 300]).await;

    let broker = Arc::new(MemoryBroker::new());
    let pipeline = PipelineBuilder::new(config(&tmp))
        .with_broker(broker.clone())
        .start()
        .await
        .unwrap();
    let events = collect_events(&pipeline);

    let stats = pipeline.replay_since(200).await.unwrap();
    assert_eq!(stats.scanned, 2);
    assert_eq!(stats.republished, 2);
    assert_eq!(stats.failed, 0);

    assert_eq!(events.recv_timeout(RECV_TIMEOUT).unwrap().timestamp, 200);
    assert_eq!(events.recv_timeout(RECV_TIMEOUT).unwrap().timestamp, 300);

    pipeline.stop().await.unwrap();
    let snap = pipeline.metrics();
    assert_eq!(snap.events_replayed, 2);
    assert_eq!(snap.log_appends, 0, "replayed events are not re-appended");
    assert_eq!(broker.len(), 2, "replayed events are forwarded again");
    assert_eq!(pipeline.log_stats().unwrap().entries, 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_replaying_twice_delivers_twice() {
    let tmp = TempDir::new().unwrap();
    seed_log(&tmp, &[10, 20]).await;

    let pipeline = Pipeline::start(config(&tmp)).await.unwrap();
    let events = collect_events(&pipeline);

    pipeline.replay_since(0).await.unwrap();
    pipeline.replay_since(0).await.unwrap();

    let seen: Vec<u64> = (0..4)
        .map(|_| events.recv_timeout(RECV_TIMEOUT).unwrap().timestamp)
        .collect();
    assert_eq!(seen, vec![10, 20, 10, 20]);

    pipeline.stop().await.unwrap();
    assert_eq!(pipeline.metrics().events_received, 4);
}

#[tokio::test]
async fn test_replay_after_stop_aborts() {
    let tmp = TempDir::new().unwrap();
    seed_log(&tmp, &[1, 2]).await;

    let pipeline = Pipeline::start(config(&tmp)).await.unwrap();
    pipeline.stop().await.unwrap();
    assert!(pipeline.replay_since(0).await.is_err());
}
