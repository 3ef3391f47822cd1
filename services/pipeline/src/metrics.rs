//! Pipeline metrics
//!
//! Atomic counters owned by one coordinator, read through a serializable
//! snapshot. Tracks acceptance latency, retries, and the health of the
//! asynchronous log and replication stages, whose failures are only
//! observable here.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use serde::Serialize;

/// Counters for one pipeline instance.
#[derive(Default)]
pub struct PipelineMetrics {
    // Publish path
    pub events_accepted: AtomicU64,
    pub events_delivered: AtomicU64,
    pub publish_failures: AtomicU64,
    pub offer_retries: AtomicU64,
    pub total_accept_latency_ns: AtomicU64,
    pub max_accept_latency_ns: AtomicU64,
    accept_latency: Mutex<LatencyTracker>,

    // Durable log
    pub log_appends: AtomicU64,
    pub log_failures: AtomicU64,
    pub log_dropped: AtomicU64,

    // Replication
    pub forwarded: AtomicU64,
    pub forward_failures: AtomicU64,
    pub forward_dropped: AtomicU64,

    // Subscribers
    pub events_received: AtomicU64,
    pub handler_errors: AtomicU64,
    pub decode_errors: AtomicU64,

    // Recovery
    pub events_replayed: AtomicU64,
}

impl PipelineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// An event was encoded and is about to be offered.
    pub fn record_accepted(&self) {
        self.events_accepted.fetch_add(1, Ordering::Relaxed);
    }

    /// The transport accepted an event `latency_ns` after `publish` began.
    pub fn record_delivered(&self, latency_ns: u64) {
        self.events_delivered.fetch_add(1, Ordering::Relaxed);
        self.total_accept_latency_ns.fetch_add(latency_ns, Ordering::Relaxed);
        self.max_accept_latency_ns.fetch_max(latency_ns, Ordering::Relaxed);
        // Skip the sample rather than wait on a contended tracker.
        if let Ok(mut tracker) = self.accept_latency.try_lock() {
            tracker.record(latency_ns);
        }
    }

    pub fn record_publish_failure(&self) {
        self.publish_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_offer_retry(&self) {
        self.offer_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_log_appends(&self, n: u64) {
        self.log_appends.fetch_add(n, Ordering::Relaxed);
    }

    pub fn record_log_failures(&self, n: u64) {
        self.log_failures.fetch_add(n, Ordering::Relaxed);
    }

    pub fn record_log_dropped(&self) {
        self.log_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_forwarded(&self) {
        self.forwarded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_forward_failure(&self) {
        self.forward_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_forward_dropped(&self) {
        self.forward_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_received(&self) {
        self.events_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_handler_error(&self) {
        self.handler_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_decode_error(&self) {
        self.decode_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_replayed(&self) {
        self.events_replayed.fetch_add(1, Ordering::Relaxed);
    }

    /// Point-in-time copy of every counter.
    pub fn snapshot(&self, transport_connected: bool) -> MetricsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        let delivered = load(&self.events_delivered);
        let total_latency = load(&self.total_accept_latency_ns);
        let p99_accept_latency_ns = self
            .accept_latency
            .lock()
            .ok()
            .and_then(|t| t.percentile(99))
            .unwrap_or(0);

        MetricsSnapshot {
            events_accepted: load(&self.events_accepted),
            events_delivered: delivered,
            publish_failures: load(&self.publish_failures),
            offer_retries: load(&self.offer_retries),
            total_accept_latency_ns: total_latency,
            max_accept_latency_ns: load(&self.max_accept_latency_ns),
            avg_accept_latency_us: if delivered == 0 {
                0.0
            } else {
                total_latency as f64 / delivered as f64 / 1_000.0
            },
            p99_accept_latency_ns,
            log_appends: load(&self.log_appends),
            log_failures: load(&self.log_failures),
            log_dropped: load(&self.log_dropped),
            forwarded: load(&self.forwarded),
            forward_failures: load(&self.forward_failures),
            forward_dropped: load(&self.forward_dropped),
            events_received: load(&self.events_received),
            handler_errors: load(&self.handler_errors),
            decode_errors: load(&self.decode_errors),
            events_replayed: load(&self.events_replayed),
            transport_connected,
        }
    }

    /// Check alert thresholds against current counters.
    pub fn check_thresholds(&self, thresholds: &AlertThresholds) -> Vec<Alert> {
        let mut alerts = Vec::new();
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);

        let failures = load(&self.publish_failures);
        if failures > thresholds.max_publish_failures {
            alerts.push(Alert {
                level: AlertLevel::Critical,
                metric: "publish_failures".to_string(),
                message: format!(
                    "Publish failures: {} > threshold {}",
                    failures, thresholds.max_publish_failures
                ),
            });
        }

        let lost = load(&self.log_failures) + load(&self.log_dropped);
        if lost > thresholds.max_log_losses {
            alerts.push(Alert {
                level: AlertLevel::Critical,
                metric: "log_losses".to_string(),
                message: format!(
                    "Events not persisted: {} > threshold {}",
                    lost, thresholds.max_log_losses
                ),
            });
        }

        let unreplicated = load(&self.forward_failures) + load(&self.forward_dropped);
        if unreplicated > thresholds.max_forward_losses {
            alerts.push(Alert {
                level: AlertLevel::Warning,
                metric: "forward_losses".to_string(),
                message: format!(
                    "Events not replicated: {} > threshold {}",
                    unreplicated, thresholds.max_forward_losses
                ),
            });
        }

        if let Ok(tracker) = self.accept_latency.lock() {
            if let Some(p99) = tracker.percentile(99) {
                if p99 > thresholds.max_accept_p99_ns {
                    alerts.push(Alert {
                        level: AlertLevel::Warning,
                        metric: "accept_latency_p99".to_string(),
                        message: format!(
                            "Accept latency p99: {}ns > threshold {}ns",
                            p99, thresholds.max_accept_p99_ns
                        ),
                    });
                }
            }
        }

        alerts
    }
}

/// Serializable copy of the counters plus derived values.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub events_accepted: u64,
    pub events_delivered: u64,
    pub publish_failures: u64,
    pub offer_retries: u64,
    pub total_accept_latency_ns: u64,
    pub max_accept_latency_ns: u64,
    pub avg_accept_latency_us: f64,
    pub p99_accept_latency_ns: u64,
    pub log_appends: u64,
    pub log_failures: u64,
    pub log_dropped: u64,
    pub forwarded: u64,
    pub forward_failures: u64,
    pub forward_dropped: u64,
    pub events_received: u64,
    pub handler_errors: u64,
    pub decode_errors: u64,
    pub events_replayed: u64,
    pub transport_connected: bool,
}

// ── Latency Tracker ─────────────────────────────────────────────────

const LATENCY_WINDOW: usize = 1024;

/// Sliding window of latency samples for percentile calculation.
pub struct LatencyTracker {
    samples: VecDeque<u64>,
    max_samples: usize,
}

impl LatencyTracker {
    pub fn new(max_samples: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(max_samples),
            max_samples,
        }
    }

    pub fn record(&mut self, value: u64) {
        if self.samples.len() >= self.max_samples {
            self.samples.pop_front();
        }
        self.samples.push_back(value);
    }

    /// Percentile value (0-100).
    pub fn percentile(&self, p: usize) -> Option<u64> {
        if self.samples.is_empty() {
            return None;
        }

        let mut sorted: Vec<u64> = self.samples.iter().copied().collect();
        sorted.sort_unstable();

        let idx = (p as f64 / 100.0 * (sorted.len() - 1) as f64) as usize;
        Some(sorted[idx.min(sorted.len() - 1)])
    }

    pub fn average(&self) -> Option<u64> {
        if self.samples.is_empty() {
            return None;
        }
        let sum: u64 = self.samples.iter().sum();
        Some(sum / self.samples.len() as u64)
    }

    pub fn count(&self) -> usize {
        self.samples.len()
    }
}

impl Default for LatencyTracker {
    fn default() -> Self {
        Self::new(LATENCY_WINDOW)
    }
}

// ── Alerts ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum AlertLevel {
    Warning,
    Critical,
}

/// An alert triggered by a threshold breach.
#[derive(Debug, Clone, Serialize)]
pub struct Alert {
    pub level: AlertLevel,
    pub metric: String,
    pub message: String,
}

/// Health-check thresholds.
#[derive(Debug, Clone)]
pub struct AlertThresholds {
    pub max_publish_failures: u64,
    /// Log failures plus queue drops.
    pub max_log_losses: u64,
    /// Forward failures plus queue drops.
    pub max_forward_losses: u64,
    pub max_accept_p99_ns: u64,
}

impl Default for AlertThresholds {
    fn default() -> Self {
        Self {
            max_publish_failures: 0,
            max_log_losses: 0,
            max_forward_losses: 100,
            max_accept_p99_ns: 1_000_000, // 1ms
        }
    }
}
