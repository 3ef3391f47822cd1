//! Recovery Replayer
//!
//! Re-drives every logged event at or after a cutover timestamp through a
//! publish function, in ascending key order. Delivery is at-least-once:
//! subscribers that saw an event before a restart see it again, so they
//! must be idempotent on `(symbol, timestamp)`.
//!
//! Best-effort: an event that exhausts its retries is counted and the scan
//! moves on. Only a fatal transport state or a log read failure aborts.

use std::time::{Duration, Instant};

use persistence::LogStore;
use serde::Serialize;
use tracing::{info, warn};
use types::codec;
use types::event::Event;
use types::key::LogKey;

use crate::error::{PublishError, ReplayError};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReplayStats {
    /// Entries read from the log.
    pub scanned: u64,
    /// Entries the transport accepted.
    pub republished: u64,
    /// Entries that exhausted the retry policy.
    pub failed: u64,
    /// Entries that did not decode.
    pub decode_errors: u64,
    pub elapsed: Duration,
}

/// Replay `[range_start(cutover), last key present now]` through `publish`.
///
/// Entries appended while the replay runs are not included.
pub fn replay_range<F>(
    store: &dyn LogStore,
    cutover: u64,
    mut publish: F,
) -> Result<ReplayStats, ReplayError>
where
    F: FnMut(&Event) -> Result<(), PublishError>,
{
    let started = Instant::now();
    let mut stats = ReplayStats::default();

    let Some(end) = store.last_key() else {
        info!(cutover, "Replay skipped: log is empty");
        return Ok(stats);
    };

    info!(cutover, end = %end, "Replay started");

    for entry in store.scan_range(LogKey::range_start(cutover), end) {
        let (key, value) = entry?;
        if key > end {
            break;
        }
        stats.scanned += 1;

        let event = match codec::decode(&value) {
            Ok(event) => event,
            Err(e) => {
                stats.decode_errors += 1;
                warn!(key = %key, error = %e, "Skipping undecodable log entry");
                continue;
            }
        };

        match publish(&event) {
            Ok(()) => stats.republished += 1,
            Err(e) if e.is_fatal() => {
                warn!(key = %key, error = %e, scanned = stats.scanned, "Replay aborted");
                return Err(ReplayError::Publish(e));
            }
            Err(e) => {
                stats.failed += 1;
                warn!(key = %key, error = %e, "Replay entry not delivered");
            }
        }
    }

    stats.elapsed = started.elapsed();
    info!(
        scanned = stats.scanned,
        republished = stats.republished,
        failed = stats.failed,
        decode_errors = stats.decode_errors,
        elapsed_ms = stats.elapsed.as_millis() as u64,
        "Replay complete"
    );
    Ok(stats)
}
