//! Publish-side retry with exponential backoff.
//!
//! The first offer is made immediately. On a transient refusal
//! (`BackPressured` / `AdminAction`) the caller sleeps `initial_backoff`,
//! doubling each time, and offers again, up to `max_retries` retries. With
//! the defaults (10 retries from 1 µs) the scheduled delay is
//! 1 + 2 + ... + 512 = 1023 µs.

use std::thread;
use std::time::Duration;

use crate::error::PublishError;
use crate::transport::{OfferResult, Publisher};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 10,
            initial_backoff: Duration::from_micros(1),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (0-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.initial_backoff * (1u32 << attempt.min(30))
    }

    /// Sum of every scheduled delay when all retries are used.
    pub fn total_backoff(&self) -> Duration {
        (0..self.max_retries).map(|i| self.backoff(i)).sum()
    }
}

/// A successful offer and how many retries it took.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Delivery {
    pub position: u64,
    pub retries: u32,
}

/// Offer `message`, retrying transient refusals per `policy`.
///
/// `on_retry` is called before each backoff sleep so the caller can count
/// retries. Fatal results are returned without further attempts.
pub fn offer_with_retry<P, F>(
    publisher: &P,
    message: &[u8],
    policy: &RetryPolicy,
    mut on_retry: F,
) -> Result<Delivery, PublishError>
where
    P: Publisher + ?Sized,
    F: FnMut(u32),
{
    let mut retries = 0;
    loop {
        match publisher.offer(message) {
            OfferResult::Accepted { position } => return Ok(Delivery { position, retries }),
            OfferResult::Closed => return Err(PublishError::Closed),
            OfferResult::MaxPositionExceeded => return Err(PublishError::MaxPositionExceeded),
            transient => {
                debug_assert!(transient.is_transient());
                if retries >= policy.max_retries {
                    return Err(PublishError::Exhausted { retries });
                }
                on_retry(retries);
                thread::sleep(policy.backoff(retries));
                retries += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;
    use std::time::Instant;

    /// Publisher that replays a scripted sequence of results.
    struct Scripted {
        results: Mutex<VecDeque<OfferResult>>,
        fallback: OfferResult,
        offers: AtomicU32,
    }

    impl Scripted {
        fn new(results: Vec<OfferResult>, fallback: OfferResult) -> Self {
            Self {
                results: Mutex::new(results.into()),
                fallback,
                offers: AtomicU32::new(0),
            }
        }
    }

    impl Publisher for Scripted {
        fn offer(&self, _message: &[u8]) -> OfferResult {
            self.offers.fetch_add(1, Ordering::SeqCst);
            self.results.lock().unwrap().pop_front().unwrap_or(self.fallback)
        }
        fn close(&self) {}
        fn is_connected(&self) -> bool {
            true
        }
    }

    #[test]
    fn test_backoff_schedule() {
        let policy = RetryPolicy::default();
        let delays: Vec<_> = (0..10).map(|i| policy.backoff(i).as_micros()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 32, 64, 128, 256, 512]);
        assert_eq!(policy.total_backoff(), Duration::from_micros(1023));
    }

    #[test]
    fn test_accepted_first_try() {
        let publisher = Scripted::new(vec![], OfferResult::Accepted { position: 64 });
        let delivery = offer_with_retry(&publisher, b"m", &RetryPolicy::default(), |_| {}).unwrap();
        assert_eq!(delivery, Delivery { position: 64, retries: 0 });
    }

    #[test]
    fn test_transient_then_accepted() {
        let publisher = Scripted::new(
            vec![OfferResult::BackPressured, OfferResult::AdminAction],
            OfferResult::Accepted { position: 128 },
        );
        let mut seen = Vec::new();
        let delivery =
            offer_with_retry(&publisher, b"m", &RetryPolicy::default(), |n| seen.push(n)).unwrap();
        assert_eq!(delivery.retries, 2);
        assert_eq!(seen, vec![0, 1]);
    }

    #[test]
    fn test_exhausted_after_ten_retries() {
        let publisher = Scripted::new(vec![], OfferResult::BackPressured);
        let start = Instant::now();
        let result = offer_with_retry(&publisher, b"m", &RetryPolicy::default(), |_| {});
        let elapsed = start.elapsed();

        assert_eq!(result, Err(PublishError::Exhausted { retries: 10 }));
        assert_eq!(publisher.offers.load(Ordering::SeqCst), 11);
        assert!(elapsed >= Duration::from_micros(1023), "elapsed {:?}", elapsed);
    }

    #[test]
    fn test_fatal_results_not_retried() {
        let publisher = Scripted::new(vec![OfferResult::BackPressured], OfferResult::Closed);
        let result = offer_with_retry(&publisher, b"m", &RetryPolicy::default(), |_| {});
        assert_eq!(result, Err(PublishError::Closed));
        assert_eq!(publisher.offers.load(Ordering::SeqCst), 2);

        let publisher = Scripted::new(vec![], OfferResult::MaxPositionExceeded);
        let result = offer_with_retry(&publisher, b"m", &RetryPolicy::default(), |_| {});
        assert_eq!(result, Err(PublishError::MaxPositionExceeded));
        assert_eq!(publisher.offers.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_zero_retries() {
        let publisher = Scripted::new(vec![], OfferResult::BackPressured);
        let policy = RetryPolicy {
            max_retries: 0,
            ..RetryPolicy::default()
        };
        let result = offer_with_retry(&publisher, b"m", &policy, |_| {});
        assert_eq!(result, Err(PublishError::Exhausted { retries: 0 }));
    }
}
