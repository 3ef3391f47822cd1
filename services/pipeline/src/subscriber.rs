//! Subscriber poll loop
//!
//! Runs on a dedicated thread: poll up to `fragment_limit` fragments,
//! reassemble, decode, hand each event to the application handler. An
//! empty poll sleeps `idle_sleep` before trying again. The cancellation
//! token is checked on every iteration and `poll` never blocks, so a stop
//! request is observed within one poll interval.

use std::io;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use types::codec;
use types::event::Event;

use crate::assembler::{FragmentAssembler, DEFAULT_MAX_MESSAGE_LEN};
use crate::metrics::PipelineMetrics;
use crate::transport::Subscription;

/// Application callback for delivered events.
///
/// An error is logged and counted; the loop keeps polling.
pub trait EventHandler: Send + 'static {
    fn on_event(&mut self, event: Event) -> anyhow::Result<()>;
}

impl<F> EventHandler for F
where
    F: FnMut(Event) -> anyhow::Result<()> + Send + 'static,
{
    fn on_event(&mut self, event: Event) -> anyhow::Result<()> {
        self(event)
    }
}

#[derive(Debug, Clone)]
pub struct SubscriberConfig {
    /// Thread name.
    pub name: String,
    pub fragment_limit: usize,
    pub idle_sleep: Duration,
    pub max_message_len: usize,
}

impl Default for SubscriberConfig {
    fn default() -> Self {
        Self {
            name: "pipeline-subscriber".to_string(),
            fragment_limit: 10,
            idle_sleep: Duration::from_micros(1),
            max_message_len: DEFAULT_MAX_MESSAGE_LEN,
        }
    }
}

/// Control handle for a running subscriber loop. Clones share the thread.
#[derive(Clone)]
pub struct SubscriberHandle {
    name: String,
    token: CancellationToken,
    thread: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl SubscriberHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Ask the loop to exit after its current iteration.
    pub fn stop(&self) {
        self.token.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Wait for the loop thread to exit. Later calls return immediately.
    pub fn join(&self) {
        let handle = self
            .thread
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                warn!(subscriber = %self.name, "Subscriber thread panicked");
            }
        }
    }
}

/// Start a poll loop for `subscription` on a new thread.
pub fn spawn_subscriber<H: EventHandler>(
    subscription: Subscription,
    handler: H,
    config: SubscriberConfig,
    token: CancellationToken,
    metrics: Arc<PipelineMetrics>,
) -> io::Result<SubscriberHandle> {
    let name = config.name.clone();
    let loop_token = token.clone();
    let thread = thread::Builder::new()
        .name(name.clone())
        .spawn(move || run_loop(subscription, handler, config, loop_token, metrics))?;

    Ok(SubscriberHandle {
        name,
        token,
        thread: Arc::new(Mutex::new(Some(thread))),
    })
}

fn run_loop<H: EventHandler>(
    subscription: Subscription,
    mut handler: H,
    config: SubscriberConfig,
    token: CancellationToken,
    metrics: Arc<PipelineMetrics>,
) {
    info!(subscriber = %config.name, "Subscriber loop started");
    let mut assembler = FragmentAssembler::new(config.max_message_len);
    let mut delivered = 0u64;

    while !token.is_cancelled() {
        let fragments = subscription.poll(
            |fragment| {
                let Some(message) = assembler.on_fragment(fragment) else {
                    return;
                };
                match codec::decode(&message) {
                    Ok(event) => {
                        metrics.record_received();
                        delivered += 1;
                        if let Err(e) = handler.on_event(event) {
                            metrics.record_handler_error();
                            warn!(subscriber = %config.name, error = %e, "Event handler failed");
                        }
                    }
                    Err(e) => {
                        metrics.record_decode_error();
                        warn!(subscriber = %config.name, error = %e, "Undecodable message");
                    }
                }
            },
            config.fragment_limit,
        );

        if fragments == 0 {
            if subscription.is_drained_and_closed() {
                debug!(subscriber = %config.name, "Transport closed and drained");
                break;
            }
            thread::sleep(config.idle_sleep);
        }
    }

    info!(
        subscriber = %config.name,
        delivered,
        dropped_messages = assembler.dropped(),
        "Subscriber loop stopped"
    );
}
