//! In-process low-latency transport
//!
//! A bounded, position-tracked log buffer shared by publications and
//! subscriptions. Messages are split into MTU-sized fragments flagged
//! BEGIN/END; subscribers reassemble them with a `FragmentAssembler`.
//!
//! Flow control works on byte positions:
//! - the publisher position advances by every fragment's framed length
//! - each subscription tracks its own consumed position
//! - an offer is refused with `BackPressured` when the distance between the
//!   publisher and the slowest subscription would exceed `capacity_bytes`
//! - crossing a `term_length` boundary triggers one `AdminAction` while the
//!   buffer drops fragments every subscription has consumed
//!
//! Offers made while no subscription is attached are accepted and
//! discarded: there is no polling subscriber to guarantee visibility to.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, info};

/// Framing overhead accounted per fragment.
pub const FRAGMENT_HEADER_LEN: usize = 8;

/// First fragment of a message.
pub const FLAG_BEGIN: u8 = 0x80;
/// Last fragment of a message.
pub const FLAG_END: u8 = 0x40;
/// A message that fits in one fragment.
pub const FLAG_UNFRAGMENTED: u8 = FLAG_BEGIN | FLAG_END;

// ── Offer Result ────────────────────────────────────────────────────

/// Outcome of a single offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OfferResult {
    /// Accepted; `position` is the publisher position after the message.
    Accepted { position: u64 },
    /// Slowest subscriber is too far behind. Retry.
    BackPressured,
    /// Channel housekeeping in progress. Retry.
    AdminAction,
    /// Channel shut down. Fatal.
    Closed,
    /// The position limit would be passed. Fatal.
    MaxPositionExceeded,
}

impl OfferResult {
    pub fn is_transient(&self) -> bool {
        matches!(self, OfferResult::BackPressured | OfferResult::AdminAction)
    }
}

/// Bytes a message of `message_len` occupies on a channel with `mtu`,
/// fragment headers included.
pub fn framed_len(message_len: usize, mtu: usize) -> u64 {
    let fragment_count = message_len.div_ceil(mtu.max(1)).max(1);
    (message_len + fragment_count * FRAGMENT_HEADER_LEN) as u64
}

/// The sending side of a transport channel.
pub trait Publisher: Send + Sync {
    fn offer(&self, message: &[u8]) -> OfferResult;

    /// Close the channel. Later offers return `Closed`.
    fn close(&self);

    /// Whether at least one subscription is attached to an open channel.
    fn is_connected(&self) -> bool;
}

// ── Configuration ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportConfig {
    /// Max bytes between the publisher and the slowest subscription.
    pub capacity_bytes: u64,
    /// Compaction interval in bytes of publisher position.
    pub term_length: u64,
    /// Largest fragment payload.
    pub mtu: usize,
    /// Publisher position limit.
    pub max_position: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            capacity_bytes: 4 * 1024 * 1024,
            term_length: 1024 * 1024,
            mtu: 1408,
            max_position: i64::MAX as u64,
        }
    }
}

// ── Fragment ────────────────────────────────────────────────────────

/// One unit on the channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    pub session_id: u32,
    pub flags: u8,
    pub payload: Arc<[u8]>,
}

impl Fragment {
    pub fn is_begin(&self) -> bool {
        self.flags & FLAG_BEGIN != 0
    }

    pub fn is_end(&self) -> bool {
        self.flags & FLAG_END != 0
    }

    fn framed_len(&self) -> u64 {
        (self.payload.len() + FRAGMENT_HEADER_LEN) as u64
    }
}

// ── Channel State ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
struct Cursor {
    /// Absolute index of the next fragment to read.
    next_index: u64,
    /// Bytes consumed, in publisher position units.
    position: u64,
}

struct Channel {
    config: TransportConfig,
    fragments: VecDeque<Fragment>,
    /// Absolute index of `fragments[0]`.
    base_index: u64,
    position: u64,
    /// Term for which the last `AdminAction` was issued.
    active_term: u64,
    cursors: BTreeMap<u64, Cursor>,
    next_subscription_id: u64,
    closed: bool,
}

impl Channel {
    fn tail_index(&self) -> u64 {
        self.base_index + self.fragments.len() as u64
    }

    fn slowest_position(&self) -> Option<u64> {
        self.cursors.values().map(|c| c.position).min()
    }

    /// Drop fragments every subscription has read.
    fn compact(&mut self) -> usize {
        let floor = self
            .cursors
            .values()
            .map(|c| c.next_index)
            .min()
            .unwrap_or_else(|| self.tail_index());
        let mut dropped = 0;
        while self.base_index < floor && self.fragments.pop_front().is_some() {
            self.base_index += 1;
            dropped += 1;
        }
        dropped
    }

    fn offer(&mut self, session_id: u32, message: &[u8]) -> OfferResult {
        if self.closed {
            return OfferResult::Closed;
        }

        let mtu = self.config.mtu.max(1);
        let fragment_count = message.len().div_ceil(mtu).max(1);
        let framed_len = framed_len(message.len(), mtu);

        let new_position = match self.position.checked_add(framed_len) {
            Some(p) if p <= self.config.max_position => p,
            _ => return OfferResult::MaxPositionExceeded,
        };

        if let Some(slowest) = self.slowest_position() {
            let window = self.position - slowest;
            if window + framed_len > self.config.capacity_bytes {
                return OfferResult::BackPressured;
            }
        }

        let target_term = new_position / self.config.term_length.max(1);
        if target_term > self.active_term {
            self.active_term = target_term;
            let dropped = self.compact();
            debug!(term = target_term, dropped, "Transport term rotation");
            return OfferResult::AdminAction;
        }

        if !self.cursors.is_empty() {
            if message.is_empty() {
                self.fragments.push_back(Fragment {
                    session_id,
                    flags: FLAG_UNFRAGMENTED,
                    payload: Arc::from(message),
                });
            } else {
                let last = fragment_count - 1;
                for (i, chunk) in message.chunks(mtu).enumerate() {
                    let mut flags = 0;
                    if i == 0 {
                        flags |= FLAG_BEGIN;
                    }
                    if i == last {
                        flags |= FLAG_END;
                    }
                    self.fragments.push_back(Fragment {
                        session_id,
                        flags,
                        payload: Arc::from(chunk),
                    });
                }
            }
        }

        self.position = new_position;
        OfferResult::Accepted {
            position: new_position,
        }
    }
}

type SharedChannel = Arc<Mutex<Channel>>;

fn lock(channel: &SharedChannel) -> MutexGuard<'_, Channel> {
    channel.lock().unwrap_or_else(PoisonError::into_inner)
}

// ── Transport ───────────────────────────────────────────────────────

/// Factory for publications and subscriptions on one channel.
#[derive(Clone)]
pub struct Transport {
    channel: SharedChannel,
    next_session: Arc<AtomicU32>,
}

impl Transport {
    pub fn new(config: TransportConfig) -> Self {
        Self {
            channel: Arc::new(Mutex::new(Channel {
                config,
                fragments: VecDeque::new(),
                base_index: 0,
                position: 0,
                active_term: 0,
                cursors: BTreeMap::new(),
                next_subscription_id: 0,
                closed: false,
            })),
            next_session: Arc::new(AtomicU32::new(1)),
        }
    }

    /// A new publication with its own session id.
    pub fn publication(&self) -> Publication {
        Publication {
            session_id: self.next_session.fetch_add(1, Ordering::Relaxed),
            channel: Arc::clone(&self.channel),
        }
    }

    /// A new subscription, starting at the current publisher position.
    pub fn subscription(&self) -> Subscription {
        let mut channel = lock(&self.channel);
        let id = channel.next_subscription_id;
        channel.next_subscription_id += 1;
        let cursor = Cursor {
            next_index: channel.tail_index(),
            position: channel.position,
        };
        channel.cursors.insert(id, cursor);
        debug!(subscription = id, position = cursor.position, "Subscription attached");

        Subscription {
            id,
            channel: Arc::clone(&self.channel),
        }
    }

    pub fn close(&self) {
        let mut channel = lock(&self.channel);
        if !channel.closed {
            channel.closed = true;
            info!(position = channel.position, "Transport closed");
        }
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.channel).closed
    }

    /// Current publisher position.
    pub fn position(&self) -> u64 {
        lock(&self.channel).position
    }

    pub fn subscriber_count(&self) -> usize {
        lock(&self.channel).cursors.len()
    }
}

// ── Publication ─────────────────────────────────────────────────────

pub struct Publication {
    session_id: u32,
    channel: SharedChannel,
}

impl Publication {
    pub fn session_id(&self) -> u32 {
        self.session_id
    }
}

impl Publisher for Publication {
    fn offer(&self, message: &[u8]) -> OfferResult {
        lock(&self.channel).offer(self.session_id, message)
    }

    fn close(&self) {
        let mut channel = lock(&self.channel);
        if !channel.closed {
            channel.closed = true;
            info!(session = self.session_id, position = channel.position, "Publication closed");
        }
    }

    fn is_connected(&self) -> bool {
        let channel = lock(&self.channel);
        !channel.closed && !channel.cursors.is_empty()
    }
}

// ── Subscription ────────────────────────────────────────────────────

/// The receiving side. Detaches from flow control on drop.
pub struct Subscription {
    id: u64,
    channel: SharedChannel,
}

impl Subscription {
    /// Hand up to `fragment_limit` pending fragments to `handler`.
    ///
    /// Never blocks waiting for data; returns the number of fragments
    /// delivered, zero when none are pending. The handler runs outside the
    /// channel lock.
    pub fn poll<F>(&self, mut handler: F, fragment_limit: usize) -> usize
    where
        F: FnMut(&Fragment),
    {
        let batch: Vec<Fragment> = {
            let mut channel = lock(&self.channel);
            let Some(cursor) = channel.cursors.get(&self.id).copied() else {
                return 0;
            };
            let start = cursor.next_index.saturating_sub(channel.base_index) as usize;
            let batch: Vec<Fragment> = channel
                .fragments
                .iter()
                .skip(start)
                .take(fragment_limit)
                .cloned()
                .collect();

            let consumed: u64 = batch.iter().map(Fragment::framed_len).sum();
            if let Some(c) = channel.cursors.get_mut(&self.id) {
                c.next_index += batch.len() as u64;
                c.position += consumed;
            }
            batch
        };

        for fragment in &batch {
            handler(fragment);
        }
        batch.len()
    }

    /// Whether the channel is closed and this subscription has read everything.
    pub fn is_drained_and_closed(&self) -> bool {
        let channel = lock(&self.channel);
        channel.closed
            && channel
                .cursors
                .get(&self.id)
                .map_or(true, |c| c.next_index >= channel.tail_index())
    }

    /// Consumed position of this subscription.
    pub fn position(&self) -> u64 {
        lock(&self.channel)
            .cursors
            .get(&self.id)
            .map_or(0, |c| c.position)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let mut channel = lock(&self.channel);
        channel.cursors.remove(&self.id);
        channel.compact();
    }
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn small() -> TransportConfig {
        TransportConfig {
            capacity_bytes: 256,
            term_length: 1 << 20,
            mtu: 32,
            max_position: 1 << 40,
        }
    }

    fn drain(sub: &Subscription) -> Vec<Fragment> {
        let mut out = Vec::new();
        while sub.poll(|f| out.push(f.clone()), 4) > 0 {}
        out
    }

    #[test]
    fn test_offer_without_subscribers_is_discarded() {
        let transport = Transport::new(small());
        let publication = transport.publication();
        assert!(!publication.is_connected());
        assert!(matches!(publication.offer(b"hello"), OfferResult::Accepted { .. }));

        // A later subscription starts at the tail and never sees it.
        let sub = transport.subscription();
        assert!(publication.is_connected());
        assert!(drain(&sub).is_empty());
    }

    #[test]
    fn test_single_fragment_delivery_in_order() {
        let transport = Transport::new(small());
        let publication = transport.publication();
        let sub = transport.subscription();

        for msg in [b"one".as_slice(), b"two", b"three"] {
            publication.offer(msg);
        }
        let got = drain(&sub);
        assert_eq!(got.len(), 3);
        assert!(got.iter().all(|f| f.flags == FLAG_UNFRAGMENTED));
        assert_eq!(&*got[2].payload, b"three");
        assert_eq!(got[0].session_id, publication.session_id());
    }

    #[test]
    fn test_large_message_fragmented_by_mtu() {
        let transport = Transport::new(small());
        let publication = transport.publication();
        let sub = transport.subscription();

        let message: Vec<u8> = (0..80u8).collect();
        match publication.offer(&message) {
            OfferResult::Accepted { position } => {
                assert_eq!(position, (80 + 3 * FRAGMENT_HEADER_LEN) as u64)
            }
            other => panic!("Unexpected result: {:?}", other),
        }

        let got = drain(&sub);
        assert_eq!(got.len(), 3);
        assert!(got[0].is_begin() && !got[0].is_end());
        assert_eq!(got[1].flags, 0);
        assert!(got[2].is_end() && !got[2].is_begin());
        let joined: Vec<u8> = got.iter().flat_map(|f| f.payload.iter().copied()).collect();
        assert_eq!(joined, message);
    }

    #[test]
    fn test_back_pressure_from_slow_subscriber() {
        let transport = Transport::new(small());
        let publication = transport.publication();
        let sub = transport.subscription();

        // Each offer frames to 32 + 8 = 40 bytes; 6 fit in 256.
        let msg = [7u8; 32];
        for _ in 0..6 {
            assert!(matches!(publication.offer(&msg), OfferResult::Accepted { .. }));
        }
        assert_eq!(publication.offer(&msg), OfferResult::BackPressured);

        assert_eq!(sub.poll(|_| {}, 1), 1);
        assert!(matches!(publication.offer(&msg), OfferResult::Accepted { .. }));
    }

    #[test]
    fn test_admin_action_once_per_term() {
        let config = TransportConfig {
            term_length: 100,
            ..small()
        };
        let transport = Transport::new(config);
        let publication = transport.publication();
        let sub = transport.subscription();

        let msg = [1u8; 32];
        assert!(matches!(publication.offer(&msg), OfferResult::Accepted { position: 40 }));
        assert!(matches!(publication.offer(&msg), OfferResult::Accepted { position: 80 }));
        drain(&sub);
        // Position 120 crosses the 100-byte term boundary.
        assert_eq!(publication.offer(&msg), OfferResult::AdminAction);
        assert!(matches!(publication.offer(&msg), OfferResult::Accepted { position: 120 }));
        assert_eq!(lock(&transport.channel).fragments.len(), 1);
    }

    #[test]
    fn test_max_position_exceeded() {
        let config = TransportConfig {
            max_position: 50,
            ..small()
        };
        let transport = Transport::new(config);
        let publication = transport.publication();
        assert!(matches!(publication.offer(&[0u8; 20]), OfferResult::Accepted { .. }));
        assert_eq!(publication.offer(&[0u8; 20]), OfferResult::MaxPositionExceeded);
    }

    #[test]
    fn test_closed_channel() {
        let transport = Transport::new(small());
        let publication = transport.publication();
        let sub = transport.subscription();
        publication.offer(b"last");
        publication.close();

        assert_eq!(publication.offer(b"late"), OfferResult::Closed);
        assert!(transport.is_closed());
        assert!(!sub.is_drained_and_closed());
        assert_eq!(drain(&sub).len(), 1);
        assert!(sub.is_drained_and_closed());
    }

    #[test]
    fn test_dropped_subscription_releases_flow_control() {
        let transport = Transport::new(small());
        let publication = transport.publication();
        let sub = transport.subscription();
        let msg = [0u8; 32];
        while publication.offer(&msg) != OfferResult::BackPressured {}
        drop(sub);
        assert_eq!(transport.subscriber_count(), 0);
        assert!(matches!(publication.offer(&msg), OfferResult::Accepted { .. }));
    }

    #[test]
    fn test_framed_len_counts_fragment_headers() {
        assert_eq!(framed_len(0, 32), FRAGMENT_HEADER_LEN as u64);
        assert_eq!(framed_len(32, 32), 32 + FRAGMENT_HEADER_LEN as u64);
        assert_eq!(framed_len(33, 32), 33 + 2 * FRAGMENT_HEADER_LEN as u64);
    }

    #[test]
    fn test_transient_results() {
        assert!(OfferResult::BackPressured.is_transient());
        assert!(OfferResult::AdminAction.is_transient());
        assert!(!OfferResult::Closed.is_transient());
        assert!(!OfferResult::Accepted { position: 0 }.is_transient());
    }

    #[test]
    fn test_poll_respects_fragment_limit() {
        let transport = Transport::new(small());
        let publication = transport.publication();
        let sub = transport.subscription();
        for _ in 0..5 {
            publication.offer(b"x");
        }
        assert_eq!(sub.poll(|_| {}, 2), 2);
        assert_eq!(sub.poll(|_| {}, 10), 3);
        assert_eq!(sub.poll(|_| {}, 10), 0);
        assert_eq!(sub.position(), transport.position());
    }

    mod props {
        use super::*;
        use crate::assembler::FragmentAssembler;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn fragmented_messages_reassemble(
                messages in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..600), 1..16)
            ) {
                let transport = Transport::new(TransportConfig {
                    capacity_bytes: 1 << 16,
                    ..small()
                });
                let publication = transport.publication();
                let sub = transport.subscription();
                let mut asm = FragmentAssembler::default();

                for msg in &messages {
                    let accepted = matches!(publication.offer(msg), OfferResult::Accepted { .. });
                    prop_assert!(accepted, "offer of {} bytes not accepted", msg.len());
                    let mut out = Vec::new();
                    while sub.poll(|f| out.extend(asm.on_fragment(f)), 8) > 0 {}
                    prop_assert_eq!(out, vec![msg.clone()]);
                }
                prop_assert_eq!(asm.in_progress(), 0);
            }
        }
    }
}

