//! Log key for the durable log
//!
//! Layout (16 bytes):
//! ```text
//! [0..8]   big-endian nanosecond timestamp
//! [8..16]  first 8 bytes of the symbol, zero padded
//! ```
//!
//! Byte-wise ordering of keys is timestamp ordering first, so a range scan
//! by time only needs to inspect the first 8 bytes. Symbols longer than 8
//! bytes are truncated and may collide within the same nanosecond.

use crate::event::Event;
use std::fmt;

pub const LOG_KEY_LEN: usize = 16;
pub const SYMBOL_PREFIX_LEN: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LogKey([u8; LOG_KEY_LEN]);

impl LogKey {
    pub fn new(timestamp: u64, symbol: &[u8]) -> Self {
        let mut key = [0u8; LOG_KEY_LEN];
        key[..8].copy_from_slice(&timestamp.to_be_bytes());
        let n = symbol.len().min(SYMBOL_PREFIX_LEN);
        key[8..8 + n].copy_from_slice(&symbol[..n]);
        Self(key)
    }

    /// Key under which an event is stored.
    pub fn for_event(event: &Event) -> Self {
        Self::new(event.timestamp, event.symbol.as_bytes())
    }

    /// Smallest key carrying `timestamp`.
    pub fn range_start(timestamp: u64) -> Self {
        Self::new(timestamp, &[])
    }

    /// Largest key carrying `timestamp`.
    pub fn range_end(timestamp: u64) -> Self {
        Self::new(timestamp, &[0xFF; SYMBOL_PREFIX_LEN])
    }

    pub fn from_bytes(bytes: [u8; LOG_KEY_LEN]) -> Self {
        Self(bytes)
    }

    /// Parse a key from a slice; `None` unless it is exactly 16 bytes.
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let arr: [u8; LOG_KEY_LEN] = bytes.try_into().ok()?;
        Some(Self(arr))
    }

    pub fn as_bytes(&self) -> &[u8; LOG_KEY_LEN] {
        &self.0
    }

    /// Timestamp component (decoded from the first 8 bytes only).
    pub fn timestamp(&self) -> u64 {
        let mut ts = [0u8; 8];
        ts.copy_from_slice(&self.0[..8]);
        u64::from_be_bytes(ts)
    }

    /// Raw 8-byte symbol component including zero padding.
    pub fn symbol_prefix(&self) -> &[u8] {
        &self.0[8..]
    }

    /// The next key in byte order, or `None` for the all-0xFF key.
    ///
    /// Used to resume a scan immediately after the last key it returned.
    pub fn successor(&self) -> Option<Self> {
        let mut next = self.0;
        for byte in next.iter_mut().rev() {
            if *byte == 0xFF {
                *byte = 0;
            } else {
                *byte += 1;
                return Some(Self(next));
            }
        }
        None
    }
}

impl fmt::Display for LogKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let prefix = self.symbol_prefix();
        let end = prefix.iter().position(|b| *b == 0).unwrap_or(prefix.len());
        write!(
            f,
            "{}:{}",
            self.timestamp(),
            String::from_utf8_lossy(&prefix[..end])
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rust_decimal::Decimal;

    #[test]
    fn test_key_layout_for_scenario_event() {
        let event = Event::tick("AAPL", Decimal::new(15025, 2), 1_000_000, 1_700_000_000_000_000_000)
            .unwrap();
        let key = LogKey::for_event(&event);

        let mut expected = Vec::new();
        expected.extend_from_slice(&1_700_000_000_000_000_000u64.to_be_bytes());
        expected.extend_from_slice(b"AAPL\0\0\0\0");
        assert_eq!(key.as_bytes().as_slice(), expected.as_slice());
        assert_eq!(key.timestamp(), 1_700_000_000_000_000_000);
        assert_eq!(key.to_string(), "1700000000000000000:AAPL");
    }

    #[test]
    fn test_long_symbols_truncate_and_collide() {
        let a = LogKey::new(42, b"AAPLUS_A1");
        let b = LogKey::new(42, b"AAPLUS_A2");
        assert_eq!(a, b);
        assert_eq!(a.symbol_prefix(), b"AAPLUS_A");
    }

    #[test]
    fn test_range_bounds_bracket_all_symbols() {
        let k = LogKey::new(100, b"ZZZZZZZZ");
        assert!(LogKey::range_start(100) <= k);
        assert!(k <= LogKey::range_end(100));
        assert!(LogKey::range_end(99) < LogKey::range_start(100));
    }

    #[test]
    fn test_successor_carries() {
        let k = LogKey::new(7, &[0xFF; 8]);
        let next = k.successor().unwrap();
        assert_eq!(next, LogKey::range_start(8));
        assert!(LogKey::from_bytes([0xFF; 16]).successor().is_none());
    }

    #[test]
    fn test_from_slice_length_checked() {
        assert!(LogKey::from_slice(&[0u8; 15]).is_none());
        assert!(LogKey::from_slice(&[0u8; 16]).is_some());
    }

    proptest! {
        #[test]
        fn prop_keys_follow_producer_timestamps(
            t1 in 0u64..u64::MAX,
            delta in 1u64..1_000_000,
            s1 in "[A-Z]{1,12}",
            s2 in "[A-Z]{1,12}",
        ) {
            let t2 = t1.saturating_add(delta);
            prop_assume!(t2 > t1);
            let k1 = LogKey::new(t1, s1.as_bytes());
            let k2 = LogKey::new(t2, s2.as_bytes());
            prop_assert!(k1 < k2);
        }

        #[test]
        fn prop_timestamp_component_roundtrips(ts in any::<u64>(), sym in "[A-Z]{1,8}") {
            let key = LogKey::new(ts, sym.as_bytes());
            prop_assert_eq!(key.timestamp(), ts);
        }
    }
}
