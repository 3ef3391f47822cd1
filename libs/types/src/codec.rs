//! Wire codec — fixed-shape binary encoding of an `Event`
//!
//! # Binary Format
//! ```text
//! [magic:      u8 = 0xE7]
//! [version:    u8 = 1]
//! [kind:       u8]
//! [symbol_len: u8][symbol: bytes]
//! [price:      16 bytes]   // rust_decimal serialized form, scale preserved
//! [volume:     u64]
//! [timestamp:  u64]
//! [checksum:   u32]        // CRC32C over every preceding byte
//! ```
//!
//! All integers are little-endian. The price keeps its exact decimal
//! representation so `decode(encode(e)) == e` holds bit for bit.

use crate::errors::CodecError;
use crate::event::{Event, EventKind, Symbol, MAX_SYMBOL_LEN};
use crc32c::crc32c;
use rust_decimal::Decimal;

pub const MAGIC: u8 = 0xE7;
pub const VERSION: u8 = 1;

/// Header bytes before the symbol: magic, version, kind, symbol_len.
const HEADER_LEN: usize = 4;
/// Fixed bytes after the symbol: price, volume, timestamp, checksum.
const TRAILER_LEN: usize = 16 + 8 + 8 + 4;
/// Encoded size of an event carrying the longest allowed symbol.
pub const MAX_ENCODED_LEN: usize = HEADER_LEN + MAX_SYMBOL_LEN + TRAILER_LEN;

/// Encoded size of an event.
pub fn encoded_len(event: &Event) -> usize {
    HEADER_LEN + event.symbol.as_bytes().len() + TRAILER_LEN
}

/// Serialize an event to the wire format.
pub fn encode(event: &Event) -> Vec<u8> {
    let symbol = event.symbol.as_bytes();
    let mut buf = Vec::with_capacity(encoded_len(event));
    buf.push(MAGIC);
    buf.push(VERSION);
    buf.push(event.kind.tag());
    // Symbol length is bounded by MAX_SYMBOL_LEN at construction.
    buf.push(symbol.len() as u8);
    buf.extend_from_slice(symbol);
    buf.extend_from_slice(&event.price.serialize());
    buf.extend_from_slice(&event.volume.to_le_bytes());
    buf.extend_from_slice(&event.timestamp.to_le_bytes());
    let checksum = crc32c(&buf);
    buf.extend_from_slice(&checksum.to_le_bytes());
    buf
}

/// Deserialize an event from the wire format.
///
/// Rejects truncated input, trailing bytes and checksum mismatches instead
/// of panicking.
pub fn decode(data: &[u8]) -> Result<Event, CodecError> {
    if data.len() < HEADER_LEN {
        return Err(CodecError::Truncated {
            need: HEADER_LEN,
            have: data.len(),
        });
    }
    if data[0] != MAGIC {
        return Err(CodecError::BadMagic(data[0]));
    }
    if data[1] != VERSION {
        return Err(CodecError::UnsupportedVersion(data[1]));
    }

    let symbol_len = data[3] as usize;
    let total = HEADER_LEN + symbol_len + TRAILER_LEN;
    if data.len() < total {
        return Err(CodecError::Truncated {
            need: total,
            have: data.len(),
        });
    }
    if data.len() > total {
        return Err(CodecError::TrailingBytes(data.len() - total));
    }

    let body_end = total - 4;
    let stored = u32::from_le_bytes(read_array(data, body_end));
    let computed = crc32c(&data[..body_end]);
    if stored != computed {
        return Err(CodecError::ChecksumMismatch { stored, computed });
    }

    let kind = EventKind::from_tag(data[2])?;

    let mut pos = HEADER_LEN;
    let symbol = std::str::from_utf8(&data[pos..pos + symbol_len])
        .map_err(|_| CodecError::InvalidUtf8)?;
    let symbol = Symbol::new(symbol)?;
    pos += symbol_len;

    let price = Decimal::deserialize(read_array(data, pos));
    pos += 16;

    let volume = u64::from_le_bytes(read_array(data, pos));
    pos += 8;

    let timestamp = u64::from_le_bytes(read_array(data, pos));

    Ok(Event {
        kind,
        symbol,
        price,
        volume,
        timestamp,
    })
}

/// Copy `N` bytes starting at `pos`; callers have already bounds-checked.
fn read_array<const N: usize>(data: &[u8], pos: usize) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&data[pos..pos + N]);
    out
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::str::FromStr;

    fn sample_event() -> Event {
        Event::tick(
            "AAPL",
            Decimal::from_str("150.25").unwrap(),
            1_000_000,
            1_700_000_000_000_000_000,
        )
        .unwrap()
    }

    #[test]
    fn test_encoded_len_matches_output() {
        let event = sample_event();
        assert_eq!(encode(&event).len(), encoded_len(&event));
        assert_eq!(encoded_len(&event), 4 + 4 + 36);

        let longest = Event::tick(&"Z".repeat(MAX_SYMBOL_LEN), Decimal::ONE, 1, 1).unwrap();
        assert_eq!(encode(&longest).len(), MAX_ENCODED_LEN);
    }

    #[test]
    fn test_decode_scenario_event() {
        let event = sample_event();
        let decoded = decode(&encode(&event)).unwrap();
        assert_eq!(decoded.symbol.as_str(), "AAPL");
        assert_eq!(decoded.price.to_string(), "150.25");
        assert_eq!(decoded.volume, 1_000_000);
        assert_eq!(decoded.timestamp, 1_700_000_000_000_000_000);
    }

    #[test]
    fn test_price_scale_preserved() {
        let mut event = sample_event();
        event.price = Decimal::from_str("150.2500").unwrap();
        let decoded = decode(&encode(&event)).unwrap();
        assert_eq!(decoded.price.scale(), 4);
        assert_eq!(decoded.price.serialize(), event.price.serialize());
    }

    #[test]
    fn test_decode_truncated() {
        let bytes = encode(&sample_event());
        for cut in [0, 3, 10, bytes.len() - 1] {
            match decode(&bytes[..cut]) {
                Err(CodecError::Truncated { have, .. }) => assert_eq!(have, cut),
                other => panic!("Expected Truncated at {}, got {:?}", cut, other),
            }
        }
    }

    #[test]
    fn test_decode_trailing_bytes() {
        let mut bytes = encode(&sample_event());
        bytes.push(0);
        assert_eq!(decode(&bytes), Err(CodecError::TrailingBytes(1)));
    }

    #[test]
    fn test_decode_bad_magic_and_version() {
        let mut bytes = encode(&sample_event());
        bytes[0] = 0x00;
        assert_eq!(decode(&bytes), Err(CodecError::BadMagic(0x00)));

        let mut bytes = encode(&sample_event());
        bytes[1] = 9;
        assert_eq!(decode(&bytes), Err(CodecError::UnsupportedVersion(9)));
    }

    #[test]
    fn test_decode_detects_tamper() {
        let mut bytes = encode(&sample_event());
        let volume_at = 4 + 4 + 16;
        bytes[volume_at] ^= 0xFF;
        assert!(matches!(
            decode(&bytes),
            Err(CodecError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_decode_unknown_kind_with_valid_checksum() {
        let mut bytes = encode(&sample_event());
        bytes[2] = 7;
        let body_end = bytes.len() - 4;
        let crc = crc32c(&bytes[..body_end]);
        bytes[body_end..].copy_from_slice(&crc.to_le_bytes());
        assert_eq!(decode(&bytes), Err(CodecError::UnknownKind(7)));
    }

    fn arb_event() -> impl Strategy<Value = Event> {
        (
            prop_oneof![
                Just(EventKind::Tick),
                Just(EventKind::Trade),
                Just(EventKind::OrderUpdate)
            ],
            "[A-Z0-9/._-]{1,32}",
            any::<i64>(),
            0u32..12,
            any::<u64>(),
            any::<u64>(),
        )
            .prop_map(|(kind, sym, mantissa, scale, volume, timestamp)| Event {
                kind,
                symbol: Symbol::new(sym).unwrap(),
                price: Decimal::new(mantissa, scale),
                volume,
                timestamp,
            })
    }

    proptest! {
        #[test]
        fn prop_decode_inverts_encode(event in arb_event()) {
            let bytes = encode(&event);
            let decoded = decode(&bytes).unwrap();
            prop_assert_eq!(decoded.price.serialize(), event.price.serialize());
            prop_assert_eq!(decoded, event);
        }

        #[test]
        fn prop_decode_never_panics(data in proptest::collection::vec(any::<u8>(), 0..96)) {
            let _ = decode(&data);
        }
    }
}
