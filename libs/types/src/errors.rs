//! Error types for event construction and the wire codec
//!
//! Codec failures are data-contract bugs: they are never retried.

use thiserror::Error;

/// Errors raised while validating or decoding an event
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("Symbol must not be empty")]
    EmptySymbol,

    #[error("Symbol too long: {len} bytes, maximum is {max}")]
    SymbolTooLong { len: usize, max: usize },

    #[error("Truncated frame: need {need} bytes, have {have}")]
    Truncated { need: usize, have: usize },

    #[error("Bad magic byte: {0:#04x}")]
    BadMagic(u8),

    #[error("Unsupported codec version: {0}")]
    UnsupportedVersion(u8),

    #[error("Unknown event kind tag: {0}")]
    UnknownKind(u8),

    #[error("Symbol is not valid UTF-8")]
    InvalidUtf8,

    #[error("Checksum mismatch: stored {stored:#010x}, computed {computed:#010x}")]
    ChecksumMismatch { stored: u32, computed: u32 },

    #[error("{0} trailing bytes after frame")]
    TrailingBytes(usize),
}
