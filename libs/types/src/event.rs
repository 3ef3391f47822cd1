//! Event definitions
//!
//! An `Event` is the unit of work flowing through the pipeline: one market
//! tick, trade print or order update. Events are immutable once built;
//! ownership moves into the pipeline on publish and only the encoded bytes
//! are shared afterwards.

use crate::errors::CodecError;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Maximum symbol length in bytes accepted by the codec.
pub const MAX_SYMBOL_LEN: usize = 32;

/// Validated instrument symbol (non-empty, at most `MAX_SYMBOL_LEN` bytes).
///
/// Only the first 8 bytes take part in the log key; longer symbols are
/// accepted but share key space with anything sharing that prefix.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Symbol(String);

impl Symbol {
    pub fn new(symbol: impl Into<String>) -> Result<Self, CodecError> {
        let symbol = symbol.into();
        if symbol.is_empty() {
            return Err(CodecError::EmptySymbol);
        }
        if symbol.len() > MAX_SYMBOL_LEN {
            return Err(CodecError::SymbolTooLong {
                len: symbol.len(),
                max: MAX_SYMBOL_LEN,
            });
        }
        Ok(Self(symbol))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl TryFrom<String> for Symbol {
    type Error = CodecError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Symbol> for String {
    fn from(symbol: Symbol) -> Self {
        symbol.0
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Event family carried by the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// Top-of-book or last-price market tick
    #[default]
    Tick,
    /// Executed trade print
    Trade,
    /// Order lifecycle update
    OrderUpdate,
}

impl EventKind {
    /// Wire tag for the codec.
    pub fn tag(self) -> u8 {
        match self {
            EventKind::Tick => 0,
            EventKind::Trade => 1,
            EventKind::OrderUpdate => 2,
        }
    }

    pub fn from_tag(tag: u8) -> Result<Self, CodecError> {
        match tag {
            0 => Ok(EventKind::Tick),
            1 => Ok(EventKind::Trade),
            2 => Ok(EventKind::OrderUpdate),
            other => Err(CodecError::UnknownKind(other)),
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            EventKind::Tick => "tick",
            EventKind::Trade => "trade",
            EventKind::OrderUpdate => "order_update",
        }
    }
}

/// A single market event.
///
/// `timestamp` is Unix nanoseconds, monotonic per producer but not across
/// producers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub kind: EventKind,
    pub symbol: Symbol,
    pub price: Decimal,
    pub volume: u64,
    pub timestamp: u64,
}

impl Event {
    pub fn new(kind: EventKind, symbol: Symbol, price: Decimal, volume: u64, timestamp: u64) -> Self {
        Self {
            kind,
            symbol,
            price,
            volume,
            timestamp,
        }
    }

    /// Convenience constructor for a market tick.
    pub fn tick(
        symbol: &str,
        price: Decimal,
        volume: u64,
        timestamp: u64,
    ) -> Result<Self, CodecError> {
        Ok(Self::new(
            EventKind::Tick,
            Symbol::new(symbol)?,
            price,
            volume,
            timestamp,
        ))
    }
}
