//! Types library for the durable event pipeline
//!
//! Core definitions shared by the durable log and the pipeline service:
//! the immutable `Event`, the 16-byte `LogKey` that orders log entries,
//! and the fixed-shape binary wire codec.
//!
//! # Modules
//! - `event`: Event, EventKind and the validated Symbol newtype
//! - `key`: LogKey (big-endian timestamp ++ 8-byte symbol prefix)
//! - `codec`: encode/decode of an Event to/from bytes
//! - `errors`: Codec error taxonomy

pub mod codec;
pub mod errors;
pub mod event;
pub mod key;

// Library version constant
pub const LIB_VERSION: &str = "1.0.0";

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::codec::{decode, encode};
    pub use crate::errors::*;
    pub use crate::event::*;
    pub use crate::key::*;
}
