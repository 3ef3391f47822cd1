//! Fragment reassembly, keyed by publication session.

use std::collections::HashMap;

use tracing::warn;

use crate::transport::Fragment;

/// Default upper bound on a reassembled message.
pub const DEFAULT_MAX_MESSAGE_LEN: usize = 1024 * 1024;

pub struct FragmentAssembler {
    partial: HashMap<u32, Vec<u8>>,
    max_message_len: usize,
    dropped: u64,
}

impl FragmentAssembler {
    pub fn new(max_message_len: usize) -> Self {
        Self {
            partial: HashMap::new(),
            max_message_len,
            dropped: 0,
        }
    }

    /// Feed one fragment; returns a message once its END fragment arrives.
    ///
    /// A middle or END fragment with no BEGIN in progress is an orphan and
    /// is dropped, as is a message growing past `max_message_len`.
    pub fn on_fragment(&mut self, fragment: &Fragment) -> Option<Vec<u8>> {
        let session = fragment.session_id;

        if fragment.is_begin() {
            if self.partial.remove(&session).is_some() {
                self.drop_message(session, "new BEGIN before END");
            }
            if fragment.is_end() {
                return Some(fragment.payload.to_vec());
            }
            self.partial.insert(session, fragment.payload.to_vec());
            return None;
        }

        let Some(buffer) = self.partial.get_mut(&session) else {
            self.drop_message(session, "orphaned fragment");
            return None;
        };

        if buffer.len() + fragment.payload.len() > self.max_message_len {
            self.partial.remove(&session);
            self.drop_message(session, "message exceeds max length");
            return None;
        }
        buffer.extend_from_slice(&fragment.payload);

        if fragment.is_end() {
            self.partial.remove(&session)
        } else {
            None
        }
    }

    /// Messages discarded since creation.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Sessions with a message in progress.
    pub fn in_progress(&self) -> usize {
        self.partial.len()
    }

    fn drop_message(&mut self, session: u32, reason: &'static str) {
        self.dropped += 1;
        warn!(session, reason, "Dropped fragmented message");
    }
}

impl Default for FragmentAssembler {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_MESSAGE_LEN)
    }
}
