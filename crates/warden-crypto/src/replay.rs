//! Sliding-window anti-replay for received frame counters.
//!
//! The window is split into a pre-decryption check and a post-decryption
//! commit so that forged frames can never mutate window state: only a frame
//! that authenticated under the session key advances `max_counter` or lands
//! in the seen set.

use std::collections::BTreeSet;

use crate::CryptoError;

/// Width of the acceptance window, in counters.
///
/// This is part of the wire contract, not an implementation detail: a peer
/// that reorders delivery by more than this many frames will have the older
/// frames rejected as too old.
pub const REPLAY_WINDOW: u64 = 256;

/// Receive-side replay state.
#[derive(Debug, Default)]
pub struct ReplayWindow {
    /// Highest authenticated counter, `None` until the first accept.
    max_counter: Option<u64>,
    /// Counters accepted within the current window.
    seen: BTreeSet<u64>,
}

impl ReplayWindow {
    /// Create an empty window.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Check a counter before attempting decryption.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::CounterTooOld`] when the counter has fallen out
    /// of the window, or [`CryptoError::DuplicateCounter`] when it was
    /// already accepted once.
    pub fn precheck(&self, counter: u64) -> Result<(), CryptoError> {
        if let Some(max) = self.max_counter {
            if counter + REPLAY_WINDOW <= max {
                return Err(CryptoError::CounterTooOld(counter));
            }
        }
        if self.seen.contains(&counter) {
            return Err(CryptoError::DuplicateCounter(counter));
        }
        Ok(())
    }

    /// Record a counter after its frame authenticated.
    pub fn commit(&mut self, counter: u64) {
        if self.max_counter.map_or(true, |max| counter > max) {
            self.max_counter = Some(counter);
            // Drop entries at or below counter - WINDOW; they can no longer
            // pass precheck anyway.
            if counter >= REPLAY_WINDOW {
                self.seen = self.seen.split_off(&(counter - REPLAY_WINDOW + 1));
            }
        }
        self.seen.insert(counter);
    }

    /// Highest authenticated counter so far.
    #[must_use]
    pub fn max_counter(&self) -> Option<u64> {
        self.max_counter
    }
}
