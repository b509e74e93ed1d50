//! WebSocket gateway ingestors.
//!
//! Both protocols share the reconnect discipline: exponential backoff capped
//! at thirty seconds, at most ten consecutive attempts before the terminal
//! `error` state, and a shutdown signal checked at every suspension point so
//! `stop()` cancels timers mid-wait.

pub mod discord;
pub mod slack;

use std::time::Duration;

/// Consecutive reconnect attempts before giving up.
pub(crate) const MAX_RECONNECT_ATTEMPTS: u32 = 10;

/// Close code used for intentional disconnects (lets the server distinguish
/// our reconnects from failures).
pub(crate) const INTENTIONAL_CLOSE_CODE: u16 = 4000;

/// Backoff before reconnect attempt `attempt` (1-based):
/// `min(1000 * 2^attempt, 30_000)` milliseconds.
#[must_use]
pub(crate) fn reconnect_delay(attempt: u32) -> Duration {
    let millis = 1000u64
        .saturating_mul(1u64 << attempt.min(16))
        .min(30_000);
    Duration::from_millis(millis)
}

/// What the connection loop should do next.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Drive {
    /// Clean shutdown requested.
    Stopped,
    /// Unrecoverable; enter the terminal error state.
    Fatal(String),
    /// Reconnect; optionally discarding resume state first.
    Reconnect {
        /// Forget session/sequence so the next connect re-identifies.
        clear_session: bool,
        /// Treat the connection as healthy and reset the attempt counter.
        reset_attempts: bool,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_then_caps() {
        assert_eq!(reconnect_delay(1), Duration::from_millis(2000));
        assert_eq!(reconnect_delay(2), Duration::from_millis(4000));
        assert_eq!(reconnect_delay(3), Duration::from_millis(8000));
        assert_eq!(reconnect_delay(5), Duration::from_millis(30_000));
        assert_eq!(reconnect_delay(10), Duration::from_millis(30_000));
    }
}
