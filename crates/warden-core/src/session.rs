//! Session lifecycle: pending handshakes, active sessions, TTL sweeps, and
//! per-session rate limiting.
//!
//! Both tables are keyed by the HKDF-derived session ID. A background sweep
//! drops idle sessions and stale pending handshakes; the per-session rate
//! limiter is a fixed 60-second window.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tracing::{info, warn};
use warden_crypto::EncryptedChannel;

use crate::route::ResolvedRoute;

/// Idle sessions older than this are dropped.
pub const SESSION_TTL: Duration = Duration::from_secs(30 * 60);

/// Pending handshakes older than this are dropped.
pub const HANDSHAKE_TTL: Duration = Duration::from_secs(30);

/// Cadence of the background sweep.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Width of the rate-limit window.
pub const RATE_WINDOW: Duration = Duration::from_secs(60);

struct RateWindow {
    window_start: Instant,
    window_requests: u32,
}

/// An active encrypted session with one caller.
///
/// The channel sits behind an async mutex held for the whole of
/// decrypt → dispatch → encrypt, which serializes sends and keeps counters
/// monotone.
pub struct Session {
    /// The encrypted channel; one in-flight request at a time.
    pub channel: tokio::sync::Mutex<EncryptedChannel>,
    /// Which caller this session authenticated as. Fixed at init.
    pub caller_alias: String,
    /// Routes pinned at handshake time.
    pub routes: Vec<ResolvedRoute>,
    /// When the session was established.
    pub created_at: Instant,
    last_activity: parking_lot::Mutex<Instant>,
    request_count: AtomicU64,
    rate: parking_lot::Mutex<RateWindow>,
}

impl Session {
    /// Wrap a freshly promoted channel.
    #[must_use]
    pub fn new(channel: EncryptedChannel, caller_alias: String, routes: Vec<ResolvedRoute>) -> Self {
        let now = Instant::now();
        Self {
            channel: tokio::sync::Mutex::new(channel),
            caller_alias,
            routes,
            created_at: now,
            last_activity: parking_lot::Mutex::new(now),
            request_count: AtomicU64::new(0),
            rate: parking_lot::Mutex::new(RateWindow {
                window_start: now,
                window_requests: 0,
            }),
        }
    }

    /// Record activity (bumps the idle clock and the request counter).
    pub fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
        self.request_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Time since the last request.
    #[must_use]
    pub fn idle_for(&self) -> Duration {
        self.last_activity.lock().elapsed()
    }

    /// Total requests served.
    #[must_use]
    pub fn request_count(&self) -> u64 {
        self.request_count.load(Ordering::Relaxed)
    }

    /// Fixed-window rate check: reset the window if it elapsed, then count.
    /// Returns `false` when the budget for this window is spent.
    pub fn check_rate_limit(&self, limit: u32) -> bool {
        let mut rate = self.rate.lock();
        if rate.window_start.elapsed() >= RATE_WINDOW {
            rate.window_start = Instant::now();
            rate.window_requests = 0;
        }
        rate.window_requests += 1;
        rate.window_requests <= limit
    }
}

/// A handshake that produced a Reply but has not seen its Finish yet.
pub struct PendingHandshake {
    /// Channel derived at init; promoted into the session on Finish.
    pub channel: EncryptedChannel,
    /// The authorized peer the Init authenticated as.
    pub caller_alias: String,
    /// Routes resolved for the caller at init.
    pub routes: Vec<ResolvedRoute>,
    /// When the Reply was emitted.
    pub created_at: Instant,
}

/// Owns the session and pending-handshake tables.
pub struct SessionManager {
    sessions: DashMap<String, Arc<Session>>,
    pending: DashMap<String, PendingHandshake>,
    rate_limit_per_minute: u32,
    session_ttl: Duration,
    handshake_ttl: Duration,
}

impl SessionManager {
    /// Create a manager with the default TTLs.
    #[must_use]
    pub fn new(rate_limit_per_minute: u32) -> Self {
        Self::with_ttls(rate_limit_per_minute, SESSION_TTL, HANDSHAKE_TTL)
    }

    /// Create a manager with explicit TTLs (tests shrink them).
    #[must_use]
    pub fn with_ttls(
        rate_limit_per_minute: u32,
        session_ttl: Duration,
        handshake_ttl: Duration,
    ) -> Self {
        Self {
            sessions: DashMap::new(),
            pending: DashMap::new(),
            rate_limit_per_minute,
            session_ttl,
            handshake_ttl,
        }
    }

    /// Park a handshake between Reply and Finish.
    pub fn insert_pending(&self, session_id: String, pending: PendingHandshake) {
        self.pending.insert(session_id, pending);
    }

    /// Claim a pending handshake (Finish arrived, or giving up).
    pub fn take_pending(&self, session_id: &str) -> Option<PendingHandshake> {
        self.pending.remove(session_id).map(|(_, p)| p)
    }

    /// Activate a session under its ID.
    pub fn insert_session(&self, session_id: String, session: Session) -> Arc<Session> {
        let session = Arc::new(session);
        self.sessions.insert(session_id, Arc::clone(&session));
        session
    }

    /// Look up an active session.
    #[must_use]
    pub fn get(&self, session_id: &str) -> Option<Arc<Session>> {
        self.sessions.get(session_id).map(|s| Arc::clone(&s))
    }

    /// Destroy a session (channel broken or caller misbehaving).
    pub fn remove(&self, session_id: &str) {
        if let Some((_, session)) = self.sessions.remove(session_id) {
            info!(
                session_id,
                caller = session.caller_alias.as_str(),
                "session destroyed"
            );
        }
    }

    /// Number of active sessions.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.sessions.len()
    }

    /// Apply the per-session fixed-window limit.
    pub fn check_rate_limit(&self, session: &Session) -> bool {
        let allowed = session.check_rate_limit(self.rate_limit_per_minute);
        if !allowed {
            warn!(
                event = "rate_limited",
                caller = session.caller_alias.as_str(),
                limit = self.rate_limit_per_minute,
                "session exceeded its request budget"
            );
        }
        allowed
    }

    /// Drop expired sessions and stale pending handshakes. Returns
    /// `(sessions_dropped, pending_dropped)`.
    pub fn sweep(&self) -> (usize, usize) {
        let mut expired = Vec::new();
        for entry in self.sessions.iter() {
            if entry.value().idle_for() >= self.session_ttl {
                expired.push(entry.key().clone());
            }
        }
        for session_id in &expired {
            if let Some((_, session)) = self.sessions.remove(session_id) {
                info!(
                    event = "session_expired",
                    session_id = session_id.as_str(),
                    caller = session.caller_alias.as_str(),
                    idle_secs = session.idle_for().as_secs(),
                    "idle session dropped"
                );
            }
        }

        let mut stale = Vec::new();
        for entry in self.pending.iter() {
            if entry.value().created_at.elapsed() >= self.handshake_ttl {
                stale.push(entry.key().clone());
            }
        }
        for session_id in &stale {
            self.pending.remove(session_id);
        }

        (expired.len(), stale.len())
    }

    /// Spawn the periodic sweep task.
    pub fn spawn_sweeper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                manager.sweep();
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use warden_crypto::channel::{derive_session_keys, Role};

    fn channel() -> EncryptedChannel {
        let keys = derive_session_keys(&[1u8; 32], Role::Responder, &[2u8; 32]).unwrap();
        EncryptedChannel::new(&keys)
    }

    fn session() -> Session {
        Session::new(channel(), "agent".into(), Vec::new())
    }

    #[test]
    fn test_rate_limit_fixed_window() {
        let session = session();
        assert!(session.check_rate_limit(3));
        assert!(session.check_rate_limit(3));
        assert!(session.check_rate_limit(3));
        assert!(!session.check_rate_limit(3));
    }

    #[test]
    fn test_rate_limit_window_reset() {
        let session = session();
        for _ in 0..3 {
            session.check_rate_limit(3);
        }
        assert!(!session.check_rate_limit(3));

        // Force the window into the past instead of sleeping a minute.
        session.rate.lock().window_start = Instant::now() - RATE_WINDOW - Duration::from_secs(1);
        assert!(session.check_rate_limit(3));
        assert_eq!(session.rate.lock().window_requests, 1);
    }

    #[test]
    fn test_session_tables() {
        let manager = SessionManager::new(60);
        assert_eq!(manager.active_count(), 0);
        assert!(manager.get("nope").is_none());

        manager.insert_session("abc".into(), session());
        assert_eq!(manager.active_count(), 1);
        assert!(manager.get("abc").is_some());

        manager.remove("abc");
        assert_eq!(manager.active_count(), 0);
    }

    #[test]
    fn test_pending_taken_once() {
        let manager = SessionManager::new(60);
        manager.insert_pending(
            "abc".into(),
            PendingHandshake {
                channel: channel(),
                caller_alias: "agent".into(),
                routes: Vec::new(),
                created_at: Instant::now(),
            },
        );
        assert!(manager.take_pending("abc").is_some());
        assert!(manager.take_pending("abc").is_none());
    }

    #[test]
    fn test_sweep_drops_expired() {
        let manager =
            SessionManager::with_ttls(60, Duration::from_millis(0), Duration::from_millis(0));
        manager.insert_session("s1".into(), session());
        manager.insert_pending(
            "p1".into(),
            PendingHandshake {
                channel: channel(),
                caller_alias: "agent".into(),
                routes: Vec::new(),
                created_at: Instant::now() - Duration::from_secs(1),
            },
        );

        let (sessions_dropped, pending_dropped) = manager.sweep();
        assert_eq!(sessions_dropped, 1);
        assert_eq!(pending_dropped, 1);
        assert_eq!(manager.active_count(), 0);
    }

    #[test]
    fn test_sweep_keeps_fresh() {
        let manager = SessionManager::new(60);
        manager.insert_session("s1".into(), session());
        let (dropped, _) = manager.sweep();
        assert_eq!(dropped, 0);
        assert_eq!(manager.active_count(), 1);
    }
}
