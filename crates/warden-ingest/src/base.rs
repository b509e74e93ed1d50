//! Shared ingestor state: lifecycle, ring buffer, deduplication, status.
//!
//! Every concrete ingestor owns an [`IngestorCore`] and implements the
//! [`Ingestor`] trait. The core serializes buffer pushes behind one lock and
//! suppresses duplicate events by idempotency key; state transitions follow
//! `stopped → starting → connected ↔ reconnecting → stopped | error`, with
//! `error` terminal until the owner rebuilds the ingestor.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tracing::debug;
use warden_core::events::{EventIdAllocator, IngestedEvent};
use warden_core::ring_buffer::EventBuffer;

use crate::error::IngestError;

/// Lifecycle state of an ingestor.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum IngestorState {
    /// `start()` ran; connection not yet established.
    Starting,
    /// Receiving events.
    Connected,
    /// Connection lost; retrying with backoff.
    Reconnecting,
    /// Cleanly stopped.
    Stopped,
    /// Terminal failure; events stopped flowing.
    Error,
}

impl fmt::Display for IngestorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            IngestorState::Starting => "starting",
            IngestorState::Connected => "connected",
            IngestorState::Reconnecting => "reconnecting",
            IngestorState::Stopped => "stopped",
            IngestorState::Error => "error",
        };
        f.write_str(s)
    }
}

/// Snapshot of one ingestor for `ingestor_status`.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestorStatus {
    /// Connection alias the ingestor belongs to.
    pub connection: String,
    /// Instance discriminator, when multi-instance.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,
    /// Registry key (`websocket:discord`, `webhook:stripe`, `poll`, …).
    #[serde(rename = "type")]
    pub kind: String,
    /// Current lifecycle state.
    pub state: IngestorState,
    /// Events currently buffered.
    pub buffered_events: usize,
    /// Events accepted since start (duplicates excluded).
    pub total_events_received: u64,
    /// ISO-8601 arrival time of the newest event.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_event_at: Option<String>,
    /// Failure detail when state is `error`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Bounded most-recently-seen key set.
///
/// Holds at least as many keys as the ring buffer holds events, so a
/// duplicate can never outlive the original it would shadow.
#[derive(Debug)]
pub(crate) struct DedupSet {
    capacity: usize,
    order: VecDeque<String>,
    keys: HashSet<String>,
}

impl DedupSet {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            order: VecDeque::with_capacity(capacity),
            keys: HashSet::with_capacity(capacity),
        }
    }

    /// Insert a key; returns `false` when it was already present.
    pub(crate) fn insert(&mut self, key: &str) -> bool {
        if self.keys.contains(key) {
            return false;
        }
        if self.order.len() == self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.keys.remove(&evicted);
            }
        }
        self.order.push_back(key.to_string());
        self.keys.insert(key.to_string());
        true
    }
}

struct CoreInner {
    buffer: EventBuffer,
    ids: EventIdAllocator,
    dedup: DedupSet,
    total_events: u64,
    last_event_at: Option<String>,
}

/// State shared by every concrete ingestor.
pub struct IngestorCore {
    connection_alias: String,
    instance_id: Option<String>,
    kind: String,
    state: parking_lot::Mutex<IngestorState>,
    error: parking_lot::Mutex<Option<String>>,
    inner: parking_lot::Mutex<CoreInner>,
}

impl IngestorCore {
    /// Create a core for one `(connection, instance?)`.
    #[must_use]
    pub fn new(
        connection_alias: &str,
        instance_id: Option<String>,
        kind: &str,
        buffer_capacity: usize,
    ) -> Arc<Self> {
        let buffer = EventBuffer::new(buffer_capacity);
        let dedup_capacity = buffer.capacity().max(512);
        Arc::new(Self {
            connection_alias: connection_alias.to_string(),
            instance_id,
            kind: kind.to_string(),
            state: parking_lot::Mutex::new(IngestorState::Stopped),
            error: parking_lot::Mutex::new(None),
            inner: parking_lot::Mutex::new(CoreInner {
                buffer,
                ids: EventIdAllocator::new(),
                dedup: DedupSet::new(dedup_capacity),
                total_events: 0,
                last_event_at: None,
            }),
        })
    }

    /// Connection alias this core serves.
    #[must_use]
    pub fn connection_alias(&self) -> &str {
        &self.connection_alias
    }

    /// Instance discriminator, when multi-instance.
    #[must_use]
    pub fn instance_id(&self) -> Option<&str> {
        self.instance_id.as_deref()
    }

    /// Registry key of this ingestor's kind.
    #[must_use]
    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> IngestorState {
        *self.state.lock()
    }

    /// Transition to a new state.
    pub fn set_state(&self, state: IngestorState) {
        *self.state.lock() = state;
    }

    /// Enter the terminal `error` state with a reason.
    pub fn fail(&self, reason: impl Into<String>) {
        let reason = reason.into();
        tracing::warn!(
            connection = self.connection_alias.as_str(),
            kind = self.kind.as_str(),
            reason = reason.as_str(),
            "ingestor entered error state"
        );
        *self.error.lock() = Some(reason);
        *self.state.lock() = IngestorState::Error;
    }

    /// Buffer an event unless its idempotency key was already seen.
    ///
    /// Without a key, a `{kind}:{uuid}` fallback is used, which is
    /// effectively never a duplicate. Returns `false` when deduplicated.
    pub fn push_event(
        &self,
        event_type: &str,
        data: serde_json::Value,
        idempotency_key: Option<String>,
    ) -> bool {
        let key = idempotency_key
            .unwrap_or_else(|| format!("{}:{}", self.kind, uuid::Uuid::new_v4()));

        let mut inner = self.inner.lock();
        if !inner.dedup.insert(&key) {
            debug!(
                connection = self.connection_alias.as_str(),
                key = key.as_str(),
                "duplicate event dropped"
            );
            return false;
        }
        let id = inner.ids.next_id();
        let event = IngestedEvent::now(
            id,
            key,
            self.kind.clone(),
            self.instance_id.clone(),
            event_type.to_string(),
            data,
        );
        inner.last_event_at = Some(event.received_at.clone());
        inner.total_events += 1;
        inner.buffer.push(event);
        true
    }

    /// Cursored read: all buffered events, or those with `id > after_id`.
    #[must_use]
    pub fn get_events(&self, after_id: Option<u64>) -> Vec<IngestedEvent> {
        let inner = self.inner.lock();
        match after_id {
            Some(id) => inner.buffer.since(id),
            None => inner.buffer.to_vec(),
        }
    }

    /// Status snapshot.
    #[must_use]
    pub fn status(&self) -> IngestorStatus {
        let inner = self.inner.lock();
        IngestorStatus {
            connection: self.connection_alias.clone(),
            instance_id: self.instance_id.clone(),
            kind: self.kind.clone(),
            state: self.state(),
            buffered_events: inner.buffer.len(),
            total_events_received: inner.total_events,
            last_event_at: inner.last_event_at.clone(),
            error: self.error.lock().clone(),
        }
    }
}

/// Outcome of offering a webhook delivery to one ingestor.
#[derive(Clone, Debug)]
pub struct WebhookDecision {
    /// Whether this ingestor accepted the delivery.
    pub accepted: bool,
    /// Rejection reason, when not accepted.
    pub reason: Option<String>,
}

impl WebhookDecision {
    /// Accepted delivery.
    #[must_use]
    pub fn accepted() -> Self {
        Self {
            accepted: true,
            reason: None,
        }
    }

    /// Rejected delivery with a reason.
    #[must_use]
    pub fn rejected(reason: impl Into<String>) -> Self {
        Self {
            accepted: false,
            reason: Some(reason.into()),
        }
    }
}

/// A long-lived event source.
#[async_trait]
pub trait Ingestor: Send + Sync {
    /// The shared core.
    fn core(&self) -> &IngestorCore;

    /// Begin producing events. Must be idempotent enough to tolerate a
    /// failed earlier start.
    async fn start(&self) -> Result<(), IngestError>;

    /// Stop producing events and cancel outstanding I/O. Sets the terminal
    /// state first so in-flight reconnect timers observe it and no-op.
    async fn stop(&self);

    /// Path under `/webhooks/` this ingestor listens on, if passive.
    fn webhook_path(&self) -> Option<&str> {
        None
    }

    /// Offer a webhook delivery (raw bytes, pre-parse).
    fn handle_webhook(
        &self,
        _headers: &HashMap<String, String>,
        _raw_body: &[u8],
    ) -> WebhookDecision {
        WebhookDecision::rejected("not a webhook ingestor")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_push_and_read() {
        let core = IngestorCore::new("github", None, "webhook:github", 10);
        assert!(core.push_event("push", json!({"n": 1}), Some("k1".into())));
        assert!(core.push_event("push", json!({"n": 2}), Some("k2".into())));

        let events = core.get_events(None);
        assert_eq!(events.len(), 2);
        assert!(events[0].id < events[1].id);

        let after = core.get_events(Some(events[0].id));
        assert_eq!(after.len(), 1);
        assert_eq!(after[0].idempotency_key, "k2");
    }

    #[test]
    fn test_duplicate_key_dropped() {
        let core = IngestorCore::new("github", None, "webhook:github", 10);
        assert!(core.push_event("push", json!({}), Some("dup".into())));
        assert!(!core.push_event("push", json!({}), Some("dup".into())));
        assert_eq!(core.get_events(None).len(), 1);
        assert_eq!(core.status().total_events_received, 1);
    }

    #[test]
    fn test_missing_key_never_deduplicates() {
        let core = IngestorCore::new("poll", None, "poll", 10);
        assert!(core.push_event("poll", json!({}), None));
        assert!(core.push_event("poll", json!({}), None));
        assert_eq!(core.get_events(None).len(), 2);
    }

    #[test]
    fn test_dedup_set_bounded() {
        let mut dedup = DedupSet::new(2);
        assert!(dedup.insert("a"));
        assert!(dedup.insert("b"));
        assert!(dedup.insert("c")); // evicts "a"
        assert!(dedup.insert("a")); // seen again after eviction
        assert!(!dedup.insert("c"));
    }

    #[test]
    fn test_state_and_status() {
        let core = IngestorCore::new("discord", Some("main".into()), "websocket:discord", 10);
        assert_eq!(core.state(), IngestorState::Stopped);

        core.set_state(IngestorState::Starting);
        core.set_state(IngestorState::Connected);
        core.fail("gateway closed with code 4004");

        let status = core.status();
        assert_eq!(status.state, IngestorState::Error);
        assert_eq!(status.instance_id.as_deref(), Some("main"));
        assert!(status.error.unwrap().contains("4004"));
    }
}
