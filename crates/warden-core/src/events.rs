//! Ingested-event shape and monotonic ID allocation.

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// One event captured by an ingestor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestedEvent {
    /// Monotonic within the owning ingestor; encodes the boot epoch so any
    /// ID strictly exceeds those from previous runs. Not unique across
    /// ingestors; cursors are per-connection.
    pub id: u64,
    /// Deduplication key; retries and replays with the same key are dropped.
    pub idempotency_key: String,
    /// Arrival time, ISO-8601.
    pub received_at: String,
    /// Arrival time, unix milliseconds (used for cross-ingestor merge order).
    pub received_at_ms: u64,
    /// Which ingestor produced this event (registry key of its kind).
    pub source: String,
    /// Instance discriminator for multi-instance ingestors.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,
    /// Service-level event type (`push`, `MESSAGE_CREATE`, …).
    pub event_type: String,
    /// Service-shaped payload.
    pub data: serde_json::Value,
}

impl IngestedEvent {
    /// Build an event stamped with the current time.
    #[must_use]
    pub fn now(
        id: u64,
        idempotency_key: String,
        source: String,
        instance_id: Option<String>,
        event_type: String,
        data: serde_json::Value,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            idempotency_key,
            received_at: now.to_rfc3339_opts(SecondsFormat::Millis, true),
            received_at_ms: now.timestamp_millis().max(0) as u64,
            source,
            instance_id,
            event_type,
            data,
        }
    }
}

/// Per-ingestor event ID allocator.
///
/// IDs are `boot_epoch_seconds * 1_000_000 + counter`, so a consumer that
/// persisted a cursor across a gateway restart will never re-see old events:
/// every new ID is strictly greater than any ID from a previous boot.
#[derive(Debug)]
pub struct EventIdAllocator {
    next: u64,
}

impl EventIdAllocator {
    /// Seed from the current boot epoch.
    #[must_use]
    pub fn new() -> Self {
        let boot_epoch = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();
        Self {
            next: boot_epoch * 1_000_000,
        }
    }

    /// Allocate the next ID.
    pub fn next_id(&mut self) -> u64 {
        let id = self.next;
        self.next += 1;
        id
    }
}

impl Default for EventIdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_strictly_monotone() {
        let mut alloc = EventIdAllocator::new();
        let a = alloc.next_id();
        let b = alloc.next_id();
        let c = alloc.next_id();
        assert!(a < b && b < c);
    }

    #[test]
    fn test_ids_encode_boot_epoch() {
        let mut alloc = EventIdAllocator::new();
        let id = alloc.next_id();
        // Any ID minted today dwarfs one minted by a process that booted
        // even a second earlier.
        let previous_boot = (id / 1_000_000 - 1) * 1_000_000 + 999_999;
        assert!(id > previous_boot);
    }

    #[test]
    fn test_event_timestamp_shape() {
        let event = IngestedEvent::now(
            1,
            "k".into(),
            "poll".into(),
            None,
            "poll".into(),
            serde_json::json!({}),
        );
        assert!(event.received_at.ends_with('Z'));
        assert!(event.received_at_ms > 0);
    }
}
