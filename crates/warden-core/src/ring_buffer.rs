//! Fixed-capacity FIFO buffer for ingested events.
//!
//! Oldest events are evicted on overflow; consumers read by cursor with
//! [`EventBuffer::since`] and never block the writer beyond the owning
//! ingestor's lock.

use std::collections::VecDeque;

use crate::events::IngestedEvent;

/// Default buffer capacity.
pub const DEFAULT_CAPACITY: usize = 200;

/// Hard cap on configured capacities.
pub const MAX_CAPACITY: usize = 1000;

/// Fixed-capacity event FIFO with monotonic IDs.
#[derive(Debug)]
pub struct EventBuffer {
    capacity: usize,
    events: VecDeque<IngestedEvent>,
}

impl EventBuffer {
    /// Create a buffer; capacity is clamped to `1..=MAX_CAPACITY`.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.clamp(1, MAX_CAPACITY);
        Self {
            capacity,
            events: VecDeque::with_capacity(capacity),
        }
    }

    /// Append an event, evicting the oldest when full.
    pub fn push(&mut self, event: IngestedEvent) {
        if self.events.len() == self.capacity {
            self.events.pop_front();
        }
        self.events.push_back(event);
    }

    /// Events with `id > after_id`, oldest first.
    #[must_use]
    pub fn since(&self, after_id: u64) -> Vec<IngestedEvent> {
        // IDs are monotone, so the suffix is contiguous.
        let start = self.events.partition_point(|e| e.id <= after_id);
        self.events.iter().skip(start).cloned().collect()
    }

    /// All buffered events, oldest first.
    #[must_use]
    pub fn to_vec(&self) -> Vec<IngestedEvent> {
        self.events.iter().cloned().collect()
    }

    /// Number of buffered events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// Whether the buffer is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Configured capacity.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for EventBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
