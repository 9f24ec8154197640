//! Per-subscription deduplication table.
//!
//! Key is `(aggregate id, event type)`. An incoming event is a duplicate
//! when a record for its key already holds a version greater than or equal
//! to the incoming one. Records expire at their `valid_until` instant so the
//! table cannot grow without bound.

use std::collections::HashMap;
use std::time::Instant;

use crate::domain::EventType;

#[derive(Debug, Clone, Copy)]
struct DedupEntry {
    version: u64,
    valid_until: Instant,
}

/// Versions already delivered to one subscription.
#[derive(Debug, Default)]
pub struct DedupTable {
    entries: HashMap<(String, EventType), DedupEntry>,
}

impl DedupTable {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` if `version` was already seen for this key.
    #[must_use]
    pub fn is_duplicate(&self, aggregate_id: &str, event_type: EventType, version: u64) -> bool {
        self.entries
            .get(&(aggregate_id.to_string(), event_type))
            .is_some_and(|e| e.version >= version)
    }

    /// Records a delivered version. Never lowers a stored version.
    pub fn record(
        &mut self,
        aggregate_id: &str,
        event_type: EventType,
        version: u64,
        valid_until: Instant,
    ) {
        let entry = self
            .entries
            .entry((aggregate_id.to_string(), event_type))
            .or_insert(DedupEntry {
                version,
                valid_until,
            });
        if version >= entry.version {
            entry.version = version;
            entry.valid_until = entry.valid_until.max(valid_until);
        }
    }

    /// Removes records whose `valid_until` has passed. Returns how many were
    /// dropped.
    pub fn drop_expired(&mut self, now: Instant) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, e| e.valid_until > now);
        before - self.entries.len()
    }

    /// Number of live records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if no record is held.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
