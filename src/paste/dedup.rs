//! Dedup cache: which content hashes are confirmed present on which remote.
//!
//! Each entry records the destination path that was confirmed for an
//! `(identity, content hash)` pair, so a repeated paste of the same image to
//! the same host can hand back the already-realized path without enqueueing
//! anything. The cache is advisory: a false negative only costs a redundant
//! probe-and-upload, and the pre-upload probe remains the source of truth
//! when in doubt.
//!
//! Capacity is bounded; inserting past it evicts the oldest confirmation
//! first.

use std::time::Instant;

use dashmap::DashMap;

use crate::paste::types::JobKey;

#[derive(Debug, Clone)]
struct ConfirmedEntry {
    destination: String,
    confirmed_at: Instant,
}

/// Bounded in-memory map of confirmed transfers.
pub struct DedupCache {
    entries: DashMap<JobKey, ConfirmedEntry>,
    capacity: usize,
}

impl DedupCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: DashMap::new(),
            capacity: capacity.max(1),
        }
    }

    /// Whether this pair has a confirmed transfer on record.
    pub fn has_confirmed(&self, key: &JobKey) -> bool {
        self.entries.contains_key(key)
    }

    /// The destination path confirmed for this pair, if any.
    pub fn confirmed_path(&self, key: &JobKey) -> Option<String> {
        self.entries.get(key).map(|entry| entry.destination.clone())
    }

    /// Record that `destination` holds the bytes for this pair.
    pub fn mark_confirmed(&self, key: JobKey, destination: impl Into<String>) {
        if !self.entries.contains_key(&key) && self.entries.len() >= self.capacity {
            self.evict_oldest();
        }
        self.entries.insert(
            key,
            ConfirmedEntry {
                destination: destination.into(),
                confirmed_at: Instant::now(),
            },
        );
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn evict_oldest(&self) {
        let oldest = self
            .entries
            .iter()
            .min_by_key(|entry| entry.value().confirmed_at)
            .map(|entry| entry.key().clone());
        if let Some(key) = oldest {
            self.entries.remove(&key);
        }
    }
}
