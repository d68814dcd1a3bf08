//! Capacity policy: decides which frames to evict before an insert.
//!
//! Two ceilings apply at once: frame count and payload bytes. Victims are
//! taken strictly in LRU order from the recency tracker until both ceilings
//! leave room for the incoming entry, or until nothing is left to evict.

use std::hash::Hash;

use crate::cache::recency::RecencyTracker;
use crate::config::CacheConfig;

/// Current occupancy of the store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Usage {
    pub frames: usize,
    pub bytes: usize,
}

/// The two-dimensional capacity policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapacityPolicy {
    pub max_frames: usize,
    pub max_memory_bytes: usize,
}

impl CapacityPolicy {
    pub fn new(max_frames: usize, max_memory_bytes: usize) -> Self {
        Self {
            max_frames,
            max_memory_bytes,
        }
    }

    pub fn from_config(config: &CacheConfig) -> Self {
        Self::new(config.max_frames, config.max_memory_bytes)
    }

    /// Whether inserting `incoming` bytes on top of `usage` would breach a ceiling.
    pub fn needs_eviction(&self, usage: Usage, incoming: usize) -> bool {
        usage.frames >= self.max_frames
            || usage.bytes.saturating_add(incoming) > self.max_memory_bytes
    }

    /// Select keys to evict, oldest first, so that `incoming` bytes fit.
    ///
    /// `size_of` reports the charged size of a tracked key. The walk ends when
    /// the tracker is exhausted, so a single entry larger than the byte ceiling
    /// empties the store without looping forever.
    pub fn select_victims<K, F>(
        &self,
        tracker: &RecencyTracker<K>,
        size_of: F,
        usage: Usage,
        incoming: usize,
    ) -> Vec<K>
    where
        K: Hash + Eq + Clone,
        F: Fn(&K) -> usize,
    {
        let mut projected = usage;
        let mut victims = Vec::new();

        for key in tracker.iter() {
            if !self.needs_eviction(projected, incoming) {
                break;
            }
            projected.frames = projected.frames.saturating_sub(1);
            projected.bytes = projected.bytes.saturating_sub(size_of(key));
            victims.push(key.clone());
        }

        victims
    }
}
