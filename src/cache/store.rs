//! Frame store: the bookkeeping core of the cache.
//!
//! The store owns every cached entry and keeps four structures in step:
//! - the key → entry map
//! - the recency tracker (LRU order)
//! - the composition → frame-set index used for scoped clears
//! - the running memory counter
//!
//! All methods take `&mut self` and never suspend, so a caller holding the
//! store behind one lock sees each call as a single atomic update.

use std::collections::{HashMap, HashSet};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::cache::evictor::{CapacityPolicy, Usage};
use crate::cache::frame::{Bitmap, CacheEntry, FrameKey, FrameNumber, Payload};
use crate::cache::recency::RecencyTracker;
use crate::config::{CacheConfig, ConfigPatch};
use crate::metrics::CacheMetrics;

/// Disagreement between the store's internal structures.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum InvariantError {
    #[error("Recency tracker has {tracked} keys, entry map has {entries}")]
    TrackerLen { tracked: usize, entries: usize },

    #[error("Composition index has {indexed} keys, entry map has {entries}")]
    IndexLen { indexed: usize, entries: usize },

    #[error("Empty frame set left in composition index for {0}")]
    EmptyComposition(String),

    #[error("{0} missing from recency tracker")]
    MissingFromTracker(FrameKey),

    #[error("{0} missing from composition index")]
    MissingFromIndex(FrameKey),

    #[error("memory_used is {recorded}, entries sum to {actual}")]
    MemoryMismatch { recorded: usize, actual: usize },
}

/// Cache statistics snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheStats {
    pub cached_frames: usize,
    pub memory_used: usize,
    pub hit_ratio: f64,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub compressed_frames: usize,
}

/// Result of a lookup before any decoding.
#[derive(Debug, Clone)]
pub enum Lookup {
    /// Absent or stale. Already counted as a miss.
    Miss,
    /// Uncompressed hit. Already counted and moved to most-recent.
    Raw(Bitmap),
    /// Present but encoded. Not yet counted; the caller settles it with
    /// [`FrameStore::settle_decode`].
    Compressed {
        blob: Bytes,
        width: u32,
        height: u32,
        write_seq: u64,
    },
}

/// Outcome of [`FrameStore::insert`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// Entry stored; `evicted` entries were dropped to make room.
    Stored { evicted: usize },
    /// A later-issued write for the same key was drawn, or `clear` ran
    /// after this write was issued.
    Superseded,
}

#[derive(Debug, Clone, Copy)]
struct PendingWrites {
    latest: u64,
    in_flight: usize,
}

/// The primary store.
pub struct FrameStore {
    entries: HashMap<FrameKey, CacheEntry>,

    /// Frame numbers cached per composition.
    compositions: HashMap<String, HashSet<FrameNumber>>,

    tracker: RecencyTracker<FrameKey>,

    memory_used: usize,

    /// Last state hash seen by `invalidate`, per composition.
    composition_hashes: HashMap<String, String>,

    config: CacheConfig,

    next_write_seq: u64,

    /// Per key with writes in flight: newest sequence drawn and how many
    /// drawn writes have not yet settled.
    pending_writes: HashMap<FrameKey, PendingWrites>,

    /// Writes drawn before the last `clear` are dropped.
    write_fence: u64,

    hits: u64,
    misses: u64,
    evictions: u64,

    metrics: CacheMetrics,
}

impl FrameStore {
    pub fn new(config: CacheConfig, metrics: CacheMetrics) -> Self {
        Self {
            entries: HashMap::new(),
            compositions: HashMap::new(),
            tracker: RecencyTracker::new(),
            memory_used: 0,
            composition_hashes: HashMap::new(),
            config,
            next_write_seq: 0,
            pending_writes: HashMap::new(),
            write_fence: 0,
            hits: 0,
            misses: 0,
            evictions: 0,
            metrics,
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Merge a patch onto the config. Tighter limits take effect on the next insert.
    pub fn set_config(&mut self, patch: &ConfigPatch) -> CacheConfig {
        self.config.apply(patch);
        self.config.clone()
    }

    /// Synchronous read. Compressed entries report a miss.
    pub fn get(
        &mut self,
        frame: FrameNumber,
        composition_id: &str,
        state_hash: Option<&str>,
    ) -> Option<Bitmap> {
        match self.lookup(&FrameKey::new(composition_id, frame), state_hash) {
            Lookup::Raw(bitmap) => Some(bitmap),
            Lookup::Compressed { .. } => {
                self.record_miss();
                None
            }
            Lookup::Miss => None,
        }
    }

    /// Look a key up, evicting it if `state_hash` marks it stale.
    pub fn lookup(&mut self, key: &FrameKey, state_hash: Option<&str>) -> Lookup {
        let stale = match self.entries.get(key) {
            None => {
                self.record_miss();
                return Lookup::Miss;
            }
            Some(entry) => entry.is_stale_for(state_hash),
        };

        if stale {
            debug!(key = %key, "Stale entry evicted on read");
            self.remove_entry(key);
            self.record_miss();
            self.sync_gauges();
            return Lookup::Miss;
        }

        let Some(entry) = self.entries.get_mut(key) else {
            return Lookup::Miss;
        };
        let lookup = match &entry.payload {
            Payload::Raw(bitmap) => Lookup::Raw(bitmap.clone()),
            Payload::Compressed(blob) => Lookup::Compressed {
                blob: blob.clone(),
                width: entry.width,
                height: entry.height,
                write_seq: entry.write_seq,
            },
        };

        if matches!(lookup, Lookup::Raw(_)) {
            entry.touch();
            self.tracker.move_to_end(key);
            self.record_hit();
        }
        lookup
    }

    /// Settle a read of a compressed entry after decoding outside the lock.
    ///
    /// A successful decode counts a hit and refreshes recency if the same
    /// entry is still cached. A failed decode counts a miss and leaves the
    /// entry in place so a later read can retry.
    pub fn settle_decode(&mut self, key: &FrameKey, write_seq: u64, decoded: bool) {
        if !decoded {
            self.record_miss();
            return;
        }
        if let Some(entry) = self.entries.get_mut(key) {
            if entry.write_seq == write_seq {
                entry.touch();
                self.tracker.move_to_end(key);
            }
        }
        self.record_hit();
    }

    /// Reserve the sequence number for a new write to `key`. Writes to the
    /// same key land in the order their numbers were drawn: once a number is
    /// drawn, no write holding an older one can be stored.
    pub fn next_write_seq(&mut self, key: &FrameKey) -> u64 {
        let seq = self.next_write_seq;
        self.next_write_seq += 1;
        let pending = self
            .pending_writes
            .entry(key.clone())
            .or_insert(PendingWrites {
                latest: seq,
                in_flight: 0,
            });
        pending.latest = seq;
        pending.in_flight += 1;
        seq
    }

    /// Forget a drawn write that will never reach [`FrameStore::insert`].
    pub fn abandon_write(&mut self, key: &FrameKey, write_seq: u64) {
        self.settle_write(key, write_seq);
    }

    /// Insert an entry, replacing any prior entry under the same key.
    pub fn insert(&mut self, entry: CacheEntry) -> InsertOutcome {
        let seq = entry.write_seq;
        if seq < self.write_fence {
            debug!(key = %entry.key, write_seq = seq, "Dropping write issued before clear");
            return InsertOutcome::Superseded;
        }
        let issued_later = self
            .pending_writes
            .get(&entry.key)
            .is_some_and(|pending| pending.latest > seq);
        let stored_later = self
            .entries
            .get(&entry.key)
            .is_some_and(|existing| existing.write_seq > seq);
        self.settle_write(&entry.key, seq);
        if issued_later || stored_later {
            debug!(key = %entry.key, write_seq = seq, "Dropping write superseded by a later one");
            return InsertOutcome::Superseded;
        }

        let key = entry.key.clone();
        self.remove_entry(&key);
        let evicted = self.ensure_capacity(entry.size_bytes);

        self.memory_used += entry.size_bytes;
        self.tracker.add(key.clone());
        self.compositions
            .entry(key.composition_id.clone())
            .or_default()
            .insert(key.frame);
        self.entries.insert(key, entry);

        self.sync_gauges();
        InsertOutcome::Stored { evicted }
    }

    /// Remove a single frame. Returns whether it was cached.
    pub fn remove(&mut self, frame: FrameNumber, composition_id: &str) -> bool {
        let removed = self
            .remove_entry(&FrameKey::new(composition_id, frame))
            .is_some();
        if removed {
            self.sync_gauges();
        }
        removed
    }

    /// Membership check without touching stats or recency.
    pub fn has(&self, frame: FrameNumber, composition_id: &str) -> bool {
        self.entries
            .contains_key(&FrameKey::new(composition_id, frame))
    }

    /// Drop every frame of one composition. Returns how many were removed.
    pub fn clear_composition(&mut self, composition_id: &str) -> usize {
        let Some(frames) = self.compositions.remove(composition_id) else {
            return 0;
        };

        let mut removed = 0;
        for frame in frames {
            let key = FrameKey::new(composition_id, frame);
            if let Some(entry) = self.entries.remove(&key) {
                self.memory_used -= entry.size_bytes;
                self.tracker.remove(&key);
                removed += 1;
            }
        }

        debug!(composition = composition_id, removed, "Cleared composition");
        self.sync_gauges();
        removed
    }

    /// Drop everything and reset statistics.
    pub fn clear(&mut self) {
        let frames = self.entries.len();
        self.entries.clear();
        self.compositions.clear();
        self.tracker.clear();
        self.composition_hashes.clear();
        self.pending_writes.clear();
        self.write_fence = self.next_write_seq;
        self.memory_used = 0;
        self.hits = 0;
        self.misses = 0;
        self.evictions = 0;
        self.sync_gauges();
        info!(frames, "Frame cache cleared");
    }

    /// Clear a composition if `state_hash` differs from the last one seen.
    ///
    /// The first hash seen for a composition is only recorded. Returns whether
    /// a clear happened.
    pub fn invalidate(&mut self, composition_id: &str, state_hash: &str) -> bool {
        let previous = self
            .composition_hashes
            .insert(composition_id.to_string(), state_hash.to_string());

        match previous {
            Some(prev) if prev != state_hash => {
                let removed = self.clear_composition(composition_id);
                info!(
                    composition = composition_id,
                    removed,
                    "Composition state changed, cache invalidated"
                );
                true
            }
            _ => false,
        }
    }

    /// Evict LRU entries until `required` more bytes and one more frame fit,
    /// or until the store is empty. Returns the number evicted.
    pub fn ensure_capacity(&mut self, required: usize) -> usize {
        let policy = CapacityPolicy::from_config(&self.config);
        let entries = &self.entries;
        let victims = policy.select_victims(
            &self.tracker,
            |key| entries.get(key).map(|e| e.size_bytes).unwrap_or(0),
            self.usage(),
            required,
        );

        for key in &victims {
            if let Some(entry) = self.remove_entry(key) {
                debug!(
                    key = %key,
                    size_bytes = entry.size_bytes,
                    "Evicted frame"
                );
            }
        }

        let evicted = victims.len();
        if evicted > 0 {
            self.evictions += evicted as u64;
            self.metrics.evictions.inc_by(evicted as u64);
        }
        evicted
    }

    /// Current statistics.
    pub fn stats(&self) -> CacheStats {
        let lookups = self.hits + self.misses;
        CacheStats {
            cached_frames: self.entries.len(),
            memory_used: self.memory_used,
            hit_ratio: if lookups == 0 {
                0.0
            } else {
                self.hits as f64 / lookups as f64
            },
            hits: self.hits,
            misses: self.misses,
            evictions: self.evictions,
            compressed_frames: self.entries.values().filter(|e| e.is_compressed()).count(),
        }
    }

    pub fn usage(&self) -> Usage {
        Usage {
            frames: self.entries.len(),
            bytes: self.memory_used,
        }
    }

    /// Inspect an entry without affecting recency or stats.
    pub fn entry(&self, frame: FrameNumber, composition_id: &str) -> Option<&CacheEntry> {
        self.entries.get(&FrameKey::new(composition_id, frame))
    }

    /// Frames cached for a composition.
    pub fn composition_len(&self, composition_id: &str) -> usize {
        self.compositions
            .get(composition_id)
            .map(HashSet::len)
            .unwrap_or(0)
    }

    /// Check that map, tracker, composition index and memory counter agree.
    pub fn check_invariants(&self) -> Result<(), InvariantError> {
        let entries = self.entries.len();
        if self.tracker.len() != entries {
            return Err(InvariantError::TrackerLen {
                tracked: self.tracker.len(),
                entries,
            });
        }
        let indexed: usize = self.compositions.values().map(HashSet::len).sum();
        if indexed != entries {
            return Err(InvariantError::IndexLen { indexed, entries });
        }
        if let Some((id, _)) = self.compositions.iter().find(|(_, f)| f.is_empty()) {
            return Err(InvariantError::EmptyComposition(id.clone()));
        }
        for key in self.entries.keys() {
            if !self.tracker.has(key) {
                return Err(InvariantError::MissingFromTracker(key.clone()));
            }
            let in_index = self
                .compositions
                .get(&key.composition_id)
                .is_some_and(|frames| frames.contains(&key.frame));
            if !in_index {
                return Err(InvariantError::MissingFromIndex(key.clone()));
            }
        }
        let actual: usize = self.entries.values().map(|e| e.size_bytes).sum();
        if actual != self.memory_used {
            return Err(InvariantError::MemoryMismatch {
                recorded: self.memory_used,
                actual,
            });
        }
        Ok(())
    }

    /// Count one drawn write as settled. The key's record is dropped once no
    /// write for it is in flight. Writes fenced by `clear` were already forgotten.
    fn settle_write(&mut self, key: &FrameKey, write_seq: u64) {
        if write_seq < self.write_fence {
            return;
        }
        if let Some(pending) = self.pending_writes.get_mut(key) {
            pending.in_flight = pending.in_flight.saturating_sub(1);
            if pending.in_flight == 0 {
                self.pending_writes.remove(key);
            }
        }
    }

    /// Unlink one key from all four structures.
    fn remove_entry(&mut self, key: &FrameKey) -> Option<CacheEntry> {
        let entry = self.entries.remove(key)?;
        self.memory_used -= entry.size_bytes;
        self.tracker.remove(key);
        if let Some(frames) = self.compositions.get_mut(&key.composition_id) {
            frames.remove(&key.frame);
            if frames.is_empty() {
                self.compositions.remove(&key.composition_id);
            }
        }
        Some(entry)
    }

    fn record_hit(&mut self) {
        self.hits += 1;
        self.metrics.hits.inc();
    }

    fn record_miss(&mut self) {
        self.misses += 1;
        self.metrics.misses.inc();
    }

    fn sync_gauges(&self) {
        self.metrics.set_usage(self.entries.len(), self.memory_used);
    }
}
