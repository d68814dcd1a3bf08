//! O(1) least-recently-used ordering over cache keys.
//!
//! Nodes live in a slab (`Vec` of slots plus a free list) and are linked by
//! slot index, with a key → slot map for lookup:
//!
//! ```text
//!   head (oldest) ─► [3] ◄──► [0] ◄──► [5] ◄── tail (most recent)
//! ```
//!
//! Every operation is O(1); nothing scans the list.

use std::collections::HashMap;
use std::hash::Hash;

#[derive(Debug)]
struct Node<K> {
    key: K,
    prev: Option<usize>,
    next: Option<usize>,
}

/// Doubly-linked recency list addressed by slab index.
#[derive(Debug)]
pub struct RecencyTracker<K> {
    slots: Vec<Option<Node<K>>>,
    free: Vec<usize>,
    index: HashMap<K, usize>,
    head: Option<usize>,
    tail: Option<usize>,
}

impl<K: Hash + Eq + Clone> Default for RecencyTracker<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Hash + Eq + Clone> RecencyTracker<K> {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            index: HashMap::new(),
            head: None,
            tail: None,
        }
    }

    /// Insert `key` as most recent, or move it there if already tracked.
    pub fn add(&mut self, key: K) {
        if let Some(&slot) = self.index.get(&key) {
            self.unlink(slot);
            self.link_back(slot);
            return;
        }

        let node = Node {
            key: key.clone(),
            prev: None,
            next: None,
        };
        let slot = match self.free.pop() {
            Some(slot) => {
                self.slots[slot] = Some(node);
                slot
            }
            None => {
                self.slots.push(Some(node));
                self.slots.len() - 1
            }
        };
        self.index.insert(key, slot);
        self.link_back(slot);
    }

    /// Mark `key` most recent. No-op if absent or already at the tail.
    pub fn move_to_end(&mut self, key: &K) {
        let Some(&slot) = self.index.get(key) else {
            return;
        };
        if self.tail == Some(slot) {
            return;
        }
        self.unlink(slot);
        self.link_back(slot);
    }

    /// Forget `key`. Returns whether it was tracked.
    pub fn remove(&mut self, key: &K) -> bool {
        let Some(slot) = self.index.remove(key) else {
            return false;
        };
        self.unlink(slot);
        self.slots[slot] = None;
        self.free.push(slot);
        true
    }

    /// Least recently used key.
    pub fn oldest(&self) -> Option<&K> {
        self.head
            .and_then(|slot| self.slots[slot].as_ref())
            .map(|node| &node.key)
    }

    pub fn has(&self, key: &K) -> bool {
        self.index.contains_key(key)
    }

    pub fn clear(&mut self) {
        self.slots.clear();
        self.free.clear();
        self.index.clear();
        self.head = None;
        self.tail = None;
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Keys from least to most recently used.
    pub fn iter(&self) -> Iter<'_, K> {
        Iter {
            tracker: self,
            current: self.head,
        }
    }

    fn unlink(&mut self, slot: usize) {
        let (prev, next) = match self.slots[slot].as_ref() {
            Some(node) => (node.prev, node.next),
            None => return,
        };

        match prev {
            Some(p) => {
                if let Some(node) = self.slots[p].as_mut() {
                    node.next = next;
                }
            }
            None => self.head = next,
        }
        match next {
            Some(n) => {
                if let Some(node) = self.slots[n].as_mut() {
                    node.prev = prev;
                }
            }
            None => self.tail = prev,
        }

        if let Some(node) = self.slots[slot].as_mut() {
            node.prev = None;
            node.next = None;
        }
    }

    fn link_back(&mut self, slot: usize) {
        let old_tail = self.tail;
        if let Some(node) = self.slots[slot].as_mut() {
            node.prev = old_tail;
            node.next = None;
        }
        match old_tail {
            Some(t) => {
                if let Some(node) = self.slots[t].as_mut() {
                    node.next = Some(slot);
                }
            }
            None => self.head = Some(slot),
        }
        self.tail = Some(slot);
    }
}

/// Oldest-to-newest iterator over tracked keys.
pub struct Iter<'a, K> {
    tracker: &'a RecencyTracker<K>,
    current: Option<usize>,
}

impl<'a, K> Iterator for Iter<'a, K> {
    type Item = &'a K;

    fn next(&mut self) -> Option<Self::Item> {
        let slot = self.current?;
        let node = self.tracker.slots[slot].as_ref()?;
        self.current = node.next;
        Some(&node.key)
    }
}
