//! Implements the strict-FIFO replacement policy for the block cache.

use std::collections::HashMap;
use std::hash::Hash;

/// A bounded map with first-in-first-out replacement.
///
/// Holds at most `capacity` entries. Alongside the map it keeps a ring of
/// the last `capacity` inserted keys. When an insert finds the cache full,
/// the entry whose key sits under the ring cursor is evicted, the new key
/// takes that ring slot, and the cursor advances circularly.
///
/// Lookups never touch the ring, so a hit has no effect on replacement
/// order: the cache is a fixed window over insertion history, not an LRU.
/// The victim is therefore always the entry inserted exactly `capacity`
/// insertions earlier, which keeps worst-case memory and re-fetch cost
/// deterministic regardless of access pattern.
#[derive(Debug)]
pub struct FifoCache<K, V> {
    entries: HashMap<K, V>,
    ring: Vec<K>,
    cursor: usize,
    capacity: usize,
}

impl<K: Copy + Eq + Hash, V> FifoCache<K, V> {
    /// Create a cache holding at most `capacity` entries.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "FifoCache requires a nonzero capacity");
        Self {
            entries: HashMap::with_capacity(capacity),
            ring: Vec::with_capacity(capacity),
            cursor: 0,
            capacity,
        }
    }

    /// Look up a key. Never affects replacement order.
    pub fn get(&self, key: &K) -> Option<&V> {
        self.entries.get(key)
    }

    /// Whether `key` is currently resident.
    pub fn contains(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    /// Insert an entry, evicting the oldest insertion if the cache is full.
    ///
    /// Returns the evicted `(key, value)` pair, if any. Re-inserting a key
    /// that is already resident replaces its value in place and does not
    /// consume a ring slot.
    pub fn insert(&mut self, key: K, value: V) -> Option<(K, V)> {
        if let Some(slot) = self.entries.get_mut(&key) {
            *slot = value;
            return None;
        }

        let evicted = if self.ring.len() < self.capacity {
            self.ring.push(key);
            None
        } else {
            let victim = std::mem::replace(&mut self.ring[self.cursor], key);
            let value = self.entries.remove(&victim);
            debug_assert!(value.is_some(), "ring named a key absent from the map");
            value.map(|v| (victim, v))
        };
        self.cursor = (self.cursor + 1) % self.capacity;
        self.entries.insert(key, value);
        evicted
    }

    /// Number of resident entries. Never exceeds [`capacity`](Self::capacity).
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The maximum number of resident entries.
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
