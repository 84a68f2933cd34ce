//! Capacity-bounded insertion-ordered map (C4).
//!
//! `get` and `set` both promote the touched key to most-recently-used.
//! Distinguishes "absent" from "stored `None`-like sentinel value" by using
//! `Option<&V>` / `Option<V>` return types rather than a sentinel value.

use std::collections::HashMap;
use std::hash::Hash;

struct Entry<V> {
    value: V,
    /// Position in `order` at time of last touch; stale entries are skipped
    /// lazily rather than requiring an O(n) shift on every access.
    stamp: u64,
}

/// An LRU-evicting map with `max_size >= 1`.
pub struct LruMap<K, V> {
    max_size: usize,
    map: HashMap<K, Entry<V>>,
    /// Monotonic touch counter; higher stamp == more recently used.
    clock: u64,
    /// order[i] = key touched at stamp i, used only to find the eviction
    /// victim; may contain stale (since-evicted or since-retouched) keys,
    /// which are skipped when found not to be the current stamp for that key.
    order: Vec<(u64, K)>,
}

impl<K, V> LruMap<K, V>
where
    K: Eq + Hash + Clone,
{
    /// # Panics
    /// Panics if `max_size == 0`.
    pub fn new(max_size: usize) -> Self {
        assert!(max_size >= 1, "LruMap max_size must be at least 1");
        Self {
            max_size,
            map: HashMap::new(),
            clock: 0,
            order: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.map.contains_key(key)
    }

    /// Get the value for `key`, promoting it to most-recently-used.
    pub fn get(&mut self, key: &K) -> Option<&V> {
        let stamp = self.next_stamp();
        if let Some(entry) = self.map.get_mut(key) {
            entry.stamp = stamp;
            self.order.push((stamp, key.clone()));
            self.compact_if_needed();
            Some(&self.map.get(key).unwrap().value)
        } else {
            None
        }
    }

    /// Insert or replace the value for `key`, promoting it to
    /// most-recently-used. Evicts the LRU entry if capacity is exceeded.
    /// Returns the previous value, if any.
    pub fn set(&mut self, key: K, value: V) -> Option<V> {
        let stamp = self.next_stamp();
        let previous = self
            .map
            .insert(key.clone(), Entry { value, stamp })
            .map(|e| e.value);
        self.order.push((stamp, key));
        if self.map.len() > self.max_size {
            self.evict_lru();
        }
        self.compact_if_needed();
        previous
    }

    /// Remove `key` unconditionally, without affecting LRU order of others.
    pub fn remove(&mut self, key: &K) -> Option<V> {
        self.map.remove(key).map(|e| e.value)
    }

    pub fn clear(&mut self) {
        self.map.clear();
        self.order.clear();
        self.clock = 0;
    }

    fn next_stamp(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn evict_lru(&mut self) {
        while let Some((stamp, key)) = self.order.first().cloned() {
            self.order.remove(0);
            let is_current = self.map.get(&key).map(|e| e.stamp) == Some(stamp);
            if is_current {
                self.map.remove(&key);
                return;
            }
            // stale entry for an already-retouched or already-removed key — skip it
        }
    }

    /// Drop stale order entries once they badly outnumber live entries, so
    /// `order` does not grow unboundedly under a hot-key workload.
    fn compact_if_needed(&mut self) {
        if self.order.len() <= self.map.len().saturating_mul(4).max(64) {
            return;
        }
        self.order
            .retain(|(stamp, key)| self.map.get(key).map(|e| e.stamp) == Some(*stamp));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn evicts_least_recently_used() {
        let mut lru: LruMap<&str, i32> = LruMap::new(2);
        lru.set("a", 1);
        lru.set("b", 2);
        lru.set("c", 3); // evicts "a"
        assert!(!lru.contains_key(&"a"));
        assert!(lru.contains_key(&"b"));
        assert!(lru.contains_key(&"c"));
        assert_eq!(lru.len(), 2);
    }

    #[test]
    fn get_promotes_to_mru() {
        let mut lru: LruMap<&str, i32> = LruMap::new(2);
        lru.set("a", 1);
        lru.set("b", 2);
        lru.get(&"a"); // promote a, b is now LRU
        lru.set("c", 3); // evicts "b"
        assert!(lru.contains_key(&"a"));
        assert!(!lru.contains_key(&"b"));
        assert!(lru.contains_key(&"c"));
    }

    #[test]
    fn set_on_existing_key_promotes() {
        let mut lru: LruMap<&str, i32> = LruMap::new(2);
        lru.set("a", 1);
        lru.set("b", 2);
        lru.set("a", 10); // re-touch a
        lru.set("c", 3); // evicts "b", not "a"
        assert!(lru.contains_key(&"a"));
        assert_eq!(*lru.get(&"a").unwrap(), 10);
        assert!(!lru.contains_key(&"b"));
    }

    #[test]
    fn never_exceeds_max_size() {
        let mut lru: LruMap<i32, i32> = LruMap::new(3);
        for i in 0..100 {
            lru.set(i, i);
            assert!(lru.len() <= lru.max_size());
        }
    }

    #[test]
    fn absent_key_distinct_from_stored_none() {
        let mut lru: LruMap<&str, Option<i32>> = LruMap::new(2);
        lru.set("a", None);
        assert_eq!(lru.get(&"a"), Some(&None));
        assert_eq!(lru.get(&"missing"), None);
    }
}

#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        /// Any sequence of `set`/`get` calls against keys drawn from a small
        /// alphabet never leaves more entries in the map than `max_size`.
        #[test]
        fn len_never_exceeds_max_size(
            max_size in 1usize..8,
            ops in prop::collection::vec((0u8..12, any::<bool>()), 0..200),
        ) {
            let mut lru: LruMap<u8, u8> = LruMap::new(max_size);
            for (key, is_get) in ops {
                if is_get {
                    lru.get(&key);
                } else {
                    lru.set(key, key);
                }
                prop_assert!(lru.len() <= lru.max_size());
            }
        }

        /// A key that was `set` and then immediately `get` is always present
        /// with the value it was set to, regardless of capacity.
        #[test]
        fn set_then_get_round_trips(max_size in 1usize..8, key in 0u8..12, value in any::<u8>()) {
            let mut lru: LruMap<u8, u8> = LruMap::new(max_size);
            lru.set(key, value);
            prop_assert_eq!(lru.get(&key), Some(&value));
        }
    }
}
