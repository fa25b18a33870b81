// Copyright 2019-2021 Meridb Developers.
// This file is part of Meridb.

// Meridb is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

// Meridb is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.

// You should have received a copy of the GNU General Public License
// along with Meridb.  If not, see <http://www.gnu.org/licenses/>.

//! An LRU cache for engine objects. Unlike a plain LRU map, eviction asks a
//! caller-supplied predicate whether the victim may go: pinned entries
//! (system objects, objects with outstanding handles) survive, and when
//! nothing at all can be evicted the insert reports [`CacheFull`].

use std::fmt;
use std::hash::Hash;

use linked_hash_map::LinkedHashMap;

/// Insert failed: the cache is at capacity and every entry is pinned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheFull;

impl fmt::Display for CacheFull {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("object cache is full and no entry can be evicted")
    }
}

impl std::error::Error for CacheFull {}

/// LRU object cache with pinned-entry support.
pub struct ObjectCache<K: Eq + Hash, V> {
    map: LinkedHashMap<K, V>,
    capacity: usize,
}

impl<K: Eq + Hash + Clone, V> ObjectCache<K, V> {
    /// Creates a cache bounded to `capacity` entries. Capacity must be
    /// non-zero.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "cache capacity must not be zero");
        ObjectCache {
            map: LinkedHashMap::new(),
            capacity,
        }
    }

    /// Looks an entry up and marks it most recently used.
    pub fn get(&mut self, key: &K) -> Option<&V> {
        self.map.get_refresh(key).map(|v| &*v)
    }

    /// Mutable lookup; marks the entry most recently used.
    pub fn get_mut(&mut self, key: &K) -> Option<&mut V> {
        self.map.get_refresh(key)
    }

    /// Checks presence without touching the LRU order.
    pub fn contains(&self, key: &K) -> bool {
        self.map.contains_key(key)
    }

    /// Inserts an entry, evicting the least recently used entry for which
    /// `can_evict` returns true if the cache is at capacity. Replacing an
    /// existing key never evicts.
    pub fn put<F>(&mut self, key: K, value: V, can_evict: F) -> Result<Option<V>, CacheFull>
    where
        F: Fn(&K, &V) -> bool,
    {
        if self.map.contains_key(&key) {
            return Ok(self.map.insert(key, value));
        }
        if self.map.len() >= self.capacity {
            let victim = self
                .map
                .iter()
                .find(|&(k, v)| can_evict(k, v))
                .map(|(k, _)| k.clone());
            match victim {
                Some(k) => {
                    self.map.remove(&k);
                }
                None => return Err(CacheFull),
            }
        }
        self.map.insert(key, value);
        Ok(None)
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        self.map.remove(key)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Iterates entries from least to most recently used.
    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        self.map.iter()
    }

    pub fn clear(&mut self) {
        self.map.clear()
    }
}

#[cfg(test)]
mod tests {
    use super::{CacheFull, ObjectCache};

    #[test]
    fn evicts_least_recently_used() {
        let mut cache = ObjectCache::new(2);
        cache.put(1, "a", |_, _| true).unwrap();
        cache.put(2, "b", |_, _| true).unwrap();
        // Touch 1 so that 2 becomes the LRU victim.
        assert_eq!(cache.get(&1), Some(&"a"));
        cache.put(3, "c", |_, _| true).unwrap();
        assert!(cache.contains(&1));
        assert!(!cache.contains(&2));
        assert!(cache.contains(&3));
    }

    #[test]
    fn pinned_entries_survive() {
        let mut cache = ObjectCache::new(2);
        cache.put(1, "pinned", |_, _| true).unwrap();
        cache.put(2, "plain", |_, _| true).unwrap();
        // Entry 1 is pinned; eviction must pick 2 even though 1 is older.
        cache.put(3, "new", |k, _| *k != 1).unwrap();
        assert!(cache.contains(&1));
        assert!(!cache.contains(&2));
    }

    #[test]
    fn full_cache_with_all_pinned_reports_error() {
        let mut cache = ObjectCache::new(1);
        cache.put(1, "pinned", |_, _| true).unwrap();
        assert_eq!(cache.put(2, "x", |_, _| false), Err(CacheFull));
        // Replacement of an existing key still works.
        cache.put(1, "updated", |_, _| false).unwrap();
        assert_eq!(cache.get(&1), Some(&"updated"));
    }
}
