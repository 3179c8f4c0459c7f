//! Bounded per-tier caches.
//!
//! Each tier (decoded sectors, raw clusters, second-level tables) is an
//! independent [`BoundedCache`] sized as `budget / entry_size` entries. A miss
//! is always answered by the caller re-reading the container, so the cache
//! contents never affect what a read returns.

use std::collections::HashMap;
use std::num::NonZeroUsize;

use log::debug;
use lru::LruCache;
use serde::Serialize;

use crate::config::CachePolicy;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    /// Full-tier clears performed by [`CachePolicy::ClearOnFull`].
    pub clears: u64,
    /// Single-entry evictions performed by [`CachePolicy::Lru`].
    pub evictions: u64,
}

enum Store<V> {
    Map(HashMap<u64, V>),
    Lru(LruCache<u64, V>),
    Off,
}

/// A fixed-capacity cache keyed by `u64`.
pub struct BoundedCache<V> {
    name: &'static str,
    capacity: NonZeroUsize,
    store: Store<V>,
    stats: CacheStats,
}

impl<V: Clone> BoundedCache<V> {
    /// Creates a tier holding at most `budget / entry_size` entries (at least one).
    pub fn new(name: &'static str, policy: CachePolicy, budget: usize, entry_size: usize) -> Self {
        let capacity = NonZeroUsize::new(budget / entry_size.max(1)).unwrap_or(NonZeroUsize::MIN);
        let store = match policy {
            CachePolicy::ClearOnFull => Store::Map(HashMap::new()),
            CachePolicy::Lru => Store::Lru(LruCache::new(capacity)),
            CachePolicy::Disabled => Store::Off,
        };
        Self {
            name,
            capacity,
            store,
            stats: CacheStats::default(),
        }
    }

    pub fn get(&mut self, key: u64) -> Option<V> {
        let found = match &mut self.store {
            Store::Map(map) => map.get(&key).cloned(),
            Store::Lru(lru) => lru.get(&key).cloned(),
            Store::Off => None,
        };
        if found.is_some() {
            self.stats.hits += 1;
        } else {
            self.stats.misses += 1;
        }
        found
    }

    pub fn put(&mut self, key: u64, value: V) {
        match &mut self.store {
            Store::Map(map) => {
                if !map.contains_key(&key) && map.len() >= self.capacity.get() {
                    debug!(
                        "{} cache reached {} entries, clearing",
                        self.name,
                        map.len()
                    );
                    map.clear();
                    self.stats.clears += 1;
                }
                map.insert(key, value);
            }
            Store::Lru(lru) => {
                if let Some((evicted, _)) = lru.push(key, value) {
                    if evicted != key {
                        self.stats.evictions += 1;
                    }
                }
            }
            Store::Off => {}
        }
    }

    pub fn contains(&self, key: u64) -> bool {
        match &self.store {
            Store::Map(map) => map.contains_key(&key),
            Store::Lru(lru) => lru.contains(&key),
            Store::Off => false,
        }
    }

    pub fn clear(&mut self) {
        match &mut self.store {
            Store::Map(map) => map.clear(),
            Store::Lru(lru) => lru.clear(),
            Store::Off => {}
        }
    }

    pub fn len(&self) -> usize {
        match &self.store {
            Store::Map(map) => map.len(),
            Store::Lru(lru) => lru.len(),
            Store::Off => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity.get()
    }

    pub fn stats(&self) -> CacheStats {
        self.stats
    }
}
