use std::collections::HashMap;

use parking_lot::Mutex;

use crate::kv::cache::{CacheShape, KvCache};

/// Recycles cache entries so steady-state session churn allocates nothing.
///
/// Keyed by `(shape, capacity)`; renting returns a reset entry, new or
/// reused, and returning an entry resets it and keeps at most
/// `max_per_key` around. Thread-safe; entries themselves are exclusively
/// owned while rented.
#[derive(Debug)]
pub struct KvCachePool {
    free: Mutex<HashMap<(CacheShape, usize), Vec<KvCache>>>,
    max_per_key: usize,
}

impl Default for KvCachePool {
    fn default() -> Self {
        Self::new(8)
    }
}

impl KvCachePool {
    pub fn new(max_per_key: usize) -> Self {
        Self {
            free: Mutex::new(HashMap::new()),
            max_per_key,
        }
    }

    pub fn rent(&self, shape: CacheShape, capacity: usize) -> KvCache {
        let reused = self
            .free
            .lock()
            .get_mut(&(shape, capacity))
            .and_then(Vec::pop);
        match reused {
            Some(mut cache) => {
                cache.reset();
                tracing::trace!(?shape, capacity, "reusing pooled kv cache");
                cache
            }
            None => KvCache::new(shape, capacity),
        }
    }

    /// Hand an entry back. Dropped on the floor when the key is already at
    /// max occupancy.
    pub fn put_back(&self, mut cache: KvCache) {
        cache.reset();
        let key = (cache.shape(), cache.capacity());
        let mut free = self.free.lock();
        let bucket = free.entry(key).or_default();
        if bucket.len() < self.max_per_key {
            bucket.push(cache);
        }
    }

    #[cfg(test)]
    fn pooled(&self, shape: CacheShape, capacity: usize) -> usize {
        self.free
            .lock()
            .get(&(shape, capacity))
            .map_or(0, Vec::len)
    }
}
