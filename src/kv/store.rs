use std::collections::HashMap;

use parking_lot::Mutex;

use crate::error::{BudgetKind, QuernError, QuernResult};
use crate::kv::cache::{CacheShape, KvCache};
use crate::kv::pool::KvCachePool;
use crate::telemetry::{Telemetry, TelemetryEvent};

/// Budgets for the per-session cache store.
#[derive(Debug, Clone, Copy, Default)]
pub struct KvStoreConfig {
    /// Cap on one session's cache bytes. Exceeding it refuses the session.
    pub per_session_max: Option<u64>,
    /// Cap on the sum of all resident caches. Exceeding it evicts LRU.
    pub total_max: Option<u64>,
    /// Cap on the number of resident sessions. Exceeding it evicts LRU.
    pub max_sessions: Option<usize>,
}

struct Entry {
    /// `None` while the owning session has the cache checked out.
    cache: Option<KvCache>,
    bytes: u64,
    last_used: u64,
}

struct Inner {
    entries: HashMap<String, Entry>,
    clock: u64,
    total_bytes: u64,
}

/// LRU store of per-session KV caches.
///
/// Creation enforces the per-session byte cap up front; the total byte cap
/// and session-count cap are enforced by evicting the least-recently-used
/// idle session. A checked-out cache is never evicted; the session using
/// it holds exclusive ownership until check-in.
pub struct KvStore {
    config: KvStoreConfig,
    pool: KvCachePool,
    telemetry: Telemetry,
    inner: Mutex<Inner>,
}

impl KvStore {
    pub fn new(config: KvStoreConfig, telemetry: Telemetry) -> Self {
        Self {
            config,
            pool: KvCachePool::default(),
            telemetry,
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                clock: 0,
                total_bytes: 0,
            }),
        }
    }

    /// Create (or replace) the cache entry for a session.
    ///
    /// The per-session budget check emits `KvCacheBudgetExceeded` and then
    /// fails; the total/count budgets evict instead of failing.
    pub fn create(
        &self,
        session_id: &str,
        shape: CacheShape,
        capacity: usize,
    ) -> QuernResult<()> {
        let bytes = shape.size_bytes(capacity);
        if let Some(limit) = self.config.per_session_max {
            if bytes > limit {
                self.telemetry.record(TelemetryEvent::KvCacheBudgetExceeded {
                    session_id: session_id.to_string(),
                    requested_bytes: bytes,
                    limit_bytes: limit,
                });
                return Err(QuernError::BudgetExceeded {
                    kind: BudgetKind::KvCachePerSession,
                    message: format!(
                        "session cache needs {} bytes, per-session limit is {}",
                        bytes, limit
                    ),
                });
            }
        }

        let mut inner = self.inner.lock();
        if let Some(old) = inner.entries.remove(session_id) {
            inner.total_bytes -= old.bytes;
            if let Some(cache) = old.cache {
                self.pool.put_back(cache);
            }
        }

        self.evict_for(&mut inner, bytes)?;

        let cache = self.pool.rent(shape, capacity);
        inner.clock += 1;
        let stamp = inner.clock;
        inner.total_bytes += bytes;
        inner.entries.insert(
            session_id.to_string(),
            Entry {
                cache: Some(cache),
                bytes,
                last_used: stamp,
            },
        );
        Ok(())
    }

    /// Evict idle LRU entries until `incoming` bytes and one more session
    /// fit the configured caps.
    fn evict_for(&self, inner: &mut Inner, incoming: u64) -> QuernResult<()> {
        loop {
            let over_bytes = self
                .config
                .total_max
                .is_some_and(|max| inner.total_bytes + incoming > max);
            let over_count = self
                .config
                .max_sessions
                .is_some_and(|max| inner.entries.len() + 1 > max);
            if !over_bytes && !over_count {
                return Ok(());
            }

            let victim = inner
                .entries
                .iter()
                .filter(|(_, e)| e.cache.is_some())
                .min_by_key(|(_, e)| e.last_used)
                .map(|(id, _)| id.clone());
            let Some(victim) = victim else {
                // every resident cache is checked out; nothing to reclaim
                return Err(QuernError::BudgetExceeded {
                    kind: BudgetKind::KvCacheTotal,
                    message: format!(
                        "{} bytes requested with every resident cache in use",
                        incoming
                    ),
                });
            };

            if let Some(entry) = inner.entries.remove(&victim) {
                inner.total_bytes -= entry.bytes;
                drop(entry.cache); // reclaim, do not pool
                self.telemetry.record(TelemetryEvent::KvCacheEviction {
                    session_id: victim,
                    freed_bytes: entry.bytes,
                });
            }
        }
    }

    /// Take the session's cache for a turn. `None` means the session has no
    /// resident cache (never created, evicted, or already checked out).
    pub fn checkout(&self, session_id: &str) -> Option<KvCache> {
        let mut inner = self.inner.lock();
        inner.clock += 1;
        let stamp = inner.clock;
        let entry = inner.entries.get_mut(session_id)?;
        entry.last_used = stamp;
        entry.cache.take()
    }

    /// Return the session's cache after a turn. If the entry vanished in
    /// the meantime the cache goes back to the pool.
    pub fn checkin(&self, session_id: &str, cache: KvCache) {
        let mut inner = self.inner.lock();
        inner.clock += 1;
        let stamp = inner.clock;
        match inner.entries.get_mut(session_id) {
            Some(entry) => {
                entry.last_used = stamp;
                entry.cache = Some(cache);
            }
            None => self.pool.put_back(cache),
        }
    }

    /// Drop a session's entry, recycling its cache.
    pub fn remove(&self, session_id: &str) {
        let mut inner = self.inner.lock();
        if let Some(entry) = inner.entries.remove(session_id) {
            inner.total_bytes -= entry.bytes;
            if let Some(cache) = entry.cache {
                self.pool.put_back(cache);
            }
        }
    }

    /// Occupancy of a session's checked-in cache. `None` when the session
    /// has no resident entry or its cache is checked out. Read-only: does
    /// not touch the LRU ordering.
    pub fn resident_tokens(&self, session_id: &str) -> Option<usize> {
        self.inner
            .lock()
            .entries
            .get(session_id)
            .and_then(|entry| entry.cache.as_ref())
            .map(KvCache::current_tokens)
    }

    pub fn resident_sessions(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn total_bytes(&self) -> u64 {
        self.inner.lock().total_bytes
    }
}
