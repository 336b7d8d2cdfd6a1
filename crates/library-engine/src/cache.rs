//! Fixed-capacity cache with least-recently-used eviction

use std::hash::Hash;
use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;

/// Hit/miss counters and size of a [`RecencyCache`]
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct CacheStats {
    pub len: usize,
    pub capacity: usize,
    pub hits: u64,
    pub misses: u64,
}

struct CacheInner<K: Hash + Eq, V> {
    entries: LruCache<K, Arc<V>>,
    /// Bumped by every invalidation
    epoch: u64,
    hits: u64,
    misses: u64,
}

/// Fixed-capacity key/value cache with LRU eviction
///
/// Values are handed out as shared snapshots; callers never mutate them. The
/// cache is best-effort and never the source of truth: an absent key is a
/// normal outcome.
pub struct RecencyCache<K: Hash + Eq, V> {
    inner: Mutex<CacheInner<K, V>>,
    capacity: NonZeroUsize,
}

impl<K: Hash + Eq, V> RecencyCache<K, V> {
    /// Create a new [`RecencyCache`]; a capacity of zero is raised to one
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Mutex::new(CacheInner {
                entries: LruCache::new(capacity),
                epoch: 0,
                hits: 0,
                misses: 0,
            }),
            capacity,
        }
    }

    /// Look up `key`, marking it most recently used
    pub fn get(&self, key: &K) -> Option<Arc<V>> {
        let mut inner = self.inner.lock();
        match inner.entries.get(key).cloned() {
            Some(value) => {
                inner.hits += 1;
                Some(value)
            }
            None => {
                inner.misses += 1;
                None
            }
        }
    }

    /// Insert or replace `key` as the most recently used entry
    ///
    /// Evicts the least recently used entry if the cache is full.
    pub fn put(&self, key: K, value: V) -> Arc<V> {
        let value = Arc::new(value);
        self.inner.lock().entries.put(key, value.clone());
        value
    }

    /// Insert `key` unless an invalidation happened since `epoch` was read
    ///
    /// A value loaded from the source of truth before a concurrent
    /// invalidation may already be stale; it is returned but not cached.
    pub fn put_if_unchanged(&self, key: K, value: V, epoch: u64) -> Arc<V> {
        let value = Arc::new(value);
        let mut inner = self.inner.lock();
        if inner.epoch == epoch {
            inner.entries.put(key, value.clone());
        }
        value
    }

    /// Current invalidation epoch, for [`Self::put_if_unchanged()`]
    pub fn epoch(&self) -> u64 {
        self.inner.lock().epoch
    }

    /// Remove `key`; returns whether it was present
    pub fn invalidate(&self, key: &K) -> bool {
        let mut inner = self.inner.lock();
        inner.epoch += 1;
        inner.entries.pop(key).is_some()
    }

    /// Remove every entry; the counters are kept
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.epoch += 1;
        inner.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity.get()
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock();
        CacheStats {
            len: inner.entries.len(),
            capacity: self.capacity.get(),
            hits: inner.hits,
            misses: inner.misses,
        }
    }
}
