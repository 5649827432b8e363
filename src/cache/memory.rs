//! Bounded in-memory LRU tier.
//!
//! Entries carry no TTL; they leave only under capacity pressure or an
//! explicit clear. Overflow evicts the least-recently-used entry.

use std::num::NonZeroUsize;
use std::sync::{Mutex, PoisonError};

use lru::LruCache;
use tracing::trace;

use super::CachedValue;
use crate::request::ProcessorId;

/// One memory-tier entry: the value plus the processor id it was stored for.
#[derive(Debug, Clone)]
pub struct MemoryEntry {
    /// Processor that produced or will consume the value.
    pub tag: ProcessorId,
    /// Raw bytes or an already-parsed object.
    pub value: CachedValue,
}

/// Thread-safe bounded LRU keyed by URL.
#[derive(Debug)]
pub struct MemoryCache {
    entries: Mutex<LruCache<String, MemoryEntry>>,
}

impl MemoryCache {
    /// Creates a cache holding at most `capacity` entries (minimum one).
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Returns a clone of the entry for `key` and marks it recently used.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<MemoryEntry> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.get(key).cloned()
    }

    /// Inserts or replaces the entry for `key`.
    pub fn put(&self, key: impl Into<String>, tag: ProcessorId, value: CachedValue) {
        let key = key.into();
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some((evicted, _)) = entries.push(key.clone(), MemoryEntry { tag, value }) {
            if evicted != key {
                trace!(key = %evicted, "memory cache evicted least-recently-used entry");
            }
        }
    }

    /// Removes the entry for `key`, returning whether one existed.
    pub fn remove(&self, key: &str) -> bool {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.pop(key).is_some()
    }

    pub fn clear(&self) {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.clear();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .cap()
            .get()
    }
}
