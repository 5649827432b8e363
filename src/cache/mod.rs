//! Two-tier response cache.
//!
//! Lookups consult a bounded in-memory LRU first, then a persistent tier of
//! blobs indexed by [`CacheRecord`] rows keyed on the URL's content hash.
//!
//! - Memory entries have no TTL; they leave under LRU pressure or on clear.
//! - Persistent entries expire when `(now - created) >= cache_time`, except
//!   [`CacheTime::Forever`]. Expired or blob-less records are deleted on lookup.
//! - Store and blob failures during lookup read as a miss.
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//! use courier_core::cache::CacheLayer;
//! use courier_core::request::CacheTime;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let cache = CacheLayer::open(std::path::Path::new(".courier-cache"), 64).await?;
//! let record = cache.new_record("https://example.com/a", CacheTime::Ttl(Duration::from_secs(60)), false);
//! cache.put(&record, b"hello").await?;
//! assert!(cache.lookup("https://example.com/a").await.is_some());
//! # Ok(())
//! # }
//! ```

mod blob;
mod error;
mod memory;
mod record;
mod store;

use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

pub use blob::BlobStore;
pub use error::CacheError;
pub use memory::{MemoryCache, MemoryEntry};
pub use record::{CacheRecord, content_hash, now_millis};
pub use store::{BulkInsertReport, RecordStore, SqliteRecordStore};

use crate::db::Database;
use crate::delivery::Payload;
use crate::request::{CacheTime, ProcessorId};

/// File name of the record database inside the cache directory.
pub const DATABASE_FILE: &str = "cache.db";

/// Subdirectory of the cache directory holding blobs.
pub const BLOB_DIR: &str = "blobs";

/// Tier a cached value was served from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provenance {
    Memory,
    File,
}

/// Cached content: raw bytes or an already-parsed object.
#[derive(Clone)]
pub enum CachedValue {
    Bytes(Bytes),
    Object(Payload),
}

impl fmt::Debug for CachedValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bytes(bytes) => f.debug_tuple("Bytes").field(&bytes.len()).finish(),
            Self::Object(_) => f.write_str("Object(..)"),
        }
    }
}

impl CachedValue {
    #[must_use]
    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            Self::Bytes(bytes) => Some(bytes),
            Self::Object(_) => None,
        }
    }

    #[must_use]
    pub fn as_object(&self) -> Option<&Payload> {
        match self {
            Self::Object(payload) => Some(payload),
            Self::Bytes(_) => None,
        }
    }
}

/// A cache lookup result tagged with its tier.
#[derive(Debug, Clone)]
pub struct CachedObject {
    pub provenance: Provenance,
    pub value: CachedValue,
    /// Processor the memory entry was stored for; `None` for file hits.
    pub tag: Option<ProcessorId>,
}

impl CachedObject {
    #[must_use]
    pub fn file(bytes: Bytes) -> Self {
        Self {
            provenance: Provenance::File,
            value: CachedValue::Bytes(bytes),
            tag: None,
        }
    }

    #[must_use]
    pub fn memory(entry: MemoryEntry) -> Self {
        Self {
            provenance: Provenance::Memory,
            value: entry.value,
            tag: Some(entry.tag),
        }
    }
}

/// Hit/miss counters.
#[derive(Debug, Default)]
pub struct CacheStats {
    memory_hits: AtomicUsize,
    file_hits: AtomicUsize,
    misses: AtomicUsize,
    evicted: AtomicUsize,
    writes: AtomicUsize,
}

impl CacheStats {
    #[must_use]
    pub fn memory_hits(&self) -> usize {
        self.memory_hits.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn file_hits(&self) -> usize {
        self.file_hits.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn misses(&self) -> usize {
        self.misses.load(Ordering::SeqCst)
    }

    /// Persistent entries deleted because they were expired or broken.
    #[must_use]
    pub fn evicted(&self) -> usize {
        self.evicted.load(Ordering::SeqCst)
    }

    /// Persistent entries written.
    #[must_use]
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    fn record(counter: &AtomicUsize, n: usize) {
        counter.fetch_add(n, Ordering::SeqCst);
    }
}

/// Memory tier plus persistent tier.
pub struct CacheLayer {
    memory: MemoryCache,
    store: Arc<dyn RecordStore>,
    blobs: BlobStore,
    stats: CacheStats,
    /// Serializes persistent writes and deletions so a record and its blob
    /// change together.
    writer: Mutex<()>,
}

impl fmt::Debug for CacheLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheLayer")
            .field("memory_len", &self.memory.len())
            .field("blob_dir", &self.blobs.dir())
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

impl CacheLayer {
    #[must_use]
    pub fn new(store: Arc<dyn RecordStore>, blobs: BlobStore, memory_capacity: usize) -> Self {
        Self {
            memory: MemoryCache::new(memory_capacity),
            store,
            blobs,
            stats: CacheStats::default(),
            writer: Mutex::new(()),
        }
    }

    /// Opens a `SQLite`-backed cache rooted at `dir`, creating it if needed.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError`] if the directory or database cannot be created.
    #[instrument(skip(dir), fields(dir = %dir.display()))]
    pub async fn open(dir: &Path, memory_capacity: usize) -> Result<Self, CacheError> {
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| CacheError::blob(dir, e))?;
        let db = Database::new(&dir.join(DATABASE_FILE)).await?;
        let store = Arc::new(SqliteRecordStore::new(db));
        Ok(Self::new(store, BlobStore::new(dir.join(BLOB_DIR)), memory_capacity))
    }

    /// Builds a record for `url` stored under this layer's blob directory.
    #[must_use]
    pub fn new_record(&self, url: &str, cache_time: CacheTime, use_offline: bool) -> CacheRecord {
        CacheRecord::new(url, cache_time, self.blobs.dir(), use_offline)
    }

    /// Memory tier first, then persistent tier.
    #[instrument(skip(self), level = "debug")]
    pub async fn lookup(&self, url: &str) -> Option<CachedObject> {
        if let Some(entry) = self.memory.get(url) {
            CacheStats::record(&self.stats.memory_hits, 1);
            debug!(url = %url, "memory cache hit");
            return Some(CachedObject::memory(entry));
        }
        self.lookup_persistent(url).await
    }

    /// Persistent tier only.
    ///
    /// Expired records and records whose blob is missing are deleted and
    /// reported as a miss.
    pub async fn lookup_persistent(&self, url: &str) -> Option<CachedObject> {
        let filename = content_hash(url);
        let record = match self.store.find_by_filename(&filename).await {
            Ok(Some(record)) => record,
            Ok(None) => {
                CacheStats::record(&self.stats.misses, 1);
                return None;
            }
            Err(error) => {
                warn!(url = %url, error = %error, "cache record lookup failed, treating as miss");
                CacheStats::record(&self.stats.misses, 1);
                return None;
            }
        };

        if record.is_expired() {
            debug!(url = %url, "cache record expired");
            self.delete_entry(&record).await;
            CacheStats::record(&self.stats.misses, 1);
            return None;
        }

        match self.blobs.read(&record).await {
            Ok(Some(bytes)) => {
                CacheStats::record(&self.stats.file_hits, 1);
                debug!(url = %url, bytes = bytes.len(), "file cache hit");
                Some(CachedObject::file(bytes))
            }
            Ok(None) => {
                debug!(url = %url, "cache blob missing, dropping record");
                self.delete_entry(&record).await;
                CacheStats::record(&self.stats.misses, 1);
                None
            }
            Err(error) => {
                warn!(url = %url, error = %error, "cache blob unreadable, dropping record");
                self.delete_entry(&record).await;
                CacheStats::record(&self.stats.misses, 1);
                None
            }
        }
    }

    /// Writes `bytes` as the blob for `record`, then upserts the record.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::NotCacheable`] for no-cache records, or the
    /// underlying blob or store error.
    #[instrument(skip(self, record, bytes), fields(filename = %record.filename, len = bytes.len()))]
    pub async fn put(&self, record: &CacheRecord, bytes: &[u8]) -> Result<CacheRecord, CacheError> {
        if !record.cache_time().is_cacheable() {
            return Err(CacheError::NotCacheable {
                filename: record.filename.clone(),
            });
        }
        let _writer = self.writer.lock().await;
        self.blobs.write(record, bytes).await?;
        let stored = self.store.upsert(record).await?;
        CacheStats::record(&self.stats.writes, 1);
        Ok(stored)
    }

    /// Writes a batch of blobs, then inserts their records in one transaction.
    ///
    /// Entries whose blob cannot be written are counted as failed. If the
    /// transaction rolls back, the blobs written for it are removed.
    pub async fn put_many(&self, entries: &[(CacheRecord, Bytes)]) -> BulkInsertReport {
        let _writer = self.writer.lock().await;
        let mut written = Vec::with_capacity(entries.len());
        let mut failed = 0;
        for (record, bytes) in entries {
            if !record.cache_time().is_cacheable() {
                failed += 1;
                continue;
            }
            match self.blobs.write(record, bytes).await {
                Ok(_) => written.push(record.clone()),
                Err(error) => {
                    warn!(filename = %record.filename, error = %error, "cache blob write failed");
                    failed += 1;
                }
            }
        }

        let report = self.store.insert_many(&written).await;
        if !report.is_complete() {
            for record in &written {
                if let Err(error) = self.blobs.remove(record).await {
                    warn!(filename = %record.filename, error = %error, "cache blob cleanup failed");
                }
            }
        }
        CacheStats::record(&self.stats.writes, report.inserted);
        BulkInsertReport {
            inserted: report.inserted,
            failed: failed + report.failed,
        }
    }

    /// Stores a value in the memory tier under `key`, tagged with a processor id.
    pub fn put_memory(&self, key: impl Into<String>, tag: ProcessorId, value: CachedValue) {
        self.memory.put(key, tag, value);
    }

    /// Deletes every expired persistent entry and its blob. Returns the count deleted.
    #[instrument(skip(self))]
    pub async fn evict_expired(&self) -> usize {
        let records = match self.store.all().await {
            Ok(records) => records,
            Err(error) => {
                warn!(error = %error, "cache sweep could not list records");
                return 0;
            }
        };
        let now = now_millis();
        let mut removed = 0;
        for record in records.iter().filter(|r| r.is_expired_at(now)) {
            if self.delete_entry(record).await {
                removed += 1;
            }
        }
        if removed > 0 {
            info!(removed, "expired cache entries swept");
        }
        removed
    }

    /// Removes `url` from both tiers. Returns whether anything was removed.
    pub async fn remove(&self, url: &str) -> bool {
        let from_memory = self.memory.remove(url);
        let from_store = match self.store.find_by_filename(&content_hash(url)).await {
            Ok(Some(record)) => self.delete_entry(&record).await,
            Ok(None) => false,
            Err(error) => {
                warn!(url = %url, error = %error, "cache remove lookup failed");
                false
            }
        };
        from_memory || from_store
    }

    pub fn clear_memory(&self) {
        self.memory.clear();
    }

    /// Empties both tiers. Returns the number of persistent records removed.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError`] if the record store cannot be listed or cleared.
    pub async fn clear_all(&self) -> Result<u64, CacheError> {
        self.memory.clear();
        let _writer = self.writer.lock().await;
        for record in self.store.all().await? {
            if let Err(error) = self.blobs.remove(&record).await {
                warn!(filename = %record.filename, error = %error, "cache blob removal failed");
            }
        }
        self.store.delete_all().await
    }

    #[must_use]
    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    #[must_use]
    pub fn memory_len(&self) -> usize {
        self.memory.len()
    }

    #[must_use]
    pub fn blob_dir(&self) -> &Path {
        self.blobs.dir()
    }

    /// Runs [`evict_expired`](Self::evict_expired) every `interval` until the
    /// cache is dropped or the handle is aborted.
    #[must_use]
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // First tick fires immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(cache) = weak.upgrade() else {
                    debug!("cache dropped, sweeper exiting");
                    break;
                };
                cache.evict_expired().await;
            }
        })
    }

    /// Deletes the record, then its blob, unless the record was rewritten
    /// since it was read. Returns whether the record was deleted.
    async fn delete_entry(&self, record: &CacheRecord) -> bool {
        let _writer = self.writer.lock().await;
        let deleted = match self.store.delete_if_unchanged(record).await {
            Ok(deleted) => deleted,
            Err(error) => {
                warn!(filename = %record.filename, error = %error, "cache record delete failed");
                return false;
            }
        };
        if !deleted {
            debug!(filename = %record.filename, "cache record changed, keeping entry");
            return false;
        }
        if let Err(error) = self.blobs.remove(record).await {
            warn!(filename = %record.filename, error = %error, "cache blob delete failed");
        }
        CacheStats::record(&self.stats.evicted, 1);
        true
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    async fn layer(temp: &TempDir) -> CacheLayer {
        let store = Arc::new(SqliteRecordStore::new(Database::new_in_memory().await.unwrap()));
        CacheLayer::new(store, BlobStore::new(temp.path().join("blobs")), 4)
    }

    const URL: &str = "https://example.com/data";

    #[tokio::test]
    async fn test_put_then_lookup_is_file_hit_with_identical_bytes() {
        let temp = TempDir::new().unwrap();
        let cache = layer(&temp).await;
        let record = cache.new_record(URL, CacheTime::Ttl(Duration::from_secs(3600)), false);
        cache.put(&record, b"payload").await.unwrap();

        let hit = cache.lookup(URL).await.unwrap();
        assert_eq!(hit.provenance, Provenance::File);
        assert_eq!(hit.value.as_bytes().unwrap().as_ref(), b"payload");
        assert_eq!(cache.stats().file_hits(), 1);
    }

    #[tokio::test]
    async fn test_memory_tier_wins_over_file_tier() {
        let temp = TempDir::new().unwrap();
        let cache = layer(&temp).await;
        let record = cache.new_record(URL, CacheTime::Forever, false);
        cache.put(&record, b"file").await.unwrap();
        cache.put_memory(URL, 3, CachedValue::Bytes(Bytes::from_static(b"mem")));

        let hit = cache.lookup(URL).await.unwrap();
        assert_eq!(hit.provenance, Provenance::Memory);
        assert_eq!(hit.tag, Some(3));
        assert_eq!(hit.value.as_bytes().unwrap().as_ref(), b"mem");
    }

    #[tokio::test]
    async fn test_no_cache_record_is_refused() {
        let temp = TempDir::new().unwrap();
        let cache = layer(&temp).await;
        let record = cache.new_record(URL, CacheTime::NoCache, false);
        let err = cache.put(&record, b"x").await.unwrap_err();
        assert!(matches!(err, CacheError::NotCacheable { .. }));
        assert!(cache.lookup(URL).await.is_none());
    }

    #[tokio::test]
    async fn test_expired_record_is_deleted_on_lookup() {
        let temp = TempDir::new().unwrap();
        let cache = layer(&temp).await;
        let hour = CacheTime::Ttl(Duration::from_secs(3600));
        let stale = CacheRecord::created_at(URL, hour, cache.blob_dir(), false, now_millis() - 61 * 60 * 1000);
        cache.put(&stale, b"old").await.unwrap();

        assert!(cache.lookup(URL).await.is_none());
        assert!(!stale.blob_path().exists(), "blob should be deleted");
        assert_eq!(cache.stats().evicted(), 1);
        assert!(cache.store.find_by_filename(&stale.filename).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_missing_blob_is_a_miss_and_drops_record() {
        let temp = TempDir::new().unwrap();
        let cache = layer(&temp).await;
        let record = cache.new_record(URL, CacheTime::Forever, false);
        cache.put(&record, b"x").await.unwrap();
        std::fs::remove_file(record.blob_path()).unwrap();

        assert!(cache.lookup(URL).await.is_none());
        assert!(cache.store.find_by_filename(&record.filename).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_evict_expired_keeps_forever_and_fresh() {
        let temp = TempDir::new().unwrap();
        let cache = layer(&temp).await;
        let long_ago = now_millis() - 10 * 24 * 60 * 60 * 1000;
        let forever = CacheRecord::created_at("https://example.com/forever", CacheTime::Forever, cache.blob_dir(), false, long_ago);
        let stale = CacheRecord::created_at("https://example.com/stale", CacheTime::Ttl(Duration::from_secs(60)), cache.blob_dir(), false, long_ago);
        let fresh = cache.new_record("https://example.com/fresh", CacheTime::Ttl(Duration::from_secs(60)), false);
        for rec in [&forever, &stale, &fresh] {
            cache.put(rec, b"x").await.unwrap();
        }

        assert_eq!(cache.evict_expired().await, 1);
        assert!(cache.lookup("https://example.com/forever").await.is_some());
        assert!(cache.lookup("https://example.com/fresh").await.is_some());
        assert!(cache.lookup("https://example.com/stale").await.is_none());
    }

    #[tokio::test]
    async fn test_put_many_and_clear_all() {
        let temp = TempDir::new().unwrap();
        let cache = layer(&temp).await;
        let entries: Vec<_> = (0..3)
            .map(|i| {
                (
                    cache.new_record(&format!("https://example.com/{i}"), CacheTime::Forever, true),
                    Bytes::from(format!("body-{i}")),
                )
            })
            .collect();
        let report = cache.put_many(&entries).await;
        assert_eq!(report, BulkInsertReport { inserted: 3, failed: 0 });

        let hit = cache.lookup("https://example.com/1").await.unwrap();
        assert_eq!(hit.value.as_bytes().unwrap().as_ref(), b"body-1");

        assert_eq!(cache.clear_all().await.unwrap(), 3);
        assert!(cache.lookup("https://example.com/1").await.is_none());
    }

    #[tokio::test]
    async fn test_remove_clears_both_tiers() {
        let temp = TempDir::new().unwrap();
        let cache = layer(&temp).await;
        let record = cache.new_record(URL, CacheTime::Forever, false);
        cache.put(&record, b"x").await.unwrap();
        cache.put_memory(URL, 1, CachedValue::Bytes(Bytes::from_static(b"x")));

        assert!(cache.remove(URL).await);
        assert!(cache.lookup(URL).await.is_none());
        assert!(!cache.remove(URL).await);
    }

    #[tokio::test]
    async fn test_clear_memory_falls_back_to_file() {
        let temp = TempDir::new().unwrap();
        let cache = layer(&temp).await;
        let record = cache.new_record(URL, CacheTime::Forever, false);
        cache.put(&record, b"file").await.unwrap();
        cache.put_memory(URL, 1, CachedValue::Object(Arc::new(7u8)));
        cache.clear_memory();
        assert_eq!(cache.memory_len(), 0);
        assert_eq!(cache.lookup(URL).await.unwrap().provenance, Provenance::File);
    }

    #[tokio::test]
    async fn test_open_creates_database_and_blob_dir() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("cache");
        let cache = CacheLayer::open(&root, 8).await.unwrap();
        let record = cache.new_record(URL, CacheTime::Forever, false);
        cache.put(&record, b"x").await.unwrap();
        assert!(root.join(DATABASE_FILE).exists());
        assert!(root.join(BLOB_DIR).join(&record.filename).exists());
    }

    #[tokio::test]
    async fn test_sweeper_evicts_then_stops_when_cache_dropped() {
        let temp = TempDir::new().unwrap();
        let cache = Arc::new(layer(&temp).await);
        let stale = CacheRecord::created_at(
            URL,
            CacheTime::Ttl(Duration::from_millis(1)),
            cache.blob_dir(),
            false,
            now_millis() - 1_000,
        );
        cache.put(&stale, b"x").await.unwrap();

        let handle = cache.spawn_sweeper(Duration::from_millis(20));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!stale.blob_path().exists(), "sweeper should delete stale blob");

        drop(cache);
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
