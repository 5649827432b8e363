//! Persistent cache metadata.

use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use sha2::{Digest, Sha256};

use crate::request::{CACHE_FOREVER_MS, CacheTime, NO_CACHE_MS};

/// Returns the current time in epoch milliseconds.
#[must_use]
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| i64::try_from(elapsed.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

/// Lowercase hex SHA-256 of `url`; the persistent-tier key and blob filename.
#[must_use]
pub fn content_hash(url: &str) -> String {
    format!("{:x}", Sha256::digest(url.as_bytes()))
}

/// Metadata row for one cached blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheRecord {
    /// Store-assigned id; `None` until persisted.
    pub id: Option<i64>,
    /// Creation time in epoch milliseconds.
    pub created_at: i64,
    /// Stored cache time (ms, or a sentinel).
    pub cache_time: i64,
    /// Content hash of the source URL.
    pub filename: String,
    /// Directory holding the blob.
    pub filepath: PathBuf,
    /// Whether the entry was marked usable offline.
    pub use_offline: bool,
}

impl CacheRecord {
    /// Builds a fresh record for `url`, stamped with the current time.
    #[must_use]
    pub fn new(url: &str, cache_time: CacheTime, dir: &Path, use_offline: bool) -> Self {
        Self::created_at(url, cache_time, dir, use_offline, now_millis())
    }

    /// Builds a record with an explicit creation time.
    #[must_use]
    pub fn created_at(
        url: &str,
        cache_time: CacheTime,
        dir: &Path,
        use_offline: bool,
        created_at: i64,
    ) -> Self {
        Self {
            id: None,
            created_at,
            cache_time: cache_time.as_millis(),
            filename: content_hash(url),
            filepath: dir.to_path_buf(),
            use_offline,
        }
    }

    /// Decoded cache time.
    #[must_use]
    pub fn cache_time(&self) -> CacheTime {
        CacheTime::from_millis(self.cache_time)
    }

    /// Full path of the backing blob.
    #[must_use]
    pub fn blob_path(&self) -> PathBuf {
        self.filepath.join(&self.filename)
    }

    /// Expiry rule: `(now - created) >= cache_time`, except "forever" never expires.
    #[must_use]
    pub fn is_expired_at(&self, now_ms: i64) -> bool {
        if self.cache_time == CACHE_FOREVER_MS {
            return false;
        }
        if self.cache_time <= NO_CACHE_MS {
            return true;
        }
        now_ms.saturating_sub(self.created_at) >= self.cache_time
    }

    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(now_millis())
    }
}
