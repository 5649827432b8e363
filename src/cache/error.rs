//! Error types for cache operations.

use std::path::PathBuf;

use thiserror::Error;

use crate::db::DbError;

/// Errors raised by the persistent cache tier.
///
/// [`CacheLayer::lookup`](super::CacheLayer::lookup) never surfaces these; a
/// failing store or blob reads as a miss.
#[derive(Debug, Error)]
pub enum CacheError {
    /// The record store query failed.
    #[error("cache record store error: {0}")]
    Store(#[from] sqlx::Error),

    /// A blob could not be read, written or removed.
    #[error("cache blob IO error at {path}: {source}")]
    Blob {
        /// Blob path involved.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The record database could not be opened.
    #[error("cache database error: {0}")]
    Database(#[from] DbError),

    /// A record's stored path is not valid UTF-8 and cannot be persisted.
    #[error("cache path is not valid UTF-8: {0}")]
    NonUtf8Path(PathBuf),

    /// A no-cache reply was offered for persistence.
    #[error("refusing to persist a no-cache record for {filename}")]
    NotCacheable {
        /// Record filename.
        filename: String,
    },
}

impl CacheError {
    /// Creates a blob IO error with the path attached.
    #[must_use]
    pub fn blob(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Blob {
            path: path.into(),
            source,
        }
    }
}
