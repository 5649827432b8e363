//! On-disk blob storage, one file per cache record.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use tokio::fs;
use tracing::debug;

use super::CacheError;
use super::record::CacheRecord;

/// Directory of cache blobs named by record filename.
#[derive(Debug, Clone)]
pub struct BlobStore {
    dir: PathBuf,
}

impl BlobStore {
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Directory new records are stored under.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Truncates and writes the blob for `record`.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Blob`] if the directory or file cannot be written.
    pub async fn write(&self, record: &CacheRecord, bytes: &[u8]) -> Result<PathBuf, CacheError> {
        fs::create_dir_all(&record.filepath)
            .await
            .map_err(|e| CacheError::blob(&record.filepath, e))?;
        let path = record.blob_path();
        fs::write(&path, bytes)
            .await
            .map_err(|e| CacheError::blob(&path, e))?;
        debug!(path = %path.display(), bytes = bytes.len(), "cache blob written");
        Ok(path)
    }

    /// Reads the blob for `record`. A missing file is `Ok(None)`.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Blob`] for IO failures other than not-found.
    pub async fn read(&self, record: &CacheRecord) -> Result<Option<Bytes>, CacheError> {
        let path = record.blob_path();
        match fs::read(&path).await {
            Ok(data) => Ok(Some(Bytes::from(data))),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(CacheError::blob(path, e)),
        }
    }

    /// Removes the blob for `record`. A missing file is not an error.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Blob`] for IO failures other than not-found.
    pub async fn remove(&self, record: &CacheRecord) -> Result<(), CacheError> {
        let path = record.blob_path();
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(CacheError::blob(path, e)),
        }
    }
}
