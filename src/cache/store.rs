//! Persistent cache record store.
//!
//! [`RecordStore`] is the key-indexed seam the cache layer talks to;
//! [`SqliteRecordStore`] backs it with the `cache_records` table.

use std::path::PathBuf;

use async_trait::async_trait;
use sqlx::{Executor, FromRow, Sqlite};
use tracing::{instrument, warn};

use super::CacheError;
use super::record::CacheRecord;
use crate::db::Database;

/// Outcome of a batched insert.
///
/// A batch commits as a whole or not at all, so `inserted` is either the
/// batch size or zero.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BulkInsertReport {
    pub inserted: usize,
    pub failed: usize,
}

impl BulkInsertReport {
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.failed == 0
    }
}

/// Data-access contract for cache metadata.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Inserts or replaces the record with the same filename. Returns the stored record.
    async fn upsert(&self, record: &CacheRecord) -> Result<CacheRecord, CacheError>;

    /// Equality lookup by filename. Absence is `Ok(None)`.
    async fn find_by_filename(&self, filename: &str) -> Result<Option<CacheRecord>, CacheError>;

    /// Deletes by filename, returning whether a row was removed.
    async fn delete_by_filename(&self, filename: &str) -> Result<bool, CacheError>;

    /// Deletes `record` only if the stored row still has its creation time and
    /// cache time, so a concurrent rewrite of the same filename survives.
    /// Returns whether a row was removed.
    async fn delete_if_unchanged(&self, record: &CacheRecord) -> Result<bool, CacheError>;

    /// Returns every record.
    async fn all(&self) -> Result<Vec<CacheRecord>, CacheError>;

    /// Deletes every record, returning the count removed.
    async fn delete_all(&self) -> Result<u64, CacheError>;

    /// Upserts a batch inside one transaction.
    ///
    /// Failures roll the batch back and are logged; they are reported in the
    /// returned counts, never as an error.
    async fn insert_many(&self, records: &[CacheRecord]) -> BulkInsertReport;
}

#[derive(Debug, FromRow)]
struct CacheRecordRow {
    id: i64,
    created_at: i64,
    cache_time: i64,
    filename: String,
    filepath: String,
    use_offline: i64,
}

impl From<CacheRecordRow> for CacheRecord {
    fn from(row: CacheRecordRow) -> Self {
        Self {
            id: Some(row.id),
            created_at: row.created_at,
            cache_time: row.cache_time,
            filename: row.filename,
            filepath: PathBuf::from(row.filepath),
            use_offline: row.use_offline != 0,
        }
    }
}

/// `SQLite`-backed [`RecordStore`].
#[derive(Debug, Clone)]
pub struct SqliteRecordStore {
    db: Database,
}

impl SqliteRecordStore {
    #[must_use]
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    #[must_use]
    pub fn database(&self) -> &Database {
        &self.db
    }
}

async fn upsert_with<'e, E>(executor: E, record: &CacheRecord) -> Result<i64, CacheError>
where
    E: Executor<'e, Database = Sqlite>,
{
    let filepath = record
        .filepath
        .to_str()
        .ok_or_else(|| CacheError::NonUtf8Path(record.filepath.clone()))?;
    let (id,): (i64,) = sqlx::query_as(
        r"INSERT INTO cache_records (created_at, cache_time, filename, filepath, use_offline)
          VALUES (?, ?, ?, ?, ?)
          ON CONFLICT(filename) DO UPDATE SET
              created_at = excluded.created_at,
              cache_time = excluded.cache_time,
              filepath = excluded.filepath,
              use_offline = excluded.use_offline
          RETURNING id",
    )
    .bind(record.created_at)
    .bind(record.cache_time)
    .bind(&record.filename)
    .bind(filepath)
    .bind(i64::from(record.use_offline))
    .fetch_one(executor)
    .await?;
    Ok(id)
}

#[async_trait]
impl RecordStore for SqliteRecordStore {
    #[instrument(skip(self, record), fields(filename = %record.filename))]
    async fn upsert(&self, record: &CacheRecord) -> Result<CacheRecord, CacheError> {
        let id = upsert_with(self.db.pool(), record).await?;
        Ok(CacheRecord {
            id: Some(id),
            ..record.clone()
        })
    }

    async fn find_by_filename(&self, filename: &str) -> Result<Option<CacheRecord>, CacheError> {
        let row = sqlx::query_as::<_, CacheRecordRow>(
            r"SELECT id, created_at, cache_time, filename, filepath, use_offline
              FROM cache_records WHERE filename = ?",
        )
        .bind(filename)
        .fetch_optional(self.db.pool())
        .await?;
        Ok(row.map(CacheRecord::from))
    }

    async fn delete_by_filename(&self, filename: &str) -> Result<bool, CacheError> {
        let result = sqlx::query(r"DELETE FROM cache_records WHERE filename = ?")
            .bind(filename)
            .execute(self.db.pool())
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_if_unchanged(&self, record: &CacheRecord) -> Result<bool, CacheError> {
        let result = sqlx::query(
            r"DELETE FROM cache_records
              WHERE filename = ? AND created_at = ? AND cache_time = ?",
        )
        .bind(&record.filename)
        .bind(record.created_at)
        .bind(record.cache_time)
        .execute(self.db.pool())
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn all(&self) -> Result<Vec<CacheRecord>, CacheError> {
        let rows = sqlx::query_as::<_, CacheRecordRow>(
            r"SELECT id, created_at, cache_time, filename, filepath, use_offline
              FROM cache_records ORDER BY created_at ASC",
        )
        .fetch_all(self.db.pool())
        .await?;
        Ok(rows.into_iter().map(CacheRecord::from).collect())
    }

    async fn delete_all(&self) -> Result<u64, CacheError> {
        let result = sqlx::query(r"DELETE FROM cache_records")
            .execute(self.db.pool())
            .await?;
        Ok(result.rows_affected())
    }

    #[instrument(skip(self, records), fields(batch = records.len()))]
    async fn insert_many(&self, records: &[CacheRecord]) -> BulkInsertReport {
        if records.is_empty() {
            return BulkInsertReport::default();
        }
        let rejected = BulkInsertReport {
            inserted: 0,
            failed: records.len(),
        };

        let mut tx = match self.db.pool().begin().await {
            Ok(tx) => tx,
            Err(error) => {
                warn!(error = %error, "bulk cache insert could not open a transaction");
                return rejected;
            }
        };

        for record in records {
            if let Err(error) = upsert_with(&mut *tx, record).await {
                warn!(
                    filename = %record.filename,
                    error = %error,
                    "bulk cache insert failed, rolling back batch"
                );
                if let Err(rollback_error) = tx.rollback().await {
                    warn!(error = %rollback_error, "bulk cache insert rollback failed");
                }
                return rejected;
            }
        }

        match tx.commit().await {
            Ok(()) => BulkInsertReport {
                inserted: records.len(),
                failed: 0,
            },
            Err(error) => {
                warn!(error = %error, "bulk cache insert commit failed");
                rejected
            }
        }
    }
}
