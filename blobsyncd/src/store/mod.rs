//! Durable state: content cache, resolved-object directory, pending queue
//! and dead letters, all in one sqlite database.

mod names;
mod sql;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use blobsync_core::ResumeToken;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Sqlite, SqlitePool, Transaction};
use thiserror::Error;
use url::Url;

use crate::queue::{FailedOperation, PendingOperation, QueuedOperation};

pub use names::CollectionNames;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("XDG data directory is unavailable")]
    MissingDataDir,
    #[error("invalid collection name: {0:?}")]
    InvalidCollectionName(String),
    #[error("invalid operation kind: {0}")]
    InvalidOperationKind(String),
    #[error("stored upload metadata is unreadable: {0}")]
    Metadata(#[from] serde_json::Error),
    #[error("stored reference is not a url: {0}")]
    Reference(#[from] url::ParseError),
    #[error("no cached content for pending upload of {0}")]
    MissingContent(String),
}

/// Confirmed remote download reference for a path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedObject {
    pub path: String,
    pub reference: Url,
    pub resolved_at: i64,
}

#[derive(Clone)]
pub struct BlobStore {
    pool: SqlitePool,
    names: Arc<CollectionNames>,
}

impl BlobStore {
    pub fn from_pool(pool: SqlitePool, names: CollectionNames) -> Result<Self, StoreError> {
        names.validate()?;
        Ok(Self {
            pool,
            names: Arc::new(names),
        })
    }

    /// Opens (creating if needed) the database file at `path`.
    ///
    /// The schema is not touched; call [`BlobStore::ensure_schema`] before use.
    pub async fn open(path: &Path, names: CollectionNames) -> Result<Self, StoreError> {
        names.validate()?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);
        let pool = SqlitePool::connect_with(options).await?;
        Self::from_pool(pool, names)
    }

    /// Private in-memory database. It lives exactly as long as its single
    /// connection, so that connection is never recycled.
    pub async fn in_memory(names: CollectionNames) -> Result<Self, StoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;
        Self::from_pool(pool, names)
    }

    pub fn names(&self) -> &CollectionNames {
        &self.names
    }

    /// Creates any missing collection. Safe to call repeatedly.
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        for statement in sql::schema(&self.names) {
            sqlx::query(&statement).execute(&mut *tx).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn transaction(&self) -> Result<StoreTx, StoreError> {
        Ok(StoreTx {
            tx: self.pool.begin().await?,
            names: Arc::clone(&self.names),
        })
    }

    pub async fn get_cached(&self, path: &str) -> Result<Option<Vec<u8>>, StoreError> {
        sql::get_cached(&self.pool, &self.names, path).await
    }

    pub async fn put_cached(&self, path: &str, content: &[u8]) -> Result<(), StoreError> {
        sql::put_cached(&self.pool, &self.names, path, content).await
    }

    pub async fn delete_cached(&self, path: &str) -> Result<(), StoreError> {
        sql::delete_cached(&self.pool, &self.names, path).await
    }

    pub async fn get_resolved(&self, path: &str) -> Result<Option<ResolvedObject>, StoreError> {
        sql::get_resolved(&self.pool, &self.names, path).await
    }

    pub async fn put_resolved(&self, path: &str, reference: &Url) -> Result<(), StoreError> {
        sql::put_resolved(&self.pool, &self.names, path, reference).await
    }

    pub async fn delete_resolved(&self, path: &str) -> Result<(), StoreError> {
        sql::delete_resolved(&self.pool, &self.names, path).await
    }

    pub async fn get_pending(&self, path: &str) -> Result<Option<QueuedOperation>, StoreError> {
        sql::get_pending(&self.pool, &self.names, path).await
    }

    /// Oldest-first scan of the queue.
    pub async fn first_pending(&self, limit: u32) -> Result<Vec<QueuedOperation>, StoreError> {
        sql::first_pending(&self.pool, &self.names, limit).await
    }

    /// Removes the pending operation for `path` regardless of revision.
    pub async fn delete_pending(&self, path: &str) -> Result<bool, StoreError> {
        sql::delete_pending(&self.pool, &self.names, path, None).await
    }

    pub async fn list_failed(&self) -> Result<Vec<FailedOperation>, StoreError> {
        sql::list_failed(&self.pool, &self.names).await
    }

    /// Persists the newest resume token if `revision` is still current.
    pub async fn checkpoint(
        &self,
        path: &str,
        revision: i64,
        token: &ResumeToken,
    ) -> Result<bool, StoreError> {
        sql::set_resume_state(&self.pool, &self.names, path, revision, token).await
    }

    /// Installs the resolved reference and clears the queue row and cached
    /// content in one transaction. Nothing changes if `revision` is stale.
    pub async fn complete_upload(
        &self,
        path: &str,
        revision: i64,
        reference: &Url,
    ) -> Result<bool, StoreError> {
        let mut tx = self.pool.begin().await?;
        if !sql::delete_pending(&mut *tx, &self.names, path, Some(revision)).await? {
            tx.rollback().await?;
            return Ok(false);
        }
        sql::put_resolved(&mut *tx, &self.names, path, reference).await?;
        sql::delete_cached(&mut *tx, &self.names, path).await?;
        tx.commit().await?;
        Ok(true)
    }

    pub async fn complete_delete(&self, path: &str, revision: i64) -> Result<bool, StoreError> {
        sql::delete_pending(&self.pool, &self.names, path, Some(revision)).await
    }

    /// Bumps the attempt counter of a failed row and returns the new count,
    /// or `None` if the row was superseded meanwhile.
    pub async fn record_failure(
        &self,
        path: &str,
        revision: i64,
        error: &str,
    ) -> Result<Option<u32>, StoreError> {
        sql::record_attempt(&self.pool, &self.names, path, revision, error).await
    }

    /// Installs a looked-up reference unless a delete for `path` is queued.
    pub async fn resolve_unless_deleted(
        &self,
        path: &str,
        reference: &Url,
    ) -> Result<bool, StoreError> {
        sql::put_resolved_unless_deleted(&self.pool, &self.names, path, reference).await
    }

    /// Moves the queue row for `path` into the failed collection.
    pub async fn dead_letter(
        &self,
        path: &str,
        revision: i64,
        error: &str,
    ) -> Result<bool, StoreError> {
        let mut tx = self.pool.begin().await?;
        if !sql::copy_to_failed(&mut *tx, &self.names, path, revision, error).await? {
            tx.rollback().await?;
            return Ok(false);
        }
        sql::delete_pending(&mut *tx, &self.names, path, Some(revision)).await?;
        tx.commit().await?;
        Ok(true)
    }

    /// Puts the newest failed operation for `path` back on the queue.
    ///
    /// A requeued delete hides the path again, just as a fresh delete does.
    /// Returns `false` without requeueing when a newer intent is already
    /// pending (the failed records are dropped) or when an upload's cached
    /// content is gone (the failed records are kept).
    pub async fn requeue_failed(&self, path: &str) -> Result<bool, StoreError> {
        let mut tx = self.pool.begin().await?;
        let failed = sql::take_failed(&mut *tx, &self.names, path).await?;
        let Some(latest) = failed.into_iter().last() else {
            tx.rollback().await?;
            return Ok(false);
        };
        if sql::get_pending(&mut *tx, &self.names, path).await?.is_some() {
            tx.commit().await?;
            return Ok(false);
        }
        match &latest.operation {
            PendingOperation::Upload(_) => {
                if sql::get_cached(&mut *tx, &self.names, path).await?.is_none() {
                    tx.rollback().await?;
                    return Ok(false);
                }
            }
            PendingOperation::Delete(_) => {
                sql::delete_cached(&mut *tx, &self.names, path).await?;
                sql::delete_resolved(&mut *tx, &self.names, path).await?;
            }
        }
        sql::upsert_pending(&mut *tx, &self.names, &latest.operation).await?;
        tx.commit().await?;
        Ok(true)
    }
}

/// A multi-collection write that becomes visible all at once on
/// [`StoreTx::commit`]. Dropping it without committing rolls back.
pub struct StoreTx {
    tx: Transaction<'static, Sqlite>,
    names: Arc<CollectionNames>,
}

impl StoreTx {
    pub async fn put_cached(&mut self, path: &str, content: &[u8]) -> Result<(), StoreError> {
        sql::put_cached(&mut *self.tx, &self.names, path, content).await
    }

    pub async fn delete_cached(&mut self, path: &str) -> Result<(), StoreError> {
        sql::delete_cached(&mut *self.tx, &self.names, path).await
    }

    pub async fn delete_resolved(&mut self, path: &str) -> Result<(), StoreError> {
        sql::delete_resolved(&mut *self.tx, &self.names, path).await
    }

    /// Replaces whatever is pending for the operation's path; returns the
    /// new revision.
    pub async fn enqueue(&mut self, op: &PendingOperation) -> Result<i64, StoreError> {
        sql::upsert_pending(&mut *self.tx, &self.names, op).await
    }

    pub async fn commit(self) -> Result<(), StoreError> {
        self.tx.commit().await?;
        Ok(())
    }
}

pub fn default_db_path() -> Result<PathBuf, StoreError> {
    let mut path = dirs::data_dir().ok_or(StoreError::MissingDataDir)?;
    path.push("blobsync");
    path.push("queue.db");
    Ok(path)
}

pub(crate) fn now_unix() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
#[path = "store_tests.rs"]
mod tests;
