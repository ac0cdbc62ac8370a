//! Statements shared by pooled reads and transactional writes.

use blobsync_core::{ResumeToken, UploadMetadata};
use sqlx::sqlite::SqliteRow;
use sqlx::{Executor, Row, Sqlite};
use url::Url;

use super::{CollectionNames, ResolvedObject, StoreError, now_unix};
use crate::queue::{
    FailedOperation, OperationKind, PendingDelete, PendingOperation, PendingUpload,
    QueuedOperation,
};

pub(super) fn schema(names: &CollectionNames) -> [String; 4] {
    [
        format!(
            "CREATE TABLE IF NOT EXISTS {} (
                path TEXT PRIMARY KEY,
                content BLOB NOT NULL,
                stored_at INTEGER NOT NULL
            )",
            names.cache
        ),
        format!(
            "CREATE TABLE IF NOT EXISTS {} (
                path TEXT PRIMARY KEY,
                reference TEXT NOT NULL,
                resolved_at INTEGER NOT NULL
            )",
            names.resolved
        ),
        format!(
            "CREATE TABLE IF NOT EXISTS {} (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                path TEXT NOT NULL UNIQUE,
                kind TEXT NOT NULL,
                metadata TEXT,
                resume_state TEXT,
                revision INTEGER NOT NULL DEFAULT 1,
                attempt INTEGER NOT NULL DEFAULT 0,
                last_error TEXT
            )",
            names.queue
        ),
        format!(
            "CREATE TABLE IF NOT EXISTS {} (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                path TEXT NOT NULL,
                kind TEXT NOT NULL,
                metadata TEXT,
                attempt INTEGER NOT NULL,
                error TEXT NOT NULL,
                failed_at INTEGER NOT NULL
            )",
            names.failed
        ),
    ]
}

pub(super) async fn get_cached<'e, E>(
    exec: E,
    names: &CollectionNames,
    path: &str,
) -> Result<Option<Vec<u8>>, StoreError>
where
    E: Executor<'e, Database = Sqlite>,
{
    let sql = format!("SELECT content FROM {} WHERE path = ?1", names.cache);
    let row = sqlx::query(&sql).bind(path).fetch_optional(exec).await?;
    let Some(row) = row else {
        return Ok(None);
    };
    Ok(Some(row.try_get("content")?))
}

pub(super) async fn put_cached<'e, E>(
    exec: E,
    names: &CollectionNames,
    path: &str,
    content: &[u8],
) -> Result<(), StoreError>
where
    E: Executor<'e, Database = Sqlite>,
{
    let sql = format!(
        "INSERT INTO {} (path, content, stored_at) VALUES (?1, ?2, ?3)
         ON CONFLICT(path) DO UPDATE SET
            content = excluded.content,
            stored_at = excluded.stored_at",
        names.cache
    );
    sqlx::query(&sql)
        .bind(path)
        .bind(content)
        .bind(now_unix())
        .execute(exec)
        .await?;
    Ok(())
}

pub(super) async fn delete_cached<'e, E>(
    exec: E,
    names: &CollectionNames,
    path: &str,
) -> Result<(), StoreError>
where
    E: Executor<'e, Database = Sqlite>,
{
    let sql = format!("DELETE FROM {} WHERE path = ?1", names.cache);
    sqlx::query(&sql).bind(path).execute(exec).await?;
    Ok(())
}

pub(super) async fn get_resolved<'e, E>(
    exec: E,
    names: &CollectionNames,
    path: &str,
) -> Result<Option<ResolvedObject>, StoreError>
where
    E: Executor<'e, Database = Sqlite>,
{
    let sql = format!(
        "SELECT path, reference, resolved_at FROM {} WHERE path = ?1",
        names.resolved
    );
    let row = sqlx::query(&sql).bind(path).fetch_optional(exec).await?;
    let Some(row) = row else {
        return Ok(None);
    };
    let reference: String = row.try_get("reference")?;
    Ok(Some(ResolvedObject {
        path: row.try_get("path")?,
        reference: Url::parse(&reference)?,
        resolved_at: row.try_get("resolved_at")?,
    }))
}

pub(super) async fn put_resolved<'e, E>(
    exec: E,
    names: &CollectionNames,
    path: &str,
    reference: &Url,
) -> Result<(), StoreError>
where
    E: Executor<'e, Database = Sqlite>,
{
    let sql = format!(
        "INSERT INTO {} (path, reference, resolved_at) VALUES (?1, ?2, ?3)
         ON CONFLICT(path) DO UPDATE SET
            reference = excluded.reference,
            resolved_at = excluded.resolved_at",
        names.resolved
    );
    sqlx::query(&sql)
        .bind(path)
        .bind(reference.as_str())
        .bind(now_unix())
        .execute(exec)
        .await?;
    Ok(())
}

/// Installs `reference` unless a delete is queued for `path`. A single
/// statement, so it takes the write lock before looking at the queue.
pub(super) async fn put_resolved_unless_deleted<'e, E>(
    exec: E,
    names: &CollectionNames,
    path: &str,
    reference: &Url,
) -> Result<bool, StoreError>
where
    E: Executor<'e, Database = Sqlite>,
{
    let sql = format!(
        "INSERT INTO {resolved} (path, reference, resolved_at)
         SELECT ?1, ?2, ?3
         WHERE NOT EXISTS (SELECT 1 FROM {queue} WHERE path = ?1 AND kind = ?4)
         ON CONFLICT(path) DO UPDATE SET
            reference = excluded.reference,
            resolved_at = excluded.resolved_at",
        resolved = names.resolved,
        queue = names.queue
    );
    let result = sqlx::query(&sql)
        .bind(path)
        .bind(reference.as_str())
        .bind(now_unix())
        .bind(OperationKind::Delete.as_str())
        .execute(exec)
        .await?;
    Ok(result.rows_affected() > 0)
}

pub(super) async fn delete_resolved<'e, E>(
    exec: E,
    names: &CollectionNames,
    path: &str,
) -> Result<(), StoreError>
where
    E: Executor<'e, Database = Sqlite>,
{
    let sql = format!("DELETE FROM {} WHERE path = ?1", names.resolved);
    sqlx::query(&sql).bind(path).execute(exec).await?;
    Ok(())
}

/// Writes `op` as the only pending operation for its path and returns the
/// row's new revision. An existing row keeps its queue position.
pub(super) async fn upsert_pending<'e, E>(
    exec: E,
    names: &CollectionNames,
    op: &PendingOperation,
) -> Result<i64, StoreError>
where
    E: Executor<'e, Database = Sqlite>,
{
    let (metadata, resume_state) = encode_operation(op)?;
    let sql = format!(
        "INSERT INTO {queue} (path, kind, metadata, resume_state, revision, attempt, last_error)
         VALUES (?1, ?2, ?3, ?4, 1, 0, NULL)
         ON CONFLICT(path) DO UPDATE SET
            kind = excluded.kind,
            metadata = excluded.metadata,
            resume_state = excluded.resume_state,
            revision = {queue}.revision + 1,
            attempt = 0,
            last_error = NULL
         RETURNING revision",
        queue = names.queue
    );
    let row = sqlx::query(&sql)
        .bind(op.path())
        .bind(op.kind().as_str())
        .bind(metadata)
        .bind(resume_state)
        .fetch_one(exec)
        .await?;
    Ok(row.try_get("revision")?)
}

pub(super) async fn get_pending<'e, E>(
    exec: E,
    names: &CollectionNames,
    path: &str,
) -> Result<Option<QueuedOperation>, StoreError>
where
    E: Executor<'e, Database = Sqlite>,
{
    let sql = format!(
        "SELECT id, path, kind, metadata, resume_state, revision, attempt, last_error
         FROM {} WHERE path = ?1",
        names.queue
    );
    let row = sqlx::query(&sql).bind(path).fetch_optional(exec).await?;
    row.as_ref().map(queued_from_row).transpose()
}

pub(super) async fn first_pending<'e, E>(
    exec: E,
    names: &CollectionNames,
    limit: u32,
) -> Result<Vec<QueuedOperation>, StoreError>
where
    E: Executor<'e, Database = Sqlite>,
{
    let sql = format!(
        "SELECT id, path, kind, metadata, resume_state, revision, attempt, last_error
         FROM {} ORDER BY id ASC LIMIT ?1",
        names.queue
    );
    let rows = sqlx::query(&sql).bind(limit).fetch_all(exec).await?;
    rows.iter().map(queued_from_row).collect()
}

pub(super) async fn delete_pending<'e, E>(
    exec: E,
    names: &CollectionNames,
    path: &str,
    revision: Option<i64>,
) -> Result<bool, StoreError>
where
    E: Executor<'e, Database = Sqlite>,
{
    let sql = format!(
        "DELETE FROM {} WHERE path = ?1 AND (?2 IS NULL OR revision = ?2)",
        names.queue
    );
    let result = sqlx::query(&sql)
        .bind(path)
        .bind(revision)
        .execute(exec)
        .await?;
    Ok(result.rows_affected() > 0)
}

pub(super) async fn set_resume_state<'e, E>(
    exec: E,
    names: &CollectionNames,
    path: &str,
    revision: i64,
    token: &ResumeToken,
) -> Result<bool, StoreError>
where
    E: Executor<'e, Database = Sqlite>,
{
    let sql = format!(
        "UPDATE {} SET resume_state = ?1 WHERE path = ?2 AND revision = ?3",
        names.queue
    );
    let result = sqlx::query(&sql)
        .bind(token.as_str())
        .bind(path)
        .bind(revision)
        .execute(exec)
        .await?;
    Ok(result.rows_affected() > 0)
}

pub(super) async fn record_attempt<'e, E>(
    exec: E,
    names: &CollectionNames,
    path: &str,
    revision: i64,
    error: &str,
) -> Result<Option<u32>, StoreError>
where
    E: Executor<'e, Database = Sqlite>,
{
    let sql = format!(
        "UPDATE {} SET attempt = attempt + 1, last_error = ?1
         WHERE path = ?2 AND revision = ?3
         RETURNING attempt",
        names.queue
    );
    let row = sqlx::query(&sql)
        .bind(error)
        .bind(path)
        .bind(revision)
        .fetch_optional(exec)
        .await?;
    row.map(|row| row.try_get::<u32, _>("attempt"))
        .transpose()
        .map_err(StoreError::from)
}

/// Copies the queue row for `path` at `revision` into the failed
/// collection. Returns `false` if no such row exists.
pub(super) async fn copy_to_failed<'e, E>(
    exec: E,
    names: &CollectionNames,
    path: &str,
    revision: i64,
    error: &str,
) -> Result<bool, StoreError>
where
    E: Executor<'e, Database = Sqlite>,
{
    let sql = format!(
        "INSERT INTO {failed} (path, kind, metadata, attempt, error, failed_at)
         SELECT path, kind, metadata, attempt, ?3, ?4
         FROM {queue} WHERE path = ?1 AND revision = ?2",
        failed = names.failed,
        queue = names.queue
    );
    let result = sqlx::query(&sql)
        .bind(path)
        .bind(revision)
        .bind(error)
        .bind(now_unix())
        .execute(exec)
        .await?;
    Ok(result.rows_affected() > 0)
}

pub(super) async fn list_failed<'e, E>(
    exec: E,
    names: &CollectionNames,
) -> Result<Vec<FailedOperation>, StoreError>
where
    E: Executor<'e, Database = Sqlite>,
{
    let sql = format!(
        "SELECT id, path, kind, metadata, attempt, error, failed_at
         FROM {} ORDER BY id ASC",
        names.failed
    );
    let rows = sqlx::query(&sql).fetch_all(exec).await?;
    rows.iter().map(failed_from_row).collect()
}

/// Deletes every failed record for `path` and returns them, oldest first.
pub(super) async fn take_failed<'e, E>(
    exec: E,
    names: &CollectionNames,
    path: &str,
) -> Result<Vec<FailedOperation>, StoreError>
where
    E: Executor<'e, Database = Sqlite>,
{
    let sql = format!(
        "DELETE FROM {} WHERE path = ?1
         RETURNING id, path, kind, metadata, attempt, error, failed_at",
        names.failed
    );
    let rows = sqlx::query(&sql).bind(path).fetch_all(exec).await?;
    let mut failed = rows
        .iter()
        .map(failed_from_row)
        .collect::<Result<Vec<_>, _>>()?;
    failed.sort_by_key(|op| op.id);
    Ok(failed)
}

fn encode_operation(
    op: &PendingOperation,
) -> Result<(Option<String>, Option<String>), StoreError> {
    match op {
        PendingOperation::Upload(upload) => Ok((
            Some(serde_json::to_string(&upload.metadata)?),
            upload
                .resume_state
                .as_ref()
                .map(|token| token.as_str().to_string()),
        )),
        PendingOperation::Delete(_) => Ok((None, None)),
    }
}

fn decode_operation(
    kind: OperationKind,
    path: String,
    metadata: Option<String>,
    resume_state: Option<String>,
) -> Result<PendingOperation, StoreError> {
    Ok(match kind {
        OperationKind::Upload => {
            let metadata = match metadata {
                Some(raw) => serde_json::from_str(&raw)?,
                None => UploadMetadata::default(),
            };
            PendingOperation::Upload(PendingUpload {
                path,
                metadata,
                resume_state: resume_state.map(ResumeToken::new),
            })
        }
        OperationKind::Delete => PendingOperation::Delete(PendingDelete { path }),
    })
}

fn queued_from_row(row: &SqliteRow) -> Result<QueuedOperation, StoreError> {
    let kind: String = row.try_get("kind")?;
    Ok(QueuedOperation {
        id: row.try_get("id")?,
        operation: decode_operation(
            OperationKind::parse(&kind)?,
            row.try_get("path")?,
            row.try_get("metadata")?,
            row.try_get("resume_state")?,
        )?,
        revision: row.try_get("revision")?,
        attempt: row.try_get("attempt")?,
        last_error: row.try_get("last_error")?,
    })
}

fn failed_from_row(row: &SqliteRow) -> Result<FailedOperation, StoreError> {
    let kind: String = row.try_get("kind")?;
    Ok(FailedOperation {
        id: row.try_get("id")?,
        operation: decode_operation(
            OperationKind::parse(&kind)?,
            row.try_get("path")?,
            row.try_get("metadata")?,
            None,
        )?,
        attempt: row.try_get("attempt")?,
        error: row.try_get("error")?,
        failed_at: row.try_get("failed_at")?,
    })
}
