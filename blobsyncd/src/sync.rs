use std::sync::Arc;

use blobsync_core::{RemoteTransfer, UploadMetadata};
use bytes::Bytes;
use tracing::debug;
use url::Url;

use crate::backoff::RetryPolicy;
use crate::error::SyncError;
use crate::events::{CompletionEvent, FailureEvent, Listeners};
use crate::processor::QueueProcessor;
use crate::queue::{FailedOperation, PendingOperation, QueuedOperation};
use crate::store::BlobStore;

/// Content of a path as held by this process.
///
/// Valid for the current session only; persist the path, not this value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalBlob {
    path: String,
    content: Bytes,
}

impl LocalBlob {
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn bytes(&self) -> &Bytes {
        &self.content
    }

    pub fn len(&self) -> usize {
        self.content.len()
    }

    pub fn is_empty(&self) -> bool {
        self.content.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadRef {
    /// Not yet confirmed remotely; served from the local cache.
    Local(LocalBlob),
    Remote(Url),
}

impl DownloadRef {
    pub fn is_local(&self) -> bool {
        matches!(self, DownloadRef::Local(_))
    }

    pub fn remote_url(&self) -> Option<&Url> {
        match self {
            DownloadRef::Remote(url) => Some(url),
            DownloadRef::Local(_) => None,
        }
    }
}

pub struct BlobSyncBuilder {
    remote: Arc<dyn RemoteTransfer>,
    listeners: Listeners,
    retry: RetryPolicy,
}

impl BlobSyncBuilder {
    pub fn on_complete<F>(mut self, callback: F) -> Self
    where
        F: Fn(&CompletionEvent) + Send + Sync + 'static,
    {
        self.listeners.on_complete = Some(Arc::new(callback));
        self
    }

    pub fn on_error<F>(mut self, callback: F) -> Self
    where
        F: Fn(&FailureEvent) + Send + Sync + 'static,
    {
        self.listeners.on_error = Some(Arc::new(callback));
        self
    }

    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    /// Binds a store whose schema is ready and starts draining whatever it
    /// already holds. Must be called inside a tokio runtime.
    pub fn bind(self, store: BlobStore) -> BlobSync {
        let processor = QueueProcessor::new(
            store.clone(),
            Arc::clone(&self.remote),
            self.listeners,
            self.retry,
        );
        processor.start();
        BlobSync {
            store,
            remote: self.remote,
            processor,
        }
    }
}

/// Entry point for callers: enqueue uploads and deletes, resolve download
/// references.
#[derive(Clone)]
pub struct BlobSync {
    store: BlobStore,
    remote: Arc<dyn RemoteTransfer>,
    processor: QueueProcessor,
}

impl BlobSync {
    pub fn builder(remote: Arc<dyn RemoteTransfer>) -> BlobSyncBuilder {
        BlobSyncBuilder {
            remote,
            listeners: Listeners::default(),
            retry: RetryPolicy::default(),
        }
    }

    pub fn store(&self) -> &BlobStore {
        &self.store
    }

    /// Caches `content`, queues the upload (replacing anything pending for
    /// `path`) and wakes the processor without waiting for it.
    pub async fn upload(
        &self,
        path: &str,
        content: impl Into<Bytes>,
        metadata: UploadMetadata,
    ) -> Result<LocalBlob, SyncError> {
        let content = content.into();
        let mut tx = self.store.transaction().await?;
        tx.put_cached(path, &content).await?;
        let revision = tx
            .enqueue(&PendingOperation::upload(path, metadata))
            .await?;
        tx.commit().await?;
        debug!(path, revision, bytes = content.len(), "upload queued");
        self.processor.start();
        Ok(LocalBlob {
            path: path.to_string(),
            content,
        })
    }

    /// Drops local content and resolved reference right away and queues the
    /// remote delete.
    pub async fn delete(&self, path: &str) -> Result<(), SyncError> {
        let mut tx = self.store.transaction().await?;
        tx.delete_cached(path).await?;
        tx.delete_resolved(path).await?;
        let revision = tx.enqueue(&PendingOperation::delete(path)).await?;
        tx.commit().await?;
        debug!(path, revision, "delete queued");
        self.processor.start();
        Ok(())
    }

    /// Resolves cached content first, then a stored reference, then asks the
    /// remote (remembering the answer).
    pub async fn download_url(&self, path: &str) -> Result<DownloadRef, SyncError> {
        if let Some(content) = self.store.get_cached(path).await? {
            return Ok(DownloadRef::Local(LocalBlob {
                path: path.to_string(),
                content: Bytes::from(content),
            }));
        }
        if let Some(resolved) = self.store.get_resolved(path).await? {
            return Ok(DownloadRef::Remote(resolved.reference));
        }
        if self.has_pending_delete(path).await? {
            return Err(SyncError::NotFound {
                path: path.to_string(),
            });
        }

        let reference = self.remote.lookup_download_reference(path).await?;
        // A delete queued during the lookup wins over the stale answer.
        if !self.store.resolve_unless_deleted(path, &reference).await? {
            return Err(SyncError::NotFound {
                path: path.to_string(),
            });
        }
        Ok(DownloadRef::Remote(reference))
    }

    async fn has_pending_delete(&self, path: &str) -> Result<bool, SyncError> {
        Ok(matches!(
            self.store.get_pending(path).await?.map(|queued| queued.operation),
            Some(PendingOperation::Delete(_))
        ))
    }

    /// Oldest-first view of the queue.
    pub async fn pending(&self, limit: u32) -> Result<Vec<QueuedOperation>, SyncError> {
        Ok(self.store.first_pending(limit).await?)
    }

    pub async fn failed(&self) -> Result<Vec<FailedOperation>, SyncError> {
        Ok(self.store.list_failed().await?)
    }

    /// Puts a dead-lettered operation back on the queue and starts the
    /// processor. Returns `false` if nothing was requeued.
    pub async fn requeue_failed(&self, path: &str) -> Result<bool, SyncError> {
        let requeued = self.store.requeue_failed(path).await?;
        if requeued {
            self.processor.start();
        }
        Ok(requeued)
    }

    /// Restarts a halted processor. No-op while one is running.
    pub fn start(&self) -> bool {
        self.processor.start()
    }

    pub fn is_running(&self) -> bool {
        self.processor.is_running()
    }

    pub async fn wait_idle(&self) {
        self.processor.wait_idle().await
    }
}

#[cfg(test)]
#[path = "sync_tests.rs"]
mod tests;
