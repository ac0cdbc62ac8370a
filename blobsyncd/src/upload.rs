use blobsync_core::{ChunkOutcome, RemoteTransfer, ResumeToken};
use tracing::debug;
use url::Url;

use crate::error::SyncError;
use crate::queue::PendingUpload;
use crate::store::{BlobStore, StoreError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum UploadState {
    NotStarted,
    InProgress(ResumeToken),
    Completed(Url),
}

impl UploadState {
    fn resume_from(upload: &PendingUpload) -> Self {
        match &upload.resume_state {
            Some(token) => UploadState::InProgress(token.clone()),
            None => UploadState::NotStarted,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum UploadOutcome {
    Completed(Url),
    /// The queue row was overwritten while this upload ran; nothing local
    /// was changed on its behalf.
    Superseded,
}

/// Drives one pending upload to completion, checkpointing after every
/// acknowledged chunk.
pub(crate) async fn run(
    store: &BlobStore,
    remote: &dyn RemoteTransfer,
    upload: &PendingUpload,
    revision: i64,
) -> Result<UploadOutcome, SyncError> {
    let path = upload.path.as_str();
    let content = store
        .get_cached(path)
        .await?
        .ok_or_else(|| StoreError::MissingContent(path.to_string()))?;

    let mut state = UploadState::resume_from(upload);
    if let UploadState::InProgress(_) = state {
        debug!(path, revision, "resuming upload from checkpoint");
    }
    loop {
        state = match state {
            UploadState::NotStarted => {
                let token = remote
                    .begin_upload(path, &content, &upload.metadata)
                    .await?;
                if !store.checkpoint(path, revision, &token).await? {
                    return Ok(UploadOutcome::Superseded);
                }
                debug!(path, revision, "upload session started");
                UploadState::InProgress(token)
            }
            UploadState::InProgress(token) => match remote.advance(&token, &content).await? {
                ChunkOutcome::Continue(next) => {
                    if !store.checkpoint(path, revision, &next).await? {
                        return Ok(UploadOutcome::Superseded);
                    }
                    debug!(path, revision, "chunk acknowledged");
                    UploadState::InProgress(next)
                }
                ChunkOutcome::Finish(metadata) => {
                    let reference = remote.download_reference(&metadata);
                    if !store.complete_upload(path, revision, &reference).await? {
                        return Ok(UploadOutcome::Superseded);
                    }
                    UploadState::Completed(reference)
                }
            },
            UploadState::Completed(reference) => return Ok(UploadOutcome::Completed(reference)),
        };
    }
}
