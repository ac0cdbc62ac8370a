use blobsync_core::TransferError;
use thiserror::Error;

use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Transfer(TransferError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("no object stored at {path}")]
    NotFound { path: String },
}

impl From<TransferError> for SyncError {
    fn from(err: TransferError) -> Self {
        match err {
            TransferError::NotFound { path } => SyncError::NotFound { path },
            other => SyncError::Transfer(other),
        }
    }
}

impl SyncError {
    /// Whether running the same operation again may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Transfer(err) => err.is_retryable(),
            SyncError::Store(StoreError::Sqlx(_) | StoreError::Io(_)) => true,
            SyncError::Store(_) | SyncError::NotFound { .. } => false,
        }
    }
}
