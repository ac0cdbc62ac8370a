use blobsync_core::{ResumeToken, UploadMetadata};

use crate::store::StoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    Upload,
    Delete,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Upload => "upload",
            OperationKind::Delete => "delete",
        }
    }

    pub(crate) fn parse(value: &str) -> Result<Self, StoreError> {
        match value {
            "upload" => Ok(OperationKind::Upload),
            "delete" => Ok(OperationKind::Delete),
            other => Err(StoreError::InvalidOperationKind(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingUpload {
    pub path: String,
    pub metadata: UploadMetadata,
    /// Absent until the remote has issued a session for this upload.
    pub resume_state: Option<ResumeToken>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingDelete {
    pub path: String,
}

/// Intent recorded in the queue collection, at most one per path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PendingOperation {
    Upload(PendingUpload),
    Delete(PendingDelete),
}

impl PendingOperation {
    pub fn upload(path: impl Into<String>, metadata: UploadMetadata) -> Self {
        PendingOperation::Upload(PendingUpload {
            path: path.into(),
            metadata,
            resume_state: None,
        })
    }

    pub fn delete(path: impl Into<String>) -> Self {
        PendingOperation::Delete(PendingDelete { path: path.into() })
    }

    pub fn path(&self) -> &str {
        match self {
            PendingOperation::Upload(upload) => &upload.path,
            PendingOperation::Delete(delete) => &delete.path,
        }
    }

    pub fn kind(&self) -> OperationKind {
        match self {
            PendingOperation::Upload(_) => OperationKind::Upload,
            PendingOperation::Delete(_) => OperationKind::Delete,
        }
    }
}

/// A queue row together with its bookkeeping columns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedOperation {
    pub id: i64,
    pub operation: PendingOperation,
    /// Bumped every time a new intent overwrites the row for this path.
    pub revision: i64,
    pub attempt: u32,
    pub last_error: Option<String>,
}

impl QueuedOperation {
    pub fn path(&self) -> &str {
        self.operation.path()
    }
}

/// An operation the processor gave up on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedOperation {
    pub id: i64,
    pub operation: PendingOperation,
    pub attempt: u32,
    pub error: String,
    pub failed_at: i64,
}
