pub mod backoff;
pub mod config;
pub mod error;
pub mod events;
pub mod logging;
pub mod processor;
pub mod queue;
pub mod store;
pub mod sync;
mod upload;

#[cfg(test)]
mod testing;

pub use backoff::{Backoff, RetryPolicy};
pub use config::SyncConfig;
pub use error::SyncError;
pub use events::{CompletionEvent, FailureEvent};
pub use queue::{FailedOperation, OperationKind, PendingOperation, QueuedOperation};
pub use store::{BlobStore, CollectionNames, StoreError};
pub use sync::{BlobSync, BlobSyncBuilder, DownloadRef, LocalBlob};
