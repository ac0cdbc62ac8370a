use std::fmt;
use std::sync::Arc;

use crate::error::SyncError;
use crate::queue::OperationKind;

/// Emitted once an operation's remote effect is confirmed and local state
/// has been reconciled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionEvent {
    pub path: String,
    pub kind: OperationKind,
}

#[derive(Debug)]
pub struct FailureEvent {
    pub path: String,
    pub kind: OperationKind,
    pub error: SyncError,
    /// Failed attempts recorded for this queue row, including this one.
    pub attempt: u32,
    /// The operation was moved to the failed collection.
    pub dead_lettered: bool,
}

pub type CompletionCallback = Arc<dyn Fn(&CompletionEvent) + Send + Sync>;
pub type FailureCallback = Arc<dyn Fn(&FailureEvent) + Send + Sync>;

#[derive(Clone, Default)]
pub struct Listeners {
    pub(crate) on_complete: Option<CompletionCallback>,
    pub(crate) on_error: Option<FailureCallback>,
}

impl Listeners {
    pub(crate) fn complete(&self, event: &CompletionEvent) {
        if let Some(callback) = &self.on_complete {
            callback(event);
        }
    }

    pub(crate) fn error(&self, event: &FailureEvent) {
        if let Some(callback) = &self.on_error {
            callback(event);
        }
    }
}

impl fmt::Debug for Listeners {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listeners")
            .field("on_complete", &self.on_complete.is_some())
            .field("on_error", &self.on_error.is_some())
            .finish()
    }
}
