use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use blobsync_core::RemoteTransfer;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::backoff::{FailureAction, RetryPolicy};
use crate::error::SyncError;
use crate::events::{CompletionEvent, FailureEvent, Listeners};
use crate::queue::{PendingOperation, QueuedOperation};
use crate::store::BlobStore;
use crate::upload::{self, UploadOutcome};

enum Step {
    Next,
    Idle,
    Halt,
}

enum Outcome {
    Completed,
    Superseded,
}

/// Single-flight worker that drains the pending queue head-first.
#[derive(Clone)]
pub struct QueueProcessor {
    inner: Arc<Inner>,
}

struct Inner {
    store: BlobStore,
    remote: Arc<dyn RemoteTransfer>,
    listeners: Listeners,
    retry: RetryPolicy,
    running: watch::Sender<bool>,
    /// Set by every `start` call; a loop about to go idle re-reads the
    /// queue instead when it sees this.
    wake: AtomicBool,
}

impl QueueProcessor {
    pub fn new(
        store: BlobStore,
        remote: Arc<dyn RemoteTransfer>,
        listeners: Listeners,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                remote,
                listeners,
                retry,
                running: watch::Sender::new(false),
                wake: AtomicBool::new(false),
            }),
        }
    }

    /// Spawns a drain loop unless one is already active. Returns whether a
    /// new loop was started. Must be called inside a tokio runtime.
    pub fn start(&self) -> bool {
        self.inner.wake.store(true, Ordering::SeqCst);
        let claimed = self.inner.running.send_if_modified(|running| {
            if *running {
                false
            } else {
                *running = true;
                true
            }
        });
        if claimed {
            let worker = self.clone();
            tokio::spawn(async move { worker.drain().await });
        }
        claimed
    }

    pub fn is_running(&self) -> bool {
        *self.inner.running.borrow()
    }

    /// Resolves once no drain loop is active.
    pub async fn wait_idle(&self) {
        let mut running = self.inner.running.subscribe();
        let _ = running.wait_for(|running| !*running).await;
    }

    async fn drain(self) {
        let mut guard = RunningGuard {
            running: &self.inner.running,
            armed: true,
        };
        loop {
            self.inner.wake.store(false, Ordering::SeqCst);
            match self.process_head().await {
                Step::Next => {}
                Step::Halt => return,
                Step::Idle => {
                    let stopped = self.inner.running.send_if_modified(|running| {
                        if self.inner.wake.load(Ordering::SeqCst) {
                            false
                        } else {
                            *running = false;
                            true
                        }
                    });
                    if stopped {
                        // A `start` may already own the flag again.
                        guard.armed = false;
                        return;
                    }
                }
            }
        }
    }

    async fn process_head(&self) -> Step {
        let head = match self.inner.store.first_pending(1).await {
            Ok(mut head) => match head.pop() {
                Some(op) => op,
                None => return Step::Idle,
            },
            Err(err) => {
                error!(error = %err, "reading queue head failed, halting");
                return Step::Halt;
            }
        };

        match self.execute(&head).await {
            Ok(Outcome::Completed) => {
                info!(
                    path = head.path(),
                    kind = head.operation.kind().as_str(),
                    "operation completed"
                );
                self.inner.listeners.complete(&CompletionEvent {
                    path: head.path().to_string(),
                    kind: head.operation.kind(),
                });
                Step::Next
            }
            Ok(Outcome::Superseded) => {
                debug!(
                    path = head.path(),
                    revision = head.revision,
                    "operation superseded while running"
                );
                Step::Next
            }
            Err(err) => self.handle_failure(&head, err).await,
        }
    }

    async fn execute(&self, op: &QueuedOperation) -> Result<Outcome, SyncError> {
        match &op.operation {
            PendingOperation::Upload(pending) => {
                let remote = self.inner.remote.as_ref();
                match upload::run(&self.inner.store, remote, pending, op.revision).await? {
                    UploadOutcome::Completed(_) => Ok(Outcome::Completed),
                    UploadOutcome::Superseded => Ok(Outcome::Superseded),
                }
            }
            PendingOperation::Delete(pending) => {
                self.inner.remote.delete(&pending.path).await?;
                if self
                    .inner
                    .store
                    .complete_delete(&pending.path, op.revision)
                    .await?
                {
                    Ok(Outcome::Completed)
                } else {
                    Ok(Outcome::Superseded)
                }
            }
        }
    }

    async fn handle_failure(&self, op: &QueuedOperation, error: SyncError) -> Step {
        let store = &self.inner.store;
        let path = op.path();
        let message = error.to_string();

        let attempt = match store.record_failure(path, op.revision, &message).await {
            Ok(Some(attempt)) => attempt,
            Ok(None) => {
                debug!(path, error = %message, "failed operation was superseded, dropping error");
                return Step::Next;
            }
            Err(store_err) => {
                error!(
                    path,
                    error = %message,
                    store_error = %store_err,
                    "could not record failure, halting"
                );
                self.report(op, error, op.attempt + 1, false);
                return Step::Halt;
            }
        };

        let action = self.inner.retry.on_failure(attempt, error.is_retryable());
        let mut dead_lettered = false;
        if action == FailureAction::DeadLetter {
            match store.dead_letter(path, op.revision, &message).await {
                Ok(moved) => dead_lettered = moved,
                Err(store_err) => {
                    error!(
                        path,
                        store_error = %store_err,
                        "could not dead-letter operation, halting"
                    );
                    self.report(op, error, attempt, false);
                    return Step::Halt;
                }
            }
        }

        warn!(path, attempt, dead_lettered, error = %message, "operation failed");
        self.report(op, error, attempt, dead_lettered);

        match action {
            FailureAction::Halt => Step::Halt,
            FailureAction::RetryAfter(delay) => {
                debug!(path, delay_ms = delay.as_millis() as u64, "retrying after backoff");
                tokio::time::sleep(delay).await;
                Step::Next
            }
            FailureAction::DeadLetter => Step::Next,
        }
    }

    fn report(&self, op: &QueuedOperation, error: SyncError, attempt: u32, dead_lettered: bool) {
        self.inner.listeners.error(&FailureEvent {
            path: op.path().to_string(),
            kind: op.operation.kind(),
            error,
            attempt,
            dead_lettered,
        });
    }
}

/// Clears the running flag when a drain loop ends without going idle,
/// including when it unwinds from a panic or its task is dropped.
struct RunningGuard<'a> {
    running: &'a watch::Sender<bool>,
    armed: bool,
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.running.send_replace(false);
        }
    }
}
