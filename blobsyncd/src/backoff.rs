use rand::Rng;
use std::time::Duration;

/// Exponential delay between retries of a failed queue head.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    jitter: bool,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration, jitter: bool) -> Self {
        Self { base, max, jitter }
    }

    /// Delay before retry number `attempt` (1 for the first retry).
    pub fn delay(&self, attempt: u32) -> Duration {
        let mut rng = rand::thread_rng();
        self.delay_with_rng(attempt, &mut rng)
    }

    pub fn delay_with_rng<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let base_ms = self.base.as_millis().min(u128::from(u64::MAX)) as u64;
        let max_ms = self.max.as_millis().min(u128::from(u64::MAX)) as u64;
        let shift = attempt.saturating_sub(1).min(16);
        let ceiling = base_ms.saturating_mul(1u64 << shift).min(max_ms);
        let delay_ms = if self.jitter {
            // Upper half of the window.
            rng.gen_range(ceiling / 2..=ceiling)
        } else {
            ceiling
        };
        Duration::from_millis(delay_ms)
    }
}

/// What the processor does after an operation fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RetryPolicy {
    /// Stop draining and leave the failed operation at the head of the queue
    /// until something calls `start` again.
    #[default]
    Halt,
    /// Retry retryable failures after a delay; once `max_attempts` is reached
    /// (or the failure is not retryable) move the operation to the failed
    /// collection and carry on with the rest of the queue.
    Backoff { max_attempts: u32, backoff: Backoff },
}

/// Decision taken for one failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FailureAction {
    Halt,
    RetryAfter(Duration),
    DeadLetter,
}

impl RetryPolicy {
    pub fn backoff(max_attempts: u32, base: Duration, max: Duration) -> Self {
        RetryPolicy::Backoff {
            max_attempts,
            backoff: Backoff::new(base, max, true),
        }
    }

    pub(crate) fn on_failure(&self, attempt: u32, retryable: bool) -> FailureAction {
        match self {
            RetryPolicy::Halt => FailureAction::Halt,
            RetryPolicy::Backoff {
                max_attempts,
                backoff,
            } => {
                if retryable && attempt < *max_attempts {
                    FailureAction::RetryAfter(backoff.delay(attempt))
                } else {
                    FailureAction::DeadLetter
                }
            }
        }
    }
}
