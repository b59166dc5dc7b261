//! Bounded retry loop with classified attempt outcomes
//!
//! Every attempt reports an [`AttemptOutcome`]: success, a transient failure
//! worth retrying, or a permanent failure that stops the loop immediately.
//! Whether to retry is a pure function of that classification and the attempt
//! budget ([`should_retry`]); the delay between attempts comes from a
//! [`Backoff`] strategy.
//!
//! # Example
//!
//! ```no_run
//! use relay_dl::retry::{AttemptOutcome, Backoff, RetryPolicy, run_with_retry};
//! use std::time::Duration;
//!
//! # async fn example() {
//! let policy = RetryPolicy {
//!     max_attempts: 3,
//!     backoff: Backoff::Fixed(Duration::from_millis(500)),
//! };
//!
//! let result = run_with_retry(&policy, |attempt| async move {
//!     if attempt == 0 {
//!         AttemptOutcome::Transient("connection reset".to_string())
//!     } else {
//!         AttemptOutcome::Success(42)
//!     }
//! })
//! .await;
//! assert_eq!(result.ok(), Some(42));
//! # }
//! ```

use std::future::Future;
use std::time::Duration;

/// Classified result of one attempt
#[derive(Debug)]
pub enum AttemptOutcome<T, E> {
    /// The attempt succeeded
    Success(T),
    /// The attempt failed in a way that may succeed later (5xx, timeout, reset)
    Transient(E),
    /// The attempt failed in a way retrying cannot fix (4xx, malformed response)
    Permanent(E),
}

/// Delay schedule between attempts
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Backoff {
    /// Same delay before every retry
    Fixed(Duration),
    /// `base + retry_index * increment`
    Linear {
        /// Delay before the first retry
        base: Duration,
        /// Added for every further retry
        increment: Duration,
    },
}

impl Backoff {
    /// Delay to wait after the failed attempt with the given zero-based index
    pub fn delay_for(&self, attempt_index: u32) -> Duration {
        match *self {
            Backoff::Fixed(delay) => delay,
            Backoff::Linear { base, increment } => {
                base.saturating_add(increment.saturating_mul(attempt_index))
            }
        }
    }
}

/// Attempt budget plus delay schedule
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one
    pub max_attempts: u32,
    /// Delay schedule
    pub backoff: Backoff,
}

/// Terminal failure of a retried operation
#[derive(Debug, PartialEq, Eq)]
pub enum RetryFailure<E> {
    /// A permanent failure stopped the loop
    Permanent {
        /// The error reported by the failing attempt
        error: E,
        /// Attempts made, including the failing one
        attempts: u32,
    },
    /// Every attempt failed transiently
    Exhausted {
        /// The error reported by the last attempt
        last_error: E,
        /// Attempts made
        attempts: u32,
    },
}

impl<E> RetryFailure<E> {
    /// Attempts made before giving up
    pub fn attempts(&self) -> u32 {
        match self {
            RetryFailure::Permanent { attempts, .. } | RetryFailure::Exhausted { attempts, .. } => {
                *attempts
            }
        }
    }

    /// The last error observed
    pub fn into_error(self) -> E {
        match self {
            RetryFailure::Permanent { error, .. } => error,
            RetryFailure::Exhausted { last_error, .. } => last_error,
        }
    }
}

/// Whether another attempt should follow.
///
/// `attempts_made` counts the attempt that produced the outcome.
pub fn should_retry<T, E>(outcome: &AttemptOutcome<T, E>, attempts_made: u32, max_attempts: u32) -> bool {
    matches!(outcome, AttemptOutcome::Transient(_)) && attempts_made < max_attempts
}

/// Run `operation` until it succeeds, fails permanently, or the budget runs out.
///
/// The closure receives the zero-based attempt index. At least one attempt is
/// always made, even if `max_attempts` is zero.
pub async fn run_with_retry<F, Fut, T, E>(
    policy: &RetryPolicy,
    mut operation: F,
) -> Result<T, RetryFailure<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = AttemptOutcome<T, E>>,
    E: std::fmt::Display,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt: u32 = 0;

    loop {
        let outcome = operation(attempt).await;
        let attempts_made = attempt + 1;
        let retry = should_retry(&outcome, attempts_made, max_attempts);

        match outcome {
            AttemptOutcome::Success(value) => {
                if attempt > 0 {
                    tracing::info!(attempts = attempts_made, "operation succeeded after retry");
                }
                return Ok(value);
            }
            AttemptOutcome::Permanent(error) => {
                tracing::error!(error = %error, attempts = attempts_made, "operation failed with non-retryable error");
                return Err(RetryFailure::Permanent {
                    error,
                    attempts: attempts_made,
                });
            }
            AttemptOutcome::Transient(error) if retry => {
                let delay = policy.backoff.delay_for(attempt);
                tracing::warn!(
                    error = %error,
                    attempt = attempts_made,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    "operation failed, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            AttemptOutcome::Transient(error) => {
                tracing::error!(
                    error = %error,
                    attempts = attempts_made,
                    "operation failed after all retry attempts exhausted"
                );
                return Err(RetryFailure::Exhausted {
                    last_error: error,
                    attempts: attempts_made,
                });
            }
        }
    }
}
