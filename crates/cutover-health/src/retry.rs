//! Bounded retry combinator.
//!
//! Runs an operation up to `max_attempts` times, sleeping between failed
//! attempts according to a `Backoff`. Each sleep races the abort signal,
//! so an operator abort is observed at the next polling tick.

use std::future::Future;
use std::time::Duration;

use tracing::debug;

use cutover_core::{AbortSignal, Backoff};

use crate::clock::Clock;

/// How a retried operation ended. Every failed attempt's error is kept,
/// oldest first.
#[derive(Debug)]
pub enum RetryOutcome<T, E> {
    Succeeded {
        value: T,
        attempts: u32,
        failures: Vec<E>,
    },
    Exhausted {
        attempts: u32,
        failures: Vec<E>,
    },
    Aborted {
        attempts: u32,
        failures: Vec<E>,
    },
}

impl<T, E> RetryOutcome<T, E> {
    /// Number of attempts actually made.
    pub fn attempts(&self) -> u32 {
        match self {
            RetryOutcome::Succeeded { attempts, .. }
            | RetryOutcome::Exhausted { attempts, .. }
            | RetryOutcome::Aborted { attempts, .. } => *attempts,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, RetryOutcome::Succeeded { .. })
    }
}

/// Retry `op` (called with the 1-based attempt number) until it succeeds,
/// `max_attempts` is reached, or `abort` fires.
///
/// Attempts are strictly sequential. The delay after the n-th failure is
/// `backoff.delay(interval, n)`. No sleep follows the final attempt.
pub async fn retry_with_backoff<T, E, F, Fut>(
    clock: &dyn Clock,
    max_attempts: u32,
    interval: Duration,
    backoff: Backoff,
    abort: &mut AbortSignal,
    mut op: F,
) -> RetryOutcome<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let max_attempts = max_attempts.max(1);
    let mut failures = Vec::new();
    let mut attempt = 0;

    loop {
        if abort.is_aborted() {
            return RetryOutcome::Aborted {
                attempts: attempt,
                failures,
            };
        }

        attempt += 1;
        match op(attempt).await {
            Ok(value) => {
                return RetryOutcome::Succeeded {
                    value,
                    attempts: attempt,
                    failures,
                }
            }
            Err(e) => failures.push(e),
        }

        if attempt >= max_attempts {
            return RetryOutcome::Exhausted {
                attempts: attempt,
                failures,
            };
        }

        let delay = backoff.delay(interval, attempt);
        debug!(attempt, max_attempts, ?delay, "attempt failed, retrying");

        tokio::select! {
            _ = clock.sleep(delay) => {}
            _ = abort.aborted() => {
                return RetryOutcome::Aborted { attempts: attempt, failures };
            }
        }
    }
}
