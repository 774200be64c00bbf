//! Bounded, fixed-interval retry shared by readiness waits and downloads.

use std::fmt::Display;
use std::time::Duration;

use tokio::time::sleep;
use tracing::{info, warn};

/// How many times to try and how long to sleep between tries.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first. Zero is treated as one.
    pub attempts: u32,
    /// Sleep between a failed attempt and the next.
    pub interval: Duration,
}

impl RetryPolicy {
    /// Creates a policy of `attempts` tries `interval` apart.
    #[must_use]
    pub const fn new(attempts: u32, interval: Duration) -> Self {
        Self { attempts, interval }
    }

    /// Attempt budget, never less than one.
    #[must_use]
    pub const fn budget(&self) -> u32 {
        if self.attempts == 0 { 1 } else { self.attempts }
    }
}

/// The last failure after every attempt was used.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Exhausted<E> {
    /// Attempts made.
    pub attempts: u32,
    /// Error from the final attempt.
    pub last: E,
}

/// Runs `operation` until it succeeds or the policy's budget is spent,
/// sleeping `policy.interval` after each failure except the last.
///
/// Every failed attempt is logged with `what` and its attempt number.
///
/// # Errors
///
/// Returns [`Exhausted`] carrying the final error when no attempt succeeds.
pub async fn retry<T, E, F>(policy: RetryPolicy, what: &str, mut operation: F) -> Result<T, Exhausted<E>>
where
    F: FnMut(u32) -> Result<T, E>,
    E: Display,
{
    let budget = policy.budget();
    let mut attempt = 1;
    loop {
        match operation(attempt) {
            Ok(value) => {
                if attempt > 1 {
                    info!(what, attempt, "succeeded after retry");
                }
                return Ok(value);
            }
            Err(err) if attempt >= budget => {
                warn!(what, attempt, budget, error = %err, "giving up");
                return Err(Exhausted {
                    attempts: attempt,
                    last: err,
                });
            }
            Err(err) => {
                warn!(what, attempt, budget, error = %err, "attempt failed; retrying");
                sleep(policy.interval).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stops_at_first_success() {
        let mut calls = 0;
        let result = retry(RetryPolicy::new(5, Duration::ZERO), "probe", |attempt| {
            calls += 1;
            if attempt == 3 { Ok(attempt) } else { Err("not yet") }
        })
        .await;

        assert_eq!(result, Ok(3));
        assert_eq!(calls, 3);
    }

    #[tokio::test]
    async fn exhausts_after_exactly_the_budget() {
        let mut calls = 0;
        let result: Result<(), _> = retry(RetryPolicy::new(4, Duration::ZERO), "probe", |_| {
            calls += 1;
            Err("down")
        })
        .await;

        assert_eq!(
            result,
            Err(Exhausted {
                attempts: 4,
                last: "down"
            })
        );
        assert_eq!(calls, 4);
    }

    #[tokio::test]
    async fn zero_attempts_still_tries_once() {
        let mut calls = 0;
        let result: Result<(), _> = retry(RetryPolicy::new(0, Duration::ZERO), "probe", |_| {
            calls += 1;
            Err("down")
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls, 1);
    }
}
