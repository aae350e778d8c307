//! Bounded retry with backoff.

use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use forgeflow_core::Classified;

use crate::backoff::Backoff;
use crate::error::PolicyError;

/// Retry policy configuration.
///
/// `max_attempts` counts every call, including the first one, so a policy
/// with `max_attempts = 3` invokes the operation at most three times.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of calls (values below 1 are treated as 1)
    pub max_attempts: u32,
    /// Delay between calls
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff: Backoff::default(),
        }
    }
}

impl RetryPolicy {
    /// Create a policy that calls the operation exactly once.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            backoff: Backoff::none(),
        }
    }

    /// Create a policy with fixed delays.
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff: Backoff::fixed(delay),
        }
    }

    /// Create a policy with exponential backoff.
    pub fn exponential(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff: Backoff::exponential(base_delay, max_delay),
        }
    }

    /// Create a policy that retries immediately.
    pub fn immediate(max_attempts: u32) -> Self {
        Self::fixed(max_attempts, Duration::ZERO)
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Effective number of calls allowed.
    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    /// Check if another call is allowed after `attempt` calls have been made.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.attempts()
    }

    /// Jittered delay to wait after the given (1-indexed) failed attempt.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        self.backoff.delay(attempt)
    }

    pub fn validate(&self) -> Result<(), PolicyError> {
        if self.max_attempts == 0 {
            return Err(PolicyError::invalid("max_attempts must be at least 1"));
        }
        self.backoff.validate()
    }

    /// Run `op` until it succeeds, fails permanently, or attempts run out.
    ///
    /// `op` receives the 1-indexed attempt number. Errors classified as
    /// permanent are returned without further calls.
    pub fn run<T, E, F>(&self, op: F) -> Result<T, E>
    where
        E: Classified,
        F: FnMut(u32) -> Result<T, E>,
    {
        self.run_with(op, |e: &E| e.is_transient())
    }

    /// Like [`RetryPolicy::run`], with an explicit retryability check.
    pub fn run_with<T, E, F, R>(&self, mut op: F, is_retryable: R) -> Result<T, E>
    where
        F: FnMut(u32) -> Result<T, E>,
        R: Fn(&E) -> bool,
    {
        let max_attempts = self.attempts();
        let mut attempt = 1;

        loop {
            match op(attempt) {
                Ok(value) => return Ok(value),
                Err(err) => {
                    if attempt >= max_attempts || !is_retryable(&err) {
                        return Err(err);
                    }

                    let delay = self.delay_for_attempt(attempt);
                    debug!(
                        attempt,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        "operation failed, retrying"
                    );
                    if !delay.is_zero() {
                        thread::sleep(delay);
                    }
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use forgeflow_core::ErrorClass;
    use proptest::prelude::*;

    #[test]
    fn should_retry_respects_max_attempts() {
        let policy = RetryPolicy {
            max_attempts: 3,
            ..Default::default()
        };

        assert!(policy.should_retry(0));
        assert!(policy.should_retry(1));
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));
        assert!(!policy.should_retry(4));
    }

    #[test]
    fn zero_attempts_still_calls_once() {
        let policy = RetryPolicy {
            max_attempts: 0,
            backoff: Backoff::none(),
        };
        let mut calls = 0;
        let result: Result<(), ErrorClass> = policy.run(|_| {
            calls += 1;
            Err(ErrorClass::Transient)
        });

        assert!(result.is_err());
        assert_eq!(calls, 1);
        assert!(policy.validate().is_err());
    }

    #[test]
    fn returns_last_error_after_exhaustion() {
        let policy = RetryPolicy::immediate(3);
        let result: Result<(), (ErrorClass, u32)> =
            policy.run_with(|attempt| Err((ErrorClass::Transient, attempt)), |_| true);

        assert_eq!(result.unwrap_err().1, 3);
    }

    #[test]
    fn permanent_error_is_not_retried() {
        let policy = RetryPolicy::immediate(5);
        let mut calls = 0;
        let result: Result<(), ErrorClass> = policy.run(|_| {
            calls += 1;
            Err(ErrorClass::Permanent)
        });

        assert_eq!(result, Err(ErrorClass::Permanent));
        assert_eq!(calls, 1);
    }

    #[test]
    fn sleeps_between_attempts() {
        let policy = RetryPolicy::fixed(3, Duration::from_millis(10));
        let started = std::time::Instant::now();
        let _: Result<(), ErrorClass> = policy.run(|_| Err(ErrorClass::Transient));

        assert!(started.elapsed() >= Duration::from_millis(20));
    }

    proptest! {
        #[test]
        fn calls_at_most_k_times_and_stop_on_first_success(
            max_attempts in 1u32..10,
            succeed_on in 1u32..15,
        ) {
            let policy = RetryPolicy::immediate(max_attempts);
            let mut calls = 0u32;

            let result: Result<u32, ErrorClass> = policy.run(|attempt| {
                calls += 1;
                if attempt == succeed_on {
                    Ok(attempt)
                } else {
                    Err(ErrorClass::Transient)
                }
            });

            if succeed_on <= max_attempts {
                prop_assert_eq!(result, Ok(succeed_on));
                prop_assert_eq!(calls, succeed_on);
            } else {
                prop_assert!(result.is_err());
                prop_assert_eq!(calls, max_attempts);
            }
        }
    }
}
