//! Retry, circuit breaking and timeouts composed into one call.

use std::sync::Arc;
use std::time::Duration;

use forgeflow_core::Classified;

use crate::circuit_breaker::CircuitBreaker;
use crate::error::ResilienceError;
use crate::retry::RetryPolicy;
use crate::timeout::{CancellationToken, TimeoutGuard};

/// `retry(breaker(timeout(op)))`.
///
/// Each attempt asks the breaker for a permit, then runs the operation under
/// the timeout (if any). Timeouts and open circuits count as transient, so
/// the retry budget covers them; permanent operation errors stop at once and
/// are recorded as successes by the breaker.
#[derive(Debug, Clone)]
pub struct ResiliencePolicy {
    retry: RetryPolicy,
    timeout: Option<Duration>,
    breaker: Option<Arc<CircuitBreaker>>,
}

impl ResiliencePolicy {
    pub fn new(retry: RetryPolicy) -> Self {
        Self {
            retry,
            timeout: None,
            breaker: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_circuit_breaker(mut self, breaker: Arc<CircuitBreaker>) -> Self {
        self.breaker = Some(breaker);
        self
    }

    pub fn retry(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Run `op` under every configured layer.
    ///
    /// `op` receives the attempt number and a cancellation token that is
    /// cancelled if that attempt times out.
    pub fn execute<T, E, F>(&self, op: F) -> Result<T, ResilienceError<E>>
    where
        F: Fn(u32, CancellationToken) -> Result<T, E> + Send + Sync + 'static,
        T: Send + 'static,
        E: Classified + Send + 'static,
    {
        let op = Arc::new(op);
        self.retry
            .run(|attempt| self.attempt_once(Arc::clone(&op), attempt))
    }

    fn attempt_once<T, E, F>(&self, op: Arc<F>, attempt: u32) -> Result<T, ResilienceError<E>>
    where
        F: Fn(u32, CancellationToken) -> Result<T, E> + Send + Sync + 'static,
        T: Send + 'static,
        E: Classified + Send + 'static,
    {
        let permit = match &self.breaker {
            Some(breaker) => Some(breaker.try_acquire().map_err(ResilienceError::CircuitOpen)?),
            None => None,
        };

        let result = match self.timeout {
            Some(timeout) => match TimeoutGuard::new(timeout).run(move |token| op(attempt, token)) {
                Ok(outcome) => outcome.map_err(ResilienceError::Operation),
                Err(err) => Err(ResilienceError::Timeout(err)),
            },
            None => op(attempt, CancellationToken::new()).map_err(ResilienceError::Operation),
        };

        if let Some(permit) = permit {
            match &result {
                Err(err) if err.is_transient() => permit.failure(),
                _ => permit.success(),
            }
        }

        result
    }
}
