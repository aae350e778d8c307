//! Resilience primitives: backoff, retry, circuit breaking, timeouts, fallbacks.
//!
//! ## Components
//!
//! - `Backoff`: pure mapping of attempt number → delay
//! - `RetryPolicy`: bounded retry of an operation using a `Backoff`
//! - `CircuitBreaker`: fast-fails calls to a dependency after sustained failures
//! - `TimeoutGuard`: bounds operation latency (best-effort cancellation)
//! - `Fallback`: substitutes a degraded result when an operation fails
//! - `ResiliencePolicy`: retry(breaker(timeout(op))) in one value
//!
//! Everything here is synchronous; the only blocking points are the retry
//! sleep and the timeout wait.

pub mod backoff;
pub mod circuit_breaker;
pub mod error;
pub mod fallback;
pub mod policy;
pub mod retry;
pub mod timeout;

pub use backoff::{Backoff, BackoffStrategy};
pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerRegistry, CircuitState, Permit,
};
pub use error::{CircuitOpenError, PolicyError, ResilienceError, TimeoutError};
pub use fallback::Fallback;
pub use policy::ResiliencePolicy;
pub use retry::RetryPolicy;
pub use timeout::{CancellationToken, TimeoutGuard};
