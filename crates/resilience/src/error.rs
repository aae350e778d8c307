//! Error types surfaced by the resilience layer.

use std::time::Duration;

use thiserror::Error;

use forgeflow_core::{Classified, ErrorClass};

/// Invalid policy configuration.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PolicyError {
    #[error("invalid policy: {0}")]
    Invalid(String),
}

impl PolicyError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::Invalid(msg.into())
    }
}

/// A call was rejected because the circuit is open.
///
/// This is a fast-fail, not a real operation failure: the protected
/// operation was never invoked.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("circuit '{name}' is open (retry after {retry_after:?})")]
pub struct CircuitOpenError {
    pub name: String,
    /// Time left until the circuit admits a trial call.
    pub retry_after: Duration,
}

/// A guarded operation did not complete in time.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TimeoutError {
    #[error("operation timed out after {after:?}")]
    Elapsed { after: Duration },
    #[error("guarded operation panicked before completing")]
    Panicked,
    #[error("failed to spawn guarded operation: {0}")]
    Spawn(String),
}

/// Failure of an operation run under one or more resilience layers.
#[derive(Debug)]
pub enum ResilienceError<E> {
    /// The operation itself failed.
    Operation(E),
    /// The circuit breaker rejected the call.
    CircuitOpen(CircuitOpenError),
    /// The timeout guard gave up waiting.
    Timeout(TimeoutError),
}

impl<E> ResilienceError<E> {
    /// The operation's own error, if that is what failed.
    pub fn into_operation(self) -> Option<E> {
        match self {
            ResilienceError::Operation(e) => Some(e),
            _ => None,
        }
    }

    pub fn is_circuit_open(&self) -> bool {
        matches!(self, ResilienceError::CircuitOpen(_))
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, ResilienceError::Timeout(_))
    }
}

impl<E: core::fmt::Display> core::fmt::Display for ResilienceError<E> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            ResilienceError::Operation(e) => core::fmt::Display::fmt(e, f),
            ResilienceError::CircuitOpen(e) => core::fmt::Display::fmt(e, f),
            ResilienceError::Timeout(e) => core::fmt::Display::fmt(e, f),
        }
    }
}

impl<E> std::error::Error for ResilienceError<E>
where
    E: std::error::Error + 'static,
{
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ResilienceError::Operation(e) => e.source(),
            ResilienceError::CircuitOpen(_) | ResilienceError::Timeout(_) => None,
        }
    }
}

/// Timeouts and open circuits are transient; operation errors keep their own class.
impl<E: Classified> Classified for ResilienceError<E> {
    fn class(&self) -> ErrorClass {
        match self {
            ResilienceError::Operation(e) => e.class(),
            ResilienceError::CircuitOpen(_) | ResilienceError::Timeout(_) => ErrorClass::Transient,
        }
    }
}
