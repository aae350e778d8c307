//! Failure classification shared by retry, queue and saga layers.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Whether a failure is worth retrying.
///
/// Operations report their class explicitly; callers never infer it from the
/// concrete error type.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Network blips, lock contention, timeouts. Eligible for retry/requeue.
    Transient,
    /// Validation or business-rule violation. Never retried.
    Permanent,
}

impl ErrorClass {
    pub fn is_transient(self) -> bool {
        matches!(self, ErrorClass::Transient)
    }

    pub fn is_permanent(self) -> bool {
        matches!(self, ErrorClass::Permanent)
    }
}

impl core::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            ErrorClass::Transient => f.write_str("transient"),
            ErrorClass::Permanent => f.write_str("permanent"),
        }
    }
}

/// Errors that know their own [`ErrorClass`].
pub trait Classified {
    fn class(&self) -> ErrorClass;

    fn is_transient(&self) -> bool {
        self.class().is_transient()
    }
}

impl Classified for ErrorClass {
    fn class(&self) -> ErrorClass {
        *self
    }
}

/// Identifier parse failure.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("invalid identifier: {0}")]
pub struct IdError(pub String);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn class_predicates() {
        assert!(ErrorClass::Transient.is_transient());
        assert!(!ErrorClass::Transient.is_permanent());
        assert!(ErrorClass::Permanent.is_permanent());
        assert!(!ErrorClass::Permanent.is_transient());
    }

    #[test]
    fn class_displays_lowercase() {
        assert_eq!(ErrorClass::Transient.to_string(), "transient");
        assert_eq!(ErrorClass::Permanent.to_string(), "permanent");
    }
}
