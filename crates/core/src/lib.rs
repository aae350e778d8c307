//! Shared building blocks for the saga and task layers: ids and error classification.
//!
//! This crate holds identifiers and the failure classification every other
//! crate agrees on. It has no runtime behaviour of its own.

pub mod error;
pub mod id;

pub use error::{Classified, ErrorClass, IdError};
pub use id::{DlqEntryId, SagaId, TaskId};
