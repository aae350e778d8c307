//! Saga orchestration: ordered steps with compensation.
//!
//! - Steps run in declaration order; a parallel group runs its members
//!   concurrently and finishes only when all of them have
//! - A step that fails after its retries (or permanently) triggers
//!   compensation of every completed step in reverse order
//! - A compensation that fails halts rollback and leaves the saga `Failed`
//!   for an operator to resolve
//! - Progress is persisted after every transition, so `execute` resumes a
//!   saga from its last checkpoint
//! - A per-saga lease keeps two orchestrators from running one saga at once

pub mod builder;
pub mod context;
pub mod orchestrator;
pub mod step;
pub mod store;
pub mod types;

#[cfg(test)]
mod integration_tests;

pub use builder::{GroupBuilder, Saga, SagaBuilder, StepDefinition};
pub use context::{ContextUpdate, SagaContext};
pub use orchestrator::{OrchestratorConfig, SagaError, SagaOrchestrator};
pub use step::{QueuedStep, StepAction, StepError, StepOptions};
pub use store::{InMemorySagaStore, SagaStore, SagaStoreError};
pub use types::{SagaResult, SagaState, SagaStatus, StepRecord, StepStatus};
