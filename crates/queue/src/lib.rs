//! Broker-backed task queue with retry, backoff, and dead-letter handling.
//!
//! ## Design
//!
//! - Tasks are published to a broker queue and owned by the `TaskQueue` until
//!   acked or dead-lettered
//! - Handlers run under a timeout and a per-queue circuit breaker
//! - Transient failures are requeued with backoff; permanent failures and
//!   exhausted budgets go to the dead-letter queue
//! - Visibility-timeout expiry counts as a transient failure
//!
//! ## Components
//!
//! - `TaskHandle`: task state, attempt count and failure history
//! - `TaskStore`: persistence for task state
//! - `TaskQueue`: enqueue, dispatch and settlement
//! - `Worker` / `WorkerPool`: background consumers
//! - `DeadLetterQueue`: failed tasks for inspection/replay

pub mod config;
pub mod dlq;
pub mod queue;
pub mod store;
pub mod types;
pub mod worker;

pub use config::{QueueConfig, WorkerConfig};
pub use dlq::{DeadLetterQueue, DlqEntry, DlqError, DlqStore, DlqSummary, InMemoryDlqStore};
pub use queue::{QueueError, Settlement, TaskHandler, TaskQueue};
pub use store::{InMemoryTaskStore, TaskStats, TaskStore, TaskStoreError};
pub use types::{AttemptRecord, TaskContext, TaskError, TaskHandle, TaskOptions, TaskStatus};
pub use worker::{Worker, WorkerHandle, WorkerPool, WorkerStats};
