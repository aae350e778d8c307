//! Step actions: the forward and compensating callables of a saga.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use forgeflow_core::{Classified, ErrorClass};
use forgeflow_queue::{QueueError, TaskOptions, TaskQueue, TaskStatus};
use forgeflow_resilience::RetryPolicy;

use crate::context::{ContextUpdate, SagaContext};

/// A classified step failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{class} step error: {message}")]
pub struct StepError {
    pub class: ErrorClass,
    pub message: String,
}

impl StepError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            class: ErrorClass::Transient,
            message: message.into(),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            class: ErrorClass::Permanent,
            message: message.into(),
        }
    }
}

impl Classified for StepError {
    fn class(&self) -> ErrorClass {
        self.class
    }
}

/// Forward or compensating action of a step.
///
/// Implementations must be idempotent: after a crash the orchestrator may
/// run an action again if it cannot tell whether the previous run landed.
pub trait StepAction: Send + Sync {
    fn run(&self, ctx: &SagaContext) -> Result<ContextUpdate, StepError>;
}

impl<F> StepAction for F
where
    F: Fn(&SagaContext) -> Result<ContextUpdate, StepError> + Send + Sync,
{
    fn run(&self, ctx: &SagaContext) -> Result<ContextUpdate, StepError> {
        self(ctx)
    }
}

/// Per-step overrides of the saga-wide policies.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StepOptions {
    /// Retry policy for this step's forward action
    pub retry: Option<RetryPolicy>,
    /// Retry policy for this step's compensation
    pub compensation_retry: Option<RetryPolicy>,
    /// Latency bound for each attempt
    pub timeout: Option<Duration>,
}

impl StepOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = Some(policy);
        self
    }

    pub fn with_compensation_retry(mut self, policy: RetryPolicy) -> Self {
        self.compensation_retry = Some(policy);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Runs a step as a task on a [`TaskQueue`] and waits for the outcome.
///
/// The task payload is the saga context as a JSON object. An acked task's
/// output becomes the step's context update; a dead-lettered task fails the
/// step with the class of the task's last error.
#[derive(Debug, Clone)]
pub struct QueuedStep {
    queue: TaskQueue,
    queue_name: String,
    options: TaskOptions,
    wait_timeout: Duration,
}

impl QueuedStep {
    pub fn new(queue: TaskQueue, queue_name: impl Into<String>) -> Self {
        let options = queue.config().default_options.clone();
        Self {
            queue,
            queue_name: queue_name.into(),
            options,
            wait_timeout: Duration::from_secs(300),
        }
    }

    pub fn with_options(mut self, options: TaskOptions) -> Self {
        self.options = options;
        self
    }

    /// How long to wait for the task to be acked or dead-lettered.
    pub fn with_wait_timeout(mut self, timeout: Duration) -> Self {
        self.wait_timeout = timeout;
        self
    }
}

impl StepAction for QueuedStep {
    fn run(&self, ctx: &SagaContext) -> Result<ContextUpdate, StepError> {
        let task = self
            .queue
            .enqueue(&self.queue_name, ctx.to_json(), self.options.clone())
            .map_err(queue_error)?;
        debug!(task_id = %task.id, queue = %self.queue_name, "step dispatched");

        let finished = self
            .queue
            .wait_for(task.id, self.wait_timeout)
            .map_err(queue_error)?;

        match finished.status {
            TaskStatus::Acked => Ok(ContextUpdate::from_json(
                &self.queue_name,
                finished.output.unwrap_or_default(),
            )),
            _ => Err(match finished.last_error() {
                Some(err) => StepError {
                    class: err.class,
                    message: err.message.clone(),
                },
                None => StepError::permanent(format!("task {} was dead-lettered", finished.id)),
            }),
        }
    }
}

fn queue_error(err: QueueError) -> StepError {
    match err {
        QueueError::InvalidOptions(msg) => StepError::permanent(msg),
        other => StepError::transient(other.to_string()),
    }
}
