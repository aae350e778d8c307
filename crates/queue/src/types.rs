//! Core task types and options.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use forgeflow_broker::MessageId;
use forgeflow_core::{Classified, ErrorClass, TaskId};
use forgeflow_resilience::{Backoff, CancellationToken, PolicyError};

/// Per-task delivery options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskOptions {
    /// Maximum number of deliveries (values below 1 are treated as 1)
    pub max_attempts: u32,
    /// Delay before a requeued task becomes visible again
    pub backoff: Backoff,
    /// How long a delivered task may stay in flight before it is redelivered
    pub visibility_timeout: Duration,
    /// Latency bound for a single handler invocation
    pub handler_timeout: Duration,
}

impl Default for TaskOptions {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff: Backoff::default(),
            visibility_timeout: Duration::from_secs(60),
            handler_timeout: Duration::from_secs(30),
        }
    }
}

impl TaskOptions {
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_visibility_timeout(mut self, timeout: Duration) -> Self {
        self.visibility_timeout = timeout;
        self
    }

    pub fn with_handler_timeout(mut self, timeout: Duration) -> Self {
        self.handler_timeout = timeout;
        self
    }

    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    pub fn validate(&self) -> Result<(), PolicyError> {
        if self.max_attempts == 0 {
            return Err(PolicyError::invalid("max_attempts must be at least 1"));
        }
        if self.handler_timeout.is_zero() || self.visibility_timeout.is_zero() {
            return Err(PolicyError::invalid("timeouts must be non-zero"));
        }
        self.backoff.validate()
    }
}

/// Task delivery status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Published, waiting for a worker
    Queued,
    /// Delivered to a worker, visibility deadline running
    InFlight,
    /// Handler succeeded
    Acked,
    /// Failed transiently, waiting for redelivery
    NackedRequeue,
    /// Moved to the dead-letter queue
    DeadLettered,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Acked | TaskStatus::DeadLettered)
    }
}

/// A classified handler failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{class} task error: {message}")]
pub struct TaskError {
    pub class: ErrorClass,
    pub message: String,
}

impl TaskError {
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

impl Classified for TaskError {
    fn class(&self) -> ErrorClass {
        self.class
    }
}

/// Record of one delivery attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub error: Option<TaskError>,
    pub duration_ms: u64,
}

impl AttemptRecord {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

/// A task owned by the queue from enqueue until ack or dead-lettering.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskHandle {
    pub id: TaskId,
    pub queue: String,
    pub payload: JsonValue,
    pub status: TaskStatus,
    /// Deliveries so far (starts at 0)
    pub attempts: u32,
    pub max_attempts: u32,
    pub options: TaskOptions,
    /// Broker message currently carrying this task
    pub message_id: Option<MessageId>,
    pub enqueued_at: DateTime<Utc>,
    /// When the task becomes (or became) visible to workers
    pub visible_at: DateTime<Utc>,
    /// Set while `InFlight`
    pub visibility_deadline: Option<DateTime<Utc>>,
    /// Handler output once acked
    pub output: Option<JsonValue>,
    pub history: Vec<AttemptRecord>,
    /// Publication generation; deliveries carrying an older one are dropped
    #[serde(default)]
    pub dispatch: u32,
}

impl TaskHandle {
    pub fn new(queue: impl Into<String>, payload: JsonValue, options: TaskOptions) -> Self {
        let now = Utc::now();
        Self {
            id: TaskId::new(),
            queue: queue.into(),
            payload,
            status: TaskStatus::Queued,
            attempts: 0,
            max_attempts: options.attempts(),
            options,
            message_id: None,
            enqueued_at: now,
            visible_at: now,
            visibility_deadline: None,
            output: None,
            history: Vec::new(),
            dispatch: 0,
        }
    }

    /// Mark as delivered; returns the new attempt number.
    pub fn mark_in_flight(&mut self, message_id: MessageId) -> u32 {
        let now = Utc::now();
        self.attempts += 1;
        self.status = TaskStatus::InFlight;
        self.message_id = Some(message_id);
        self.visibility_deadline = Some(now + to_chrono(self.options.visibility_timeout));
        self.attempts
    }

    pub fn mark_acked(&mut self, output: JsonValue, started_at: DateTime<Utc>) {
        self.push_record(started_at, None);
        self.status = TaskStatus::Acked;
        self.output = Some(output);
        self.visibility_deadline = None;
    }

    /// Record a failure and decide between requeue and dead-lettering.
    ///
    /// Returns the requeue delay, or `None` if the task is now dead-lettered.
    pub fn mark_failed(&mut self, error: TaskError, started_at: DateTime<Utc>) -> Option<Duration> {
        let retry = error.is_transient() && self.attempts < self.max_attempts;
        self.push_record(started_at, Some(error));
        self.visibility_deadline = None;

        if retry {
            let delay = self.options.backoff.delay(self.attempts);
            self.status = TaskStatus::NackedRequeue;
            self.visible_at = Utc::now() + to_chrono(delay);
            Some(delay)
        } else {
            self.status = TaskStatus::DeadLettered;
            None
        }
    }

    /// Push back without consuming an attempt (circuit open).
    pub fn mark_deferred(&mut self, delay: Duration) {
        self.status = TaskStatus::NackedRequeue;
        self.visible_at = Utc::now() + to_chrono(delay);
    }

    /// Undo a dead-lettering the dead-letter queue did not accept. The task
    /// goes back to waiting for redelivery after `delay`.
    pub fn revert_dead_letter(&mut self, delay: Duration) {
        self.status = TaskStatus::NackedRequeue;
        self.visible_at = Utc::now() + to_chrono(delay);
    }

    pub fn is_visibility_expired(&self, now: DateTime<Utc>) -> bool {
        self.status == TaskStatus::InFlight
            && self.visibility_deadline.is_some_and(|deadline| deadline <= now)
    }

    /// A requeued task still not redelivered one visibility timeout after it
    /// became visible again.
    pub fn is_requeue_overdue(&self, now: DateTime<Utc>) -> bool {
        self.status == TaskStatus::NackedRequeue
            && self.visible_at + to_chrono(self.options.visibility_timeout) <= now
    }

    /// Failed attempts, oldest first.
    pub fn failures(&self) -> Vec<AttemptRecord> {
        self.history
            .iter()
            .filter(|record| !record.succeeded())
            .cloned()
            .collect()
    }

    pub fn last_error(&self) -> Option<&TaskError> {
        self.history.iter().rev().find_map(|record| record.error.as_ref())
    }

    fn push_record(&mut self, started_at: DateTime<Utc>, error: Option<TaskError>) {
        let now = Utc::now();
        self.history.push(AttemptRecord {
            attempt: self.attempts,
            started_at,
            finished_at: now,
            error,
            duration_ms: (now - started_at).num_milliseconds().max(0) as u64,
        });
    }
}

/// What a handler sees for one delivery.
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub task_id: TaskId,
    pub queue: String,
    pub payload: JsonValue,
    pub attempt: u32,
    /// Cancelled when the handler timeout elapses
    pub cancellation: CancellationToken,
}

impl TaskContext {
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }
}

pub(crate) fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX)
}
