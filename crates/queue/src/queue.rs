//! Task queue: enqueue, dispatch, settlement.
//!
//! Settlement is decided against the task store first and only then applied
//! to the broker. A settlement whose attempt number no longer matches the
//! stored task (because the visibility reaper already redelivered it) is
//! dropped without touching the broker.
//!
//! Every broker message carries the task's dispatch generation. The reaper
//! republishes requeued tasks whose message never came back and bumps the
//! generation, so a late copy of the old message is recognised and dropped.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::{debug, error, warn};

use forgeflow_broker::{BrokerError, BrokerTransport, Delivery, Subscription};
use forgeflow_core::{Classified, DlqEntryId, TaskId};
use forgeflow_resilience::{CircuitBreakerRegistry, CircuitState, TimeoutError, TimeoutGuard};

use crate::config::QueueConfig;
use crate::dlq::{DeadLetterQueue, DlqError};
use crate::store::{InMemoryTaskStore, TaskStats, TaskStore, TaskStoreError};
use crate::types::{TaskContext, TaskError, TaskHandle, TaskOptions, TaskStatus};

/// Task handler function type.
pub type TaskHandler = Arc<dyn Fn(&TaskContext) -> Result<JsonValue, TaskError> + Send + Sync>;

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error(transparent)]
    Broker(#[from] BrokerError),
    #[error(transparent)]
    Store(#[from] TaskStoreError),
    #[error(transparent)]
    Dlq(#[from] DlqError),
    #[error("invalid task options: {0}")]
    InvalidOptions(String),
    #[error("failed to spawn worker thread: {0}")]
    Spawn(String),
    #[error("task {task_id} did not finish within {waited:?}")]
    WaitTimeout { task_id: TaskId, waited: Duration },
}

/// What happened to a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    /// Handler succeeded, message acked
    Acked,
    /// Transient failure, message nacked with this delay
    Requeued { delay: Duration },
    /// Moved to the dead-letter queue
    DeadLettered { entry_id: DlqEntryId },
    /// Circuit open; pushed back without consuming an attempt
    Deferred { delay: Duration },
    /// Result arrived for an attempt that was already settled elsewhere
    Stale,
    /// Duplicate, unknown or malformed delivery; acked and ignored
    Skipped,
}

/// Message body published to the broker.
#[derive(Debug, Serialize, Deserialize)]
struct TaskEnvelope {
    task_id: TaskId,
    payload: JsonValue,
    #[serde(default)]
    dispatch: u32,
}

impl TaskEnvelope {
    fn body(task: &TaskHandle) -> Result<JsonValue, BrokerError> {
        serde_json::to_value(TaskEnvelope {
            task_id: task.id,
            payload: task.payload.clone(),
            dispatch: task.dispatch,
        })
        .map_err(|e| BrokerError::Serialization(e.to_string()))
    }
}

struct Inner {
    broker: Arc<dyn BrokerTransport>,
    store: Arc<dyn TaskStore>,
    dlq: DeadLetterQueue,
    handlers: RwLock<HashMap<String, TaskHandler>>,
    breakers: CircuitBreakerRegistry,
    config: QueueConfig,
}

/// Broker-backed task queue. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct TaskQueue {
    inner: Arc<Inner>,
}

impl core::fmt::Debug for TaskQueue {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("TaskQueue")
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

impl TaskQueue {
    /// Queue with in-memory task and dead-letter storage.
    pub fn new(broker: impl BrokerTransport + 'static, config: QueueConfig) -> Self {
        Self::with_stores(
            Arc::new(broker),
            InMemoryTaskStore::arc(),
            DeadLetterQueue::default(),
            config,
        )
    }

    pub fn with_stores(
        broker: Arc<dyn BrokerTransport>,
        store: Arc<dyn TaskStore>,
        dlq: DeadLetterQueue,
        config: QueueConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                broker,
                store,
                dlq,
                handlers: RwLock::new(HashMap::new()),
                breakers: CircuitBreakerRegistry::new(config.circuit_breaker.clone()),
                config,
            }),
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.inner.config
    }

    pub fn dead_letters(&self) -> &DeadLetterQueue {
        &self.inner.dlq
    }

    /// Register a handler for a queue name pattern: an exact name,
    /// `prefix.*`, or `*`.
    pub fn register_handler<F>(&self, pattern: impl Into<String>, handler: F)
    where
        F: Fn(&TaskContext) -> Result<JsonValue, TaskError> + Send + Sync + 'static,
    {
        self.inner
            .handlers
            .write()
            .unwrap()
            .insert(pattern.into(), Arc::new(handler));
    }

    fn handler_for(&self, queue: &str) -> Option<TaskHandler> {
        let handlers = self.inner.handlers.read().unwrap();

        if let Some(h) = handlers.get(queue) {
            return Some(h.clone());
        }

        // Longest matching prefix wins ("payments.card.*" over "payments.*").
        let category = handlers
            .iter()
            .filter_map(|(pattern, handler)| {
                let prefix = pattern.strip_suffix(".*")?;
                let matches = queue
                    .strip_prefix(prefix)
                    .is_some_and(|rest| rest.starts_with('.'));
                matches.then_some((prefix.len(), handler))
            })
            .max_by_key(|(len, _)| *len)
            .map(|(_, handler)| handler.clone());

        category.or_else(|| handlers.get("*").cloned())
    }

    /// Publish a task; returns its handle with status `Queued`.
    pub fn enqueue(
        &self,
        queue: &str,
        payload: JsonValue,
        options: TaskOptions,
    ) -> Result<TaskHandle, QueueError> {
        options
            .validate()
            .map_err(|e| QueueError::InvalidOptions(e.to_string()))?;

        let task = TaskHandle::new(queue, payload, options);
        let task_id = task.id;
        let body = TaskEnvelope::body(&task)?;

        // Insert before publishing so a fast worker always finds the task.
        self.inner.store.insert(task)?;

        let message_id = match self.inner.broker.publish(queue, body) {
            Ok(id) => id,
            Err(err) => {
                self.inner.store.remove(task_id)?;
                return Err(err.into());
            }
        };

        let task = self.inner.store.update(task_id, &mut |t| {
            if t.message_id.is_none() {
                t.message_id = Some(message_id.clone());
            }
        })?;

        debug!(task_id = %task_id, queue, "task enqueued");
        Ok(task)
    }

    /// `enqueue` with the queue's default options.
    pub fn enqueue_default(&self, queue: &str, payload: JsonValue) -> Result<TaskHandle, QueueError> {
        self.enqueue(queue, payload, self.inner.config.default_options.clone())
    }

    pub fn subscribe(&self, queue: &str) -> Result<Box<dyn Subscription>, QueueError> {
        Ok(self.inner.broker.subscribe(queue)?)
    }

    /// Handle one delivery end to end: breaker check, handler under timeout,
    /// settlement.
    pub fn process(&self, delivery: Delivery) -> Result<Settlement, QueueError> {
        let breaker = self.inner.breakers.get(&delivery.queue);
        let permit = match breaker.try_acquire() {
            Ok(permit) => permit,
            Err(open) => return self.defer(&delivery, open.retry_after),
        };

        let Some(task) = self.begin(&delivery)? else {
            // Nothing ran; a trial permit is released on drop.
            return Ok(Settlement::Skipped);
        };

        let started_at = Utc::now();
        let result = match self.handler_for(&task.queue) {
            Some(handler) => run_handler(handler, &task),
            None => Err(TaskError::permanent(format!(
                "no handler registered for queue '{}'",
                task.queue
            ))),
        };

        match &result {
            Err(err) if err.is_transient() => permit.failure(),
            _ => permit.success(),
        }

        self.settle(task.id, task.attempts, started_at, result)
    }

    /// Mark the delivered task `InFlight`, consuming one attempt.
    ///
    /// Returns `None` (after acking the message) when the delivery is not
    /// worth running: malformed, unknown task, a duplicate of a task that
    /// already finished, or a message superseded by a republish.
    pub fn begin(&self, delivery: &Delivery) -> Result<Option<TaskHandle>, QueueError> {
        let Some(envelope) = self.envelope_of(delivery)? else {
            return Ok(None);
        };
        let task_id = envelope.task_id;

        let mut started = false;
        let task = self.inner.store.update(task_id, &mut |t| {
            started = false;
            if !t.status.is_terminal() && t.dispatch == envelope.dispatch {
                t.mark_in_flight(delivery.message_id.clone());
                started = true;
            }
        });

        let task = match task {
            Ok(task) => task,
            Err(TaskStoreError::NotFound(_)) => {
                warn!(task_id = %task_id, queue = %delivery.queue, "delivery for unknown task, dropping");
                self.inner.broker.ack(&delivery.queue, &delivery.message_id)?;
                return Ok(None);
            }
            Err(err) => return Err(err.into()),
        };

        if !started {
            debug!(
                task_id = %task_id,
                status = ?task.status,
                dispatch = envelope.dispatch,
                current = task.dispatch,
                "duplicate or superseded delivery"
            );
            self.inner.broker.ack(&delivery.queue, &delivery.message_id)?;
            return Ok(None);
        }

        debug!(
            task_id = %task_id,
            queue = %task.queue,
            attempt = task.attempts,
            delivery_count = delivery.delivery_count,
            "task in flight"
        );
        Ok(Some(task))
    }

    /// Push a delivery back because its queue's circuit is open. The task's
    /// attempt counter is not touched.
    pub fn defer(&self, delivery: &Delivery, retry_after: Duration) -> Result<Settlement, QueueError> {
        let Some(envelope) = self.envelope_of(delivery)? else {
            return Ok(Settlement::Skipped);
        };
        let task_id = envelope.task_id;
        let delay = retry_after.max(self.inner.config.min_defer_delay);

        let mut finished = false;
        let result = self.inner.store.update(task_id, &mut |t| {
            finished = t.status.is_terminal() || t.dispatch != envelope.dispatch;
            if !finished {
                t.mark_deferred(delay);
            }
        });

        match result {
            Ok(_) if finished => {
                self.inner.broker.ack(&delivery.queue, &delivery.message_id)?;
                Ok(Settlement::Skipped)
            }
            Ok(_) => {
                debug!(task_id = %task_id, queue = %delivery.queue, delay_ms = delay.as_millis() as u64, "circuit open, task deferred");
                self.inner
                    .broker
                    .nack(&delivery.queue, &delivery.message_id, delay)?;
                Ok(Settlement::Deferred { delay })
            }
            Err(TaskStoreError::NotFound(_)) => {
                self.inner.broker.ack(&delivery.queue, &delivery.message_id)?;
                Ok(Settlement::Skipped)
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Apply a handler outcome for `attempt` of a task.
    pub fn settle(
        &self,
        task_id: TaskId,
        attempt: u32,
        started_at: DateTime<Utc>,
        result: Result<JsonValue, TaskError>,
    ) -> Result<Settlement, QueueError> {
        let mut result = Some(result);
        let mut requeue: Option<Duration> = None;
        let mut applied = false;

        let task = self.inner.store.update(task_id, &mut |t| {
            if t.status != TaskStatus::InFlight || t.attempts != attempt {
                return;
            }
            let Some(outcome) = result.take() else {
                return;
            };
            applied = true;
            match outcome {
                Ok(output) => t.mark_acked(output, started_at),
                Err(err) => requeue = t.mark_failed(err, started_at),
            }
        })?;

        if !applied {
            debug!(task_id = %task_id, attempt, current = task.attempts, "stale settlement dropped");
            return Ok(Settlement::Stale);
        }

        let Some(message_id) = task.message_id.clone() else {
            return Err(TaskStoreError::Storage(format!("task {} has no message id", task_id)).into());
        };

        match task.status {
            TaskStatus::Acked => {
                self.inner.broker.ack(&task.queue, &message_id)?;
                debug!(task_id = %task_id, queue = %task.queue, attempt, "task acked");
                Ok(Settlement::Acked)
            }
            TaskStatus::NackedRequeue => {
                let delay = requeue.unwrap_or_default();
                warn!(
                    task_id = %task_id,
                    queue = %task.queue,
                    attempt,
                    max_attempts = task.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = ?task.last_error().map(|e| e.message.as_str()),
                    "task failed, requeueing"
                );
                self.inner.broker.nack(&task.queue, &message_id, delay)?;
                Ok(Settlement::Requeued { delay })
            }
            _ => {
                let reason = match task.last_error() {
                    Some(err) if err.is_transient() => "retry budget exhausted",
                    _ => "permanent failure",
                };
                let failures = task.failures();
                match self.inner.dlq.receive(task.clone(), failures, reason) {
                    Ok(entry_id) => {
                        self.inner.broker.ack(&task.queue, &message_id)?;
                        Ok(Settlement::DeadLettered { entry_id })
                    }
                    Err(err) => {
                        // Put the task back in line; the next delivery fails
                        // the same way and tries the dead-letter queue again.
                        let delay = task.options.backoff.delay(task.attempts);
                        error!(
                            task_id = %task_id,
                            queue = %task.queue,
                            attempt,
                            error = %err,
                            "dead-letter queue rejected task, requeueing"
                        );
                        self.inner.store.update(task_id, &mut |t| {
                            if t.status == TaskStatus::DeadLettered && t.attempts == attempt {
                                t.revert_dead_letter(delay);
                            }
                        })?;
                        self.inner.broker.nack(&task.queue, &message_id, delay)?;
                        Err(err.into())
                    }
                }
            }
        }
    }

    /// Treat every in-flight task past its visibility deadline as a
    /// transient failure, and republish every requeued task whose message
    /// never came back. Returns how many tasks were handled.
    pub fn reap_expired(&self) -> Result<usize, QueueError> {
        let now = Utc::now();
        let expired: Vec<TaskHandle> = self
            .inner
            .store
            .list(None, Some(TaskStatus::InFlight), usize::MAX)?
            .into_iter()
            .filter(|t| t.is_visibility_expired(now))
            .collect();

        let mut reaped = 0;
        for task in expired {
            let started_at = task
                .visibility_deadline
                .map(|deadline| deadline - crate::types::to_chrono(task.options.visibility_timeout))
                .unwrap_or(now);
            let settlement = self.settle(
                task.id,
                task.attempts,
                started_at,
                Err(TaskError::transient("visibility timeout expired")),
            )?;
            if settlement != Settlement::Stale {
                warn!(task_id = %task.id, queue = %task.queue, attempt = task.attempts, "visibility timeout expired");
                reaped += 1;
            }
        }

        let overdue: Vec<TaskHandle> = self
            .inner
            .store
            .list(None, Some(TaskStatus::NackedRequeue), usize::MAX)?
            .into_iter()
            .filter(|t| t.is_requeue_overdue(now))
            .collect();

        for task in overdue {
            if self.republish(&task, now)? {
                reaped += 1;
            }
        }

        Ok(reaped)
    }

    /// Publish a fresh message for a requeued task under the next dispatch
    /// generation. A failed publish is retried one visibility timeout later.
    fn republish(&self, task: &TaskHandle, now: DateTime<Utc>) -> Result<bool, QueueError> {
        let mut bumped = false;
        let current = self.inner.store.update(task.id, &mut |t| {
            bumped = false;
            if t.dispatch == task.dispatch && t.is_requeue_overdue(now) {
                t.dispatch += 1;
                t.visible_at = now;
                bumped = true;
            }
        })?;
        if !bumped {
            return Ok(false);
        }

        let body = TaskEnvelope::body(&current)?;
        let message_id = self.inner.broker.publish(&current.queue, body)?;
        self.inner.store.update(task.id, &mut |t| {
            if t.dispatch == current.dispatch && t.status == TaskStatus::NackedRequeue {
                t.message_id = Some(message_id.clone());
            }
        })?;

        // The old message may still sit in flight after a failed nack.
        if let Some(old) = &task.message_id {
            if let Err(e) = self.inner.broker.ack(&task.queue, old) {
                debug!(task_id = %task.id, message_id = %old, error = %e, "superseded message not in flight");
            }
        }

        warn!(
            task_id = %task.id,
            queue = %task.queue,
            dispatch = current.dispatch,
            "requeued task never redelivered, republished"
        );
        Ok(true)
    }

    pub fn get(&self, task_id: TaskId) -> Result<Option<TaskHandle>, QueueError> {
        Ok(self.inner.store.get(task_id)?)
    }

    /// Block until the task is acked or dead-lettered.
    pub fn wait_for(&self, task_id: TaskId, timeout: Duration) -> Result<TaskHandle, QueueError> {
        let started = Instant::now();
        loop {
            let task = self
                .inner
                .store
                .get(task_id)?
                .ok_or(TaskStoreError::NotFound(task_id))?;
            if task.status.is_terminal() {
                return Ok(task);
            }
            if started.elapsed() >= timeout {
                return Err(QueueError::WaitTimeout {
                    task_id,
                    waited: timeout,
                });
            }
            thread::sleep(self.inner.config.wait_poll_interval);
        }
    }

    pub fn stats(&self, queue: Option<&str>) -> Result<TaskStats, QueueError> {
        Ok(self.inner.store.stats(queue)?)
    }

    pub fn circuit_state(&self, queue: &str) -> CircuitState {
        self.inner.breakers.get(queue).state()
    }

    pub fn replay_dead_letter(&self, entry_id: DlqEntryId) -> Result<TaskHandle, QueueError> {
        self.inner.dlq.replay(entry_id, self)
    }

    pub fn purge_dead_letter(&self, entry_id: DlqEntryId) -> Result<(), QueueError> {
        self.inner.dlq.purge(entry_id)?;
        Ok(())
    }

    fn envelope_of(&self, delivery: &Delivery) -> Result<Option<TaskEnvelope>, QueueError> {
        match serde_json::from_value::<TaskEnvelope>(delivery.payload.clone()) {
            Ok(envelope) => Ok(Some(envelope)),
            Err(e) => {
                warn!(
                    queue = %delivery.queue,
                    message_id = %delivery.message_id,
                    error = %e,
                    "malformed task envelope, dropping"
                );
                self.inner.broker.ack(&delivery.queue, &delivery.message_id)?;
                Ok(None)
            }
        }
    }
}

fn run_handler(handler: TaskHandler, task: &TaskHandle) -> Result<JsonValue, TaskError> {
    let timeout = task.options.handler_timeout;
    let task_id = task.id;
    let queue = task.queue.clone();
    let payload = task.payload.clone();
    let attempt = task.attempts;

    let guarded = TimeoutGuard::new(timeout).run(move |cancellation| {
        let ctx = TaskContext {
            task_id,
            queue,
            payload,
            attempt,
            cancellation,
        };
        handler(&ctx)
    });

    match guarded {
        Ok(result) => result,
        Err(TimeoutError::Elapsed { after }) => Err(TaskError::transient(format!(
            "handler timed out after {}ms",
            after.as_millis()
        ))),
        Err(TimeoutError::Panicked) => Err(TaskError::transient("handler panicked")),
        Err(TimeoutError::Spawn(e)) => Err(TaskError::transient(format!(
            "could not start handler: {}",
            e
        ))),
    }
}
