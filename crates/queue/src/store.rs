//! Task state storage.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use forgeflow_core::TaskId;

use crate::types::{TaskHandle, TaskStatus};

/// Task store abstraction.
///
/// `update` is the serialization point for a task: every status change goes
/// through it, so two parties racing on the same task (a worker settling it
/// and the visibility reaper expiring it) observe each other's writes.
pub trait TaskStore: Send + Sync {
    /// Store a freshly enqueued task.
    fn insert(&self, task: TaskHandle) -> Result<(), TaskStoreError>;

    /// Get a task by ID.
    fn get(&self, task_id: TaskId) -> Result<Option<TaskHandle>, TaskStoreError>;

    /// Apply `f` to the stored task atomically and return the result.
    fn update(
        &self,
        task_id: TaskId,
        f: &mut dyn FnMut(&mut TaskHandle),
    ) -> Result<TaskHandle, TaskStoreError>;

    /// Forget a task.
    fn remove(&self, task_id: TaskId) -> Result<Option<TaskHandle>, TaskStoreError>;

    /// List tasks, oldest first, optionally filtered by queue and status.
    fn list(
        &self,
        queue: Option<&str>,
        status: Option<TaskStatus>,
        limit: usize,
    ) -> Result<Vec<TaskHandle>, TaskStoreError>;

    /// Counts by status.
    fn stats(&self, queue: Option<&str>) -> Result<TaskStats, TaskStoreError>;
}

/// Task store error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TaskStoreError {
    #[error("task not found: {0}")]
    NotFound(TaskId),
    #[error("task already exists: {0}")]
    AlreadyExists(TaskId),
    #[error("storage error: {0}")]
    Storage(String),
}

/// Task statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct TaskStats {
    pub queued: usize,
    pub in_flight: usize,
    pub acked: usize,
    pub requeued: usize,
    pub dead_lettered: usize,
}

/// In-memory task store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryTaskStore {
    tasks: RwLock<HashMap<TaskId, TaskHandle>>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

impl TaskStore for InMemoryTaskStore {
    fn insert(&self, task: TaskHandle) -> Result<(), TaskStoreError> {
        let mut tasks = self.tasks.write().unwrap();
        if tasks.contains_key(&task.id) {
            return Err(TaskStoreError::AlreadyExists(task.id));
        }
        tasks.insert(task.id, task);
        Ok(())
    }

    fn get(&self, task_id: TaskId) -> Result<Option<TaskHandle>, TaskStoreError> {
        let tasks = self.tasks.read().unwrap();
        Ok(tasks.get(&task_id).cloned())
    }

    fn update(
        &self,
        task_id: TaskId,
        f: &mut dyn FnMut(&mut TaskHandle),
    ) -> Result<TaskHandle, TaskStoreError> {
        let mut tasks = self.tasks.write().unwrap();
        let task = tasks
            .get_mut(&task_id)
            .ok_or(TaskStoreError::NotFound(task_id))?;
        f(task);
        Ok(task.clone())
    }

    fn remove(&self, task_id: TaskId) -> Result<Option<TaskHandle>, TaskStoreError> {
        let mut tasks = self.tasks.write().unwrap();
        Ok(tasks.remove(&task_id))
    }

    fn list(
        &self,
        queue: Option<&str>,
        status: Option<TaskStatus>,
        limit: usize,
    ) -> Result<Vec<TaskHandle>, TaskStoreError> {
        let tasks = self.tasks.read().unwrap();
        let mut result: Vec<_> = tasks
            .values()
            .filter(|t| queue.is_none_or(|q| t.queue == q))
            .filter(|t| status.is_none_or(|s| t.status == s))
            .cloned()
            .collect();

        result.sort_by_key(|t| t.enqueued_at);
        result.truncate(limit);
        Ok(result)
    }

    fn stats(&self, queue: Option<&str>) -> Result<TaskStats, TaskStoreError> {
        let tasks = self.tasks.read().unwrap();
        let mut stats = TaskStats::default();

        for task in tasks.values().filter(|t| queue.is_none_or(|q| t.queue == q)) {
            match task.status {
                TaskStatus::Queued => stats.queued += 1,
                TaskStatus::InFlight => stats.in_flight += 1,
                TaskStatus::Acked => stats.acked += 1,
                TaskStatus::NackedRequeue => stats.requeued += 1,
                TaskStatus::DeadLettered => stats.dead_lettered += 1,
            }
        }

        Ok(stats)
    }
}

impl<S> TaskStore for Arc<S>
where
    S: TaskStore + ?Sized,
{
    fn insert(&self, task: TaskHandle) -> Result<(), TaskStoreError> {
        (**self).insert(task)
    }

    fn get(&self, task_id: TaskId) -> Result<Option<TaskHandle>, TaskStoreError> {
        (**self).get(task_id)
    }

    fn update(
        &self,
        task_id: TaskId,
        f: &mut dyn FnMut(&mut TaskHandle),
    ) -> Result<TaskHandle, TaskStoreError> {
        (**self).update(task_id, f)
    }

    fn remove(&self, task_id: TaskId) -> Result<Option<TaskHandle>, TaskStoreError> {
        (**self).remove(task_id)
    }

    fn list(
        &self,
        queue: Option<&str>,
        status: Option<TaskStatus>,
        limit: usize,
    ) -> Result<Vec<TaskHandle>, TaskStoreError> {
        (**self).list(queue, status, limit)
    }

    fn stats(&self, queue: Option<&str>) -> Result<TaskStats, TaskStoreError> {
        (**self).stats(queue)
    }
}
