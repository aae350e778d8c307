//! Dead-letter queue: tasks that exhausted their retry budget or failed permanently.
//!
//! Entries are append-only and stay until an operator (or automation)
//! replays or purges them. Nothing here reprocesses entries on its own.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use forgeflow_core::DlqEntryId;

use crate::queue::{QueueError, TaskQueue};
use crate::types::{AttemptRecord, TaskHandle};

/// Entry in the dead-letter queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DlqEntry {
    pub id: DlqEntryId,
    /// Task as it was when it was dead-lettered
    pub task: TaskHandle,
    /// Failed attempts, oldest first
    pub failures: Vec<AttemptRecord>,
    pub arrived_at: DateTime<Utc>,
    pub reason: String,
}

impl DlqEntry {
    pub fn new(task: TaskHandle, failures: Vec<AttemptRecord>, reason: impl Into<String>) -> Self {
        Self {
            id: DlqEntryId::new(),
            task,
            failures,
            arrived_at: Utc::now(),
            reason: reason.into(),
        }
    }

    pub fn queue(&self) -> &str {
        &self.task.queue
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DlqError {
    #[error("dead-letter entry not found: {0}")]
    NotFound(DlqEntryId),
    #[error("dead-letter entry already exists: {0}")]
    AlreadyExists(DlqEntryId),
    #[error("storage error: {0}")]
    Storage(String),
}

/// Dead-letter storage.
pub trait DlqStore: Send + Sync {
    fn insert(&self, entry: DlqEntry) -> Result<(), DlqError>;

    fn get(&self, id: DlqEntryId) -> Result<Option<DlqEntry>, DlqError>;

    /// Entries ordered by arrival, optionally filtered by queue.
    fn list(&self, queue: Option<&str>) -> Result<Vec<DlqEntry>, DlqError>;

    fn remove(&self, id: DlqEntryId) -> Result<Option<DlqEntry>, DlqError>;
}

/// In-memory dead-letter store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryDlqStore {
    entries: RwLock<HashMap<DlqEntryId, DlqEntry>>,
}

impl InMemoryDlqStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DlqStore for InMemoryDlqStore {
    fn insert(&self, entry: DlqEntry) -> Result<(), DlqError> {
        let mut entries = self.entries.write().unwrap();
        if entries.contains_key(&entry.id) {
            return Err(DlqError::AlreadyExists(entry.id));
        }
        entries.insert(entry.id, entry);
        Ok(())
    }

    fn get(&self, id: DlqEntryId) -> Result<Option<DlqEntry>, DlqError> {
        Ok(self.entries.read().unwrap().get(&id).cloned())
    }

    fn list(&self, queue: Option<&str>) -> Result<Vec<DlqEntry>, DlqError> {
        let entries = self.entries.read().unwrap();
        let mut result: Vec<_> = entries
            .values()
            .filter(|e| queue.is_none_or(|q| e.queue() == q))
            .cloned()
            .collect();
        result.sort_by_key(|e| (e.arrived_at, e.id));
        Ok(result)
    }

    fn remove(&self, id: DlqEntryId) -> Result<Option<DlqEntry>, DlqError> {
        Ok(self.entries.write().unwrap().remove(&id))
    }
}

/// Per-queue overview of dead-lettered tasks.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DlqSummary {
    pub total: usize,
    /// Entry count per final error message
    pub by_error: BTreeMap<String, usize>,
    pub oldest: Option<DateTime<Utc>>,
    pub newest: Option<DateTime<Utc>>,
}

/// Sink for failed tasks, with inspection and replay.
#[derive(Clone)]
pub struct DeadLetterQueue {
    store: Arc<dyn DlqStore>,
}

impl core::fmt::Debug for DeadLetterQueue {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("DeadLetterQueue").finish_non_exhaustive()
    }
}

impl Default for DeadLetterQueue {
    fn default() -> Self {
        Self::new(Arc::new(InMemoryDlqStore::new()))
    }
}

impl DeadLetterQueue {
    pub fn new(store: Arc<dyn DlqStore>) -> Self {
        Self { store }
    }

    /// Persist a failed task with its failure history.
    pub fn receive(
        &self,
        task: TaskHandle,
        failures: Vec<AttemptRecord>,
        reason: impl Into<String>,
    ) -> Result<DlqEntryId, DlqError> {
        let entry = DlqEntry::new(task, failures, reason);
        let id = entry.id;
        self.store.insert(entry.clone())?;

        warn!(
            dlq_entry_id = %id,
            task_id = %entry.task.id,
            queue = %entry.task.queue,
            attempts = entry.task.attempts,
            reason = %entry.reason,
            "task dead-lettered"
        );
        Ok(id)
    }

    pub fn list(&self, queue: &str) -> Result<Vec<DlqEntry>, DlqError> {
        self.store.list(Some(queue))
    }

    pub fn list_all(&self) -> Result<Vec<DlqEntry>, DlqError> {
        self.store.list(None)
    }

    pub fn get(&self, id: DlqEntryId) -> Result<Option<DlqEntry>, DlqError> {
        self.store.get(id)
    }

    /// Re-enqueue the original payload as a fresh task with a reset attempt
    /// counter. The entry is removed once the new task is published.
    pub fn replay(&self, id: DlqEntryId, queue: &TaskQueue) -> Result<TaskHandle, QueueError> {
        let entry = self.store.remove(id)?.ok_or(DlqError::NotFound(id))?;

        match queue.enqueue(&entry.task.queue, entry.task.payload.clone(), entry.task.options.clone()) {
            Ok(task) => {
                info!(
                    dlq_entry_id = %id,
                    original_task_id = %entry.task.id,
                    task_id = %task.id,
                    queue = %task.queue,
                    "dead-letter entry replayed"
                );
                Ok(task)
            }
            Err(err) => {
                // Keep the entry so the replay can be attempted again.
                self.store.insert(entry)?;
                Err(err)
            }
        }
    }

    /// Discard an entry without replaying it.
    pub fn purge(&self, id: DlqEntryId) -> Result<DlqEntry, DlqError> {
        let entry = self.store.remove(id)?.ok_or(DlqError::NotFound(id))?;
        info!(dlq_entry_id = %id, queue = %entry.task.queue, "dead-letter entry purged");
        Ok(entry)
    }

    pub fn summary(&self, queue: &str) -> Result<DlqSummary, DlqError> {
        let entries = self.store.list(Some(queue))?;
        let mut summary = DlqSummary {
            total: entries.len(),
            ..Default::default()
        };

        for entry in &entries {
            let key = entry
                .task
                .last_error()
                .map(|e| e.message.clone())
                .unwrap_or_else(|| entry.reason.clone());
            *summary.by_error.entry(key).or_default() += 1;

            summary.oldest = Some(summary.oldest.map_or(entry.arrived_at, |t| t.min(entry.arrived_at)));
            summary.newest = Some(summary.newest.map_or(entry.arrived_at, |t| t.max(entry.arrived_at)));
        }

        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{TaskError, TaskOptions};
    use forgeflow_broker::MessageId;
    use serde_json::json;

    fn failed_task(queue: &str, error: &str) -> TaskHandle {
        let mut task = TaskHandle::new(queue, json!({"n": 1}), TaskOptions::default());
        task.mark_in_flight(MessageId::new("m-1"));
        task.mark_failed(TaskError::permanent(error), Utc::now());
        task
    }

    #[test]
    fn receive_and_list_by_queue() {
        let dlq = DeadLetterQueue::default();
        let task = failed_task("payments", "card declined");
        let failures = task.failures();
        let id = dlq.receive(task.clone(), failures, "permanent failure").unwrap();
        dlq.receive(failed_task("emails", "bounce"), vec![], "permanent failure")
            .unwrap();

        let entries = dlq.list("payments").unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].id, id);
        assert_eq!(entries[0].task.id, task.id);
        assert_eq!(entries[0].failures.len(), 1);
        assert_eq!(dlq.list_all().unwrap().len(), 2);
    }

    #[test]
    fn purge_removes_entry() {
        let dlq = DeadLetterQueue::default();
        let id = dlq
            .receive(failed_task("q", "boom"), vec![], "permanent failure")
            .unwrap();

        let purged = dlq.purge(id).unwrap();
        assert_eq!(purged.id, id);
        assert!(dlq.get(id).unwrap().is_none());
        assert_eq!(dlq.purge(id), Err(DlqError::NotFound(id)));
    }

    #[test]
    fn summary_groups_by_final_error() {
        let dlq = DeadLetterQueue::default();
        for error in ["timeout", "timeout", "card declined"] {
            dlq.receive(failed_task("payments", error), vec![], "x").unwrap();
        }

        let summary = dlq.summary("payments").unwrap();
        assert_eq!(summary.total, 3);
        assert_eq!(summary.by_error.get("timeout"), Some(&2));
        assert_eq!(summary.by_error.get("card declined"), Some(&1));
        assert!(summary.oldest <= summary.newest);
        assert_eq!(dlq.summary("other").unwrap(), DlqSummary::default());
    }
}
