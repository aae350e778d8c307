//! Persisted execution state of a saga.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use forgeflow_core::SagaId;

use crate::builder::Saga;
use crate::context::SagaContext;
use crate::step::StepError;

/// Lifecycle of one step.
///
/// `Pending → Running → {Completed | Failed}`; during rollback a completed
/// step moves `Compensating → Compensated`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Compensating,
    Compensated,
}

/// Lifecycle of a saga.
///
/// `Running → {Completed | Compensating → Compensated | Failed}`. `Failed`
/// is only reached when a compensation itself gives up.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SagaStatus {
    Running,
    Compensating,
    Completed,
    Compensated,
    Failed,
}

impl SagaStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SagaStatus::Completed | SagaStatus::Compensated | SagaStatus::Failed
        )
    }
}

/// Execution record of one step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub name: String,
    /// Index of the group the step belongs to (sequential steps form groups of one)
    pub group: usize,
    pub status: StepStatus,
    /// Forward calls made so far
    pub attempts: u32,
    /// Compensation calls made so far
    pub compensation_attempts: u32,
    pub last_error: Option<StepError>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl StepRecord {
    pub fn new(name: impl Into<String>, group: usize) -> Self {
        Self {
            name: name.into(),
            group,
            status: StepStatus::Pending,
            attempts: 0,
            compensation_attempts: 0,
            last_error: None,
            started_at: None,
            finished_at: None,
        }
    }
}

/// Checkpointed state of a saga instance.
///
/// Written through [`crate::SagaStore`] after every transition, so a
/// restarted orchestrator continues from the last saved copy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SagaState {
    pub saga_id: SagaId,
    pub saga_type: String,
    pub status: SagaStatus,
    /// Step records in declaration order
    pub steps: Vec<StepRecord>,
    pub context: SagaContext,
    /// `context` as it stood when the saga stopped moving forward, before
    /// any compensation touched it
    #[serde(default)]
    pub failure_context: Option<SagaContext>,
    pub failed_step: Option<String>,
    pub error: Option<String>,
    pub compensation_failed_step: Option<String>,
    pub cancel_requested: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Incremented on every save
    pub version: u64,
}

impl SagaState {
    /// Fresh state for a saga that has not run yet.
    pub fn new(saga: &Saga) -> Self {
        let now = Utc::now();
        let steps = saga
            .groups()
            .iter()
            .enumerate()
            .flat_map(|(group, steps)| {
                steps
                    .iter()
                    .map(move |step| StepRecord::new(step.name(), group))
            })
            .collect();

        Self {
            saga_id: saga.id(),
            saga_type: saga.saga_type().to_string(),
            status: SagaStatus::Running,
            steps,
            context: saga.initial_context().clone(),
            failure_context: None,
            failed_step: None,
            error: None,
            compensation_failed_step: None,
            cancel_requested: false,
            created_at: now,
            updated_at: now,
            version: 0,
        }
    }

    pub fn step(&self, name: &str) -> Option<&StepRecord> {
        self.steps.iter().find(|s| s.name == name)
    }

    pub fn step_mut(&mut self, name: &str) -> Option<&mut StepRecord> {
        self.steps.iter_mut().find(|s| s.name == name)
    }

    /// Names of compensated steps, in declaration order.
    pub fn compensated_steps(&self) -> Vec<&str> {
        self.steps
            .iter()
            .filter(|s| s.status == StepStatus::Compensated)
            .map(|s| s.name.as_str())
            .collect()
    }

    /// Switch to `Compensating`, keeping the context the rollback starts from.
    pub(crate) fn begin_compensation(&mut self) {
        if self.failure_context.is_none() {
            self.failure_context = Some(self.context.clone());
        }
        self.status = SagaStatus::Compensating;
    }

    pub(crate) fn touch(&mut self) {
        self.updated_at = Utc::now();
        self.version += 1;
    }
}

/// Outcome of [`crate::SagaOrchestrator::execute`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SagaResult {
    pub saga_id: SagaId,
    pub status: SagaStatus,
    /// Context at the end of the run, compensation updates included
    pub context: SagaContext,
    /// Context when the saga failed or was cancelled
    pub failure_context: Option<SagaContext>,
    /// Step whose forward action failed, if any
    pub failed_step: Option<String>,
    pub error: Option<String>,
    /// Step whose compensation gave up, if any
    pub compensation_failed_step: Option<String>,
}

impl SagaResult {
    pub fn is_completed(&self) -> bool {
        self.status == SagaStatus::Completed
    }
}

impl From<&SagaState> for SagaResult {
    fn from(state: &SagaState) -> Self {
        Self {
            saga_id: state.saga_id,
            status: state.status,
            context: state.context.clone(),
            failure_context: state.failure_context.clone(),
            failed_step: state.failed_step.clone(),
            error: state.error.clone(),
            compensation_failed_step: state.compensation_failed_step.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::SagaBuilder;
    use crate::context::ContextUpdate;

    #[test]
    fn new_state_lists_steps_with_groups() {
        let saga = SagaBuilder::new("order")
            .step("reserve", |_: &SagaContext| Ok(ContextUpdate::new()))
            .parallel(|g| {
                g.step("notify", |_: &SagaContext| Ok(ContextUpdate::new()))
                    .step("audit", |_: &SagaContext| Ok(ContextUpdate::new()));
            })
            .build()
            .unwrap();

        let state = SagaState::new(&saga);
        let layout: Vec<_> = state.steps.iter().map(|s| (s.name.as_str(), s.group)).collect();
        assert_eq!(layout, vec![("reserve", 0), ("notify", 1), ("audit", 1)]);
        assert!(state.steps.iter().all(|s| s.status == StepStatus::Pending));
        assert_eq!(state.status, SagaStatus::Running);
    }

    #[test]
    fn terminal_statuses() {
        assert!(!SagaStatus::Running.is_terminal());
        assert!(!SagaStatus::Compensating.is_terminal());
        assert!(SagaStatus::Completed.is_terminal());
        assert!(SagaStatus::Compensated.is_terminal());
        assert!(SagaStatus::Failed.is_terminal());
    }

    #[test]
    fn state_round_trips_through_json() {
        let saga = SagaBuilder::new("order")
            .step("reserve", |_: &SagaContext| Ok(ContextUpdate::new()))
            .build()
            .unwrap();
        let state = SagaState::new(&saga);

        let json = serde_json::to_value(&state).unwrap();
        assert_eq!(json["status"], "running");
        assert_eq!(json["steps"][0]["status"], "pending");
        let back: SagaState = serde_json::from_value(json).unwrap();
        assert_eq!(back, state);
    }
}
