//! Saga execution: forward steps, rollback, checkpoints and leases.

use std::collections::HashSet;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use forgeflow_core::SagaId;
use forgeflow_resilience::{CancellationToken, ResilienceError, ResiliencePolicy, RetryPolicy};

use crate::builder::{Saga, StepDefinition};
use crate::context::{ContextUpdate, SagaContext};
use crate::step::{StepAction, StepError};
use crate::store::{InMemorySagaStore, SagaStore, SagaStoreError};
use crate::types::{SagaResult, SagaState, SagaStatus, StepStatus};

#[derive(Debug, Error)]
pub enum SagaError {
    #[error(transparent)]
    Store(#[from] SagaStoreError),

    #[error("saga {0} is being executed by another orchestrator")]
    LeaseHeld(SagaId),

    #[error("invalid saga definition: {0}")]
    InvalidDefinition(String),

    #[error("saga {saga_id} does not match its persisted state: {reason}")]
    DefinitionMismatch { saga_id: SagaId, reason: String },

    #[error("saga {0} not found")]
    NotFound(SagaId),
}

/// Orchestrator configuration.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Lease owner name; must be unique per orchestrator instance
    pub owner: String,
    /// How long a lease survives without being renewed. A running saga
    /// renews its lease every third of this.
    pub lease_ttl: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            owner: format!("orchestrator-{}", uuid::Uuid::now_v7()),
            lease_ttl: Duration::from_secs(300),
        }
    }
}

impl OrchestratorConfig {
    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = owner.into();
        self
    }

    pub fn with_lease_ttl(mut self, ttl: Duration) -> Self {
        self.lease_ttl = ttl;
        self
    }
}

#[derive(Debug, Default)]
struct LocalRuns {
    running: HashSet<SagaId>,
    cancelled: HashSet<SagaId>,
    /// Runs whose lease could not be renewed
    lost: HashSet<SagaId>,
}

struct Inner {
    store: Arc<dyn SagaStore>,
    config: OrchestratorConfig,
    local: Mutex<LocalRuns>,
}

/// Runs sagas to completion or rollback.
///
/// Cheap to clone; clones share the store and the set of sagas currently
/// running in this process.
#[derive(Clone)]
pub struct SagaOrchestrator {
    inner: Arc<Inner>,
}

impl core::fmt::Debug for SagaOrchestrator {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SagaOrchestrator")
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

struct StepOutcome {
    result: Result<ContextUpdate, StepError>,
    attempts: u32,
}

impl SagaOrchestrator {
    pub fn new(store: Arc<dyn SagaStore>, config: OrchestratorConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                config,
                local: Mutex::new(LocalRuns::default()),
            }),
        }
    }

    /// Orchestrator backed by an [`InMemorySagaStore`].
    pub fn in_memory() -> Self {
        Self::new(InMemorySagaStore::arc(), OrchestratorConfig::default())
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.inner.config
    }

    /// Run `saga` until it completes, is rolled back, or rollback fails.
    ///
    /// Resumes from the persisted state when the saga has run before; a saga
    /// already in a terminal state returns its stored result without running
    /// anything. Step failures are reported in the [`SagaResult`]; `Err` is
    /// returned only when persistence fails or another orchestrator holds the
    /// saga's lease.
    pub fn execute(&self, saga: &Saga) -> Result<SagaResult, SagaError> {
        let saga_id = saga.id();
        let owner = &self.inner.config.owner;

        {
            let mut local = self.inner.local.lock().unwrap();
            if local.running.contains(&saga_id) {
                return Err(SagaError::LeaseHeld(saga_id));
            }
            if !self
                .inner
                .store
                .try_acquire_lease(saga_id, owner, self.inner.config.lease_ttl)?
            {
                return Err(SagaError::LeaseHeld(saga_id));
            }
            local.running.insert(saga_id);
        }

        let result = thread::scope(|scope| {
            let (stop, stopped) = mpsc::channel::<()>();
            scope.spawn(move || self.heartbeat(saga_id, stopped));
            let result = self.run(saga);
            drop(stop);
            result
        });

        {
            let mut local = self.inner.local.lock().unwrap();
            local.running.remove(&saga_id);
            local.cancelled.remove(&saga_id);
            local.lost.remove(&saga_id);
        }
        if let Err(e) = self.inner.store.release_lease(saga_id, owner) {
            warn!(%saga_id, error = %e, "failed to release saga lease");
        }

        result
    }

    /// Request cancellation of a saga.
    ///
    /// A running saga stops dispatching new steps once the current step (or
    /// group) finishes, then compensates what completed. A saga that is not
    /// running gets the request persisted and is rolled back on its next
    /// `execute`. Returns `false` if the saga already finished.
    pub fn cancel(&self, saga_id: SagaId) -> Result<bool, SagaError> {
        let mut local = self.inner.local.lock().unwrap();

        if local.running.contains(&saga_id) {
            local.cancelled.insert(saga_id);
            info!(%saga_id, "saga cancellation requested");
            return Ok(true);
        }

        let owner = &self.inner.config.owner;
        if !self
            .inner
            .store
            .try_acquire_lease(saga_id, owner, self.inner.config.lease_ttl)?
        {
            return Err(SagaError::LeaseHeld(saga_id));
        }

        let outcome = self.persist_cancellation(saga_id);
        if let Err(e) = self.inner.store.release_lease(saga_id, owner) {
            warn!(%saga_id, error = %e, "failed to release saga lease");
        }
        outcome
    }

    fn persist_cancellation(&self, saga_id: SagaId) -> Result<bool, SagaError> {
        let mut state = self
            .inner
            .store
            .load(saga_id)?
            .ok_or(SagaError::NotFound(saga_id))?;
        if state.status.is_terminal() {
            return Ok(false);
        }
        state.cancel_requested = true;
        state.touch();
        self.inner.store.save(&state)?;
        info!(%saga_id, "saga cancellation persisted");
        Ok(true)
    }

    /// Persisted state of a saga.
    pub fn status(&self, saga_id: SagaId) -> Result<Option<SagaState>, SagaError> {
        Ok(self.inner.store.load(saga_id)?)
    }

    pub fn list(&self, status: Option<SagaStatus>) -> Result<Vec<SagaState>, SagaError> {
        Ok(self.inner.store.list(status)?)
    }

    fn run(&self, saga: &Saga) -> Result<SagaResult, SagaError> {
        let saga_id = saga.id();

        let mut state = match self.inner.store.load(saga_id)? {
            Some(state) if state.status.is_terminal() => {
                debug!(%saga_id, status = ?state.status, "saga already finished");
                return Ok(SagaResult::from(&state));
            }
            Some(state) => {
                check_definition(saga, &state)?;
                info!(%saga_id, saga_type = %state.saga_type, status = ?state.status, "resuming saga");
                state
            }
            None => {
                let mut state = SagaState::new(saga);
                self.persist(&mut state)?;
                info!(%saga_id, saga_type = %state.saga_type, steps = state.steps.len(), "saga started");
                state
            }
        };

        if state.status == SagaStatus::Running {
            self.run_forward(saga, &mut state)?;
        }
        if state.status == SagaStatus::Compensating {
            self.run_compensation(saga, &mut state)?;
        }

        info!(
            %saga_id,
            status = ?state.status,
            failed_step = state.failed_step.as_deref().unwrap_or(""),
            "saga finished"
        );
        Ok(SagaResult::from(&state))
    }

    fn run_forward(&self, saga: &Saga, state: &mut SagaState) -> Result<(), SagaError> {
        let saga_id = saga.id();
        let mut offset = 0;

        for group in saga.groups() {
            let start = offset;
            offset += group.len();

            if self.cancel_requested(state) {
                info!(%saga_id, "saga cancelled, compensating");
                state.cancel_requested = true;
                state.begin_compensation();
                state.error = Some("cancelled".to_string());
                return self.persist(state);
            }

            // A step recorded as failed before a crash still fails the saga.
            if let Some(idx) = (start..offset).find(|&i| state.steps[i].status == StepStatus::Failed) {
                let record = &state.steps[idx];
                state.failed_step = Some(record.name.clone());
                state.error = record.last_error.as_ref().map(|e| e.to_string());
                state.begin_compensation();
                return self.persist(state);
            }

            let pending: Vec<usize> = (start..offset)
                .filter(|&i| state.steps[i].status != StepStatus::Completed)
                .collect();
            if pending.is_empty() {
                continue;
            }

            let now = Utc::now();
            for &i in &pending {
                state.steps[i].status = StepStatus::Running;
                state.steps[i].started_at = Some(now);
            }
            self.persist(state)?;

            let outcomes = if pending.len() == 1 {
                let step = &group[pending[0] - start];
                vec![self.run_step_forward(saga, step, &state.context)]
            } else {
                let snapshot = &state.context;
                thread::scope(|scope| {
                    let handles: Vec<_> = pending
                        .iter()
                        .map(|&i| {
                            let step = &group[i - start];
                            scope.spawn(move || self.run_step_forward(saga, step, snapshot))
                        })
                        .collect();
                    handles
                        .into_iter()
                        .map(|h| {
                            h.join().unwrap_or_else(|_| StepOutcome {
                                result: Err(StepError::transient("step action panicked")),
                                attempts: 1,
                            })
                        })
                        .collect::<Vec<_>>()
                })
            };

            let mut failure: Option<(String, StepError)> = None;
            let finished_at = Utc::now();
            for (&i, outcome) in pending.iter().zip(outcomes) {
                let record = &mut state.steps[i];
                record.attempts += outcome.attempts;
                record.finished_at = Some(finished_at);
                match outcome.result {
                    Ok(update) => {
                        record.status = StepStatus::Completed;
                        record.last_error = None;
                        debug!(%saga_id, step = %record.name, attempts = record.attempts, "step completed");
                        state.context.merge(update);
                    }
                    Err(err) => {
                        record.status = StepStatus::Failed;
                        record.last_error = Some(err.clone());
                        warn!(%saga_id, step = %record.name, attempts = record.attempts, error = %err, "step failed");
                        if failure.is_none() {
                            failure = Some((record.name.clone(), err));
                        }
                    }
                }
            }

            if let Some((step, err)) = failure {
                state.failed_step = Some(step);
                state.error = Some(err.to_string());
                state.begin_compensation();
                return self.persist(state);
            }
            self.persist(state)?;
        }

        state.status = SagaStatus::Completed;
        self.persist(state)
    }

    fn run_compensation(&self, saga: &Saga, state: &mut SagaState) -> Result<(), SagaError> {
        let saga_id = saga.id();
        let steps: Vec<&StepDefinition> = saga.steps().collect();
        info!(%saga_id, failed_step = state.failed_step.as_deref().unwrap_or(""), "compensating saga");

        for idx in (0..steps.len()).rev() {
            let step = steps[idx];
            if !matches!(
                state.steps[idx].status,
                StepStatus::Completed | StepStatus::Compensating
            ) {
                continue;
            }

            let Some(action) = step.compensation() else {
                state.steps[idx].status = StepStatus::Compensated;
                self.persist(state)?;
                continue;
            };

            state.steps[idx].status = StepStatus::Compensating;
            self.persist(state)?;

            let policy = saga.compensation_policy_for(step);
            let outcome = self.run_action(saga_id, step, action, policy, &state.context, "compensate");

            let record = &mut state.steps[idx];
            record.compensation_attempts += outcome.attempts;
            match outcome.result {
                Ok(update) => {
                    record.status = StepStatus::Compensated;
                    debug!(%saga_id, step = %record.name, "step compensated");
                    state.context.merge(update);
                    self.persist(state)?;
                }
                Err(err) => {
                    record.last_error = Some(err.clone());
                    error!(
                        %saga_id,
                        step = %record.name,
                        attempts = record.compensation_attempts,
                        error = %err,
                        "compensation failed, saga requires manual intervention"
                    );
                    state.compensation_failed_step = Some(record.name.clone());
                    state.error = Some(format!("compensation of '{}' failed: {}", record.name, err));
                    state.status = SagaStatus::Failed;
                    return self.persist(state);
                }
            }
        }

        state.status = SagaStatus::Compensated;
        self.persist(state)
    }

    fn run_step_forward(&self, saga: &Saga, step: &StepDefinition, ctx: &SagaContext) -> StepOutcome {
        let policy = saga.retry_policy_for(step);
        self.run_action(saga.id(), step, step.forward(), policy, ctx, "forward")
    }

    /// One action under its retry policy and the step's timeout, if any.
    fn run_action(
        &self,
        saga_id: SagaId,
        step: &StepDefinition,
        action: &Arc<dyn StepAction>,
        retry: RetryPolicy,
        ctx: &SagaContext,
        phase: &'static str,
    ) -> StepOutcome {
        let calls = Arc::new(AtomicU32::new(0));
        let mut policy = ResiliencePolicy::new(retry);
        if let Some(timeout) = step.options().timeout {
            policy = policy.with_timeout(timeout);
        }

        let op = {
            let calls = Arc::clone(&calls);
            let action = Arc::clone(action);
            let ctx = ctx.clone();
            let step_name = step.name().to_string();
            move |attempt: u32, _token: CancellationToken| {
                calls.fetch_add(1, Ordering::SeqCst);
                debug!(%saga_id, step = %step_name, phase, attempt, "running step action");
                let result = panic::catch_unwind(AssertUnwindSafe(|| action.run(&ctx)))
                    .unwrap_or_else(|_| Err(StepError::transient("step action panicked")));
                if let Err(err) = &result {
                    warn!(%saga_id, step = %step_name, phase, attempt, error = %err, "step attempt failed");
                }
                result
            }
        };

        let result = policy.execute(op).map_err(|err| match err {
            ResilienceError::Operation(e) => e,
            ResilienceError::Timeout(e) => StepError::transient(e.to_string()),
            ResilienceError::CircuitOpen(e) => StepError::transient(e.to_string()),
        });

        StepOutcome {
            result,
            attempts: calls.load(Ordering::SeqCst),
        }
    }

    fn cancel_requested(&self, state: &SagaState) -> bool {
        state.cancel_requested
            || self
                .inner
                .local
                .lock()
                .unwrap()
                .cancelled
                .contains(&state.saga_id)
    }

    /// Renew the lease every third of its TTL until `stopped` fires.
    ///
    /// A renewal refused because another owner holds the lease marks the run
    /// as lost, and its next checkpoint fails with `LeaseHeld`. Store errors
    /// are retried on the next beat.
    fn heartbeat(&self, saga_id: SagaId, stopped: mpsc::Receiver<()>) {
        let config = &self.inner.config;
        let interval = (config.lease_ttl / 3).max(Duration::from_millis(1));

        loop {
            match stopped.recv_timeout(interval) {
                Err(RecvTimeoutError::Timeout) => {}
                _ => return,
            }

            match self
                .inner
                .store
                .try_acquire_lease(saga_id, &config.owner, config.lease_ttl)
            {
                Ok(true) => {}
                Ok(false) => {
                    error!(%saga_id, "saga lease taken over while running");
                    self.inner.local.lock().unwrap().lost.insert(saga_id);
                    return;
                }
                Err(e) => warn!(%saga_id, error = %e, "saga lease renewal failed"),
            }
        }
    }

    /// Renew the lease and checkpoint `state`.
    fn persist(&self, state: &mut SagaState) -> Result<(), SagaError> {
        let saga_id = state.saga_id;
        if self.inner.local.lock().unwrap().lost.contains(&saga_id) {
            error!(%saga_id, "saga lease lost");
            return Err(SagaError::LeaseHeld(saga_id));
        }
        if !self.inner.store.try_acquire_lease(
            saga_id,
            &self.inner.config.owner,
            self.inner.config.lease_ttl,
        )? {
            error!(%saga_id, "saga lease lost");
            return Err(SagaError::LeaseHeld(saga_id));
        }

        state.touch();
        self.inner.store.save(state).map_err(|e| {
            error!(%saga_id, error = %e, "failed to persist saga state");
            SagaError::Store(e)
        })
    }
}

fn check_definition(saga: &Saga, state: &SagaState) -> Result<(), SagaError> {
    let mismatch = |reason: String| SagaError::DefinitionMismatch {
        saga_id: saga.id(),
        reason,
    };

    if state.saga_type != saga.saga_type() {
        return Err(mismatch(format!(
            "saga type is '{}', persisted '{}'",
            saga.saga_type(),
            state.saga_type
        )));
    }

    let defined: Vec<(&str, usize)> = saga
        .groups()
        .iter()
        .enumerate()
        .flat_map(|(g, steps)| steps.iter().map(move |s| (s.name(), g)))
        .collect();
    let persisted: Vec<(&str, usize)> = state.steps.iter().map(|s| (s.name.as_str(), s.group)).collect();

    if defined != persisted {
        return Err(mismatch("step layout differs".to_string()));
    }
    Ok(())
}
