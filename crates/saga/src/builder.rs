//! Saga definitions and their builder.

use std::collections::HashSet;
use std::sync::Arc;

use forgeflow_core::SagaId;
use forgeflow_resilience::RetryPolicy;

use crate::context::{ContextUpdate, SagaContext};
use crate::orchestrator::SagaError;
use crate::step::{StepAction, StepError, StepOptions};

/// One step of a saga: a forward action and an optional compensation.
#[derive(Clone)]
pub struct StepDefinition {
    name: String,
    forward: Arc<dyn StepAction>,
    compensate: Option<Arc<dyn StepAction>>,
    options: StepOptions,
}

impl core::fmt::Debug for StepDefinition {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("StepDefinition")
            .field("name", &self.name)
            .field("compensates", &self.compensate.is_some())
            .field("options", &self.options)
            .finish()
    }
}

impl StepDefinition {
    pub fn new(
        name: impl Into<String>,
        forward: Arc<dyn StepAction>,
        compensate: Option<Arc<dyn StepAction>>,
    ) -> Self {
        Self {
            name: name.into(),
            forward,
            compensate,
            options: StepOptions::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn options(&self) -> &StepOptions {
        &self.options
    }

    pub fn has_compensation(&self) -> bool {
        self.compensate.is_some()
    }

    pub(crate) fn forward(&self) -> &Arc<dyn StepAction> {
        &self.forward
    }

    pub(crate) fn compensation(&self) -> Option<&Arc<dyn StepAction>> {
        self.compensate.as_ref()
    }
}

/// An immutable saga definition, ready for [`crate::SagaOrchestrator::execute`].
///
/// Steps are stored as groups: a sequential step is a group of one, a
/// parallel block is a group of several.
#[derive(Debug, Clone)]
pub struct Saga {
    id: SagaId,
    saga_type: String,
    groups: Vec<Vec<StepDefinition>>,
    initial_context: SagaContext,
    retry_policy: RetryPolicy,
    compensation_retry_policy: RetryPolicy,
}

impl Saga {
    pub fn id(&self) -> SagaId {
        self.id
    }

    pub fn saga_type(&self) -> &str {
        &self.saga_type
    }

    pub fn groups(&self) -> &[Vec<StepDefinition>] {
        &self.groups
    }

    /// Every step in declaration order.
    pub fn steps(&self) -> impl Iterator<Item = &StepDefinition> {
        self.groups.iter().flatten()
    }

    pub fn step(&self, name: &str) -> Option<&StepDefinition> {
        self.steps().find(|s| s.name == name)
    }

    pub fn initial_context(&self) -> &SagaContext {
        &self.initial_context
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry_policy
    }

    pub fn compensation_retry_policy(&self) -> &RetryPolicy {
        &self.compensation_retry_policy
    }

    /// Forward retry policy for a step (its override, else the saga's).
    pub fn retry_policy_for(&self, step: &StepDefinition) -> RetryPolicy {
        step.options
            .retry
            .clone()
            .unwrap_or_else(|| self.retry_policy.clone())
    }

    pub fn compensation_policy_for(&self, step: &StepDefinition) -> RetryPolicy {
        step.options
            .compensation_retry
            .clone()
            .unwrap_or_else(|| self.compensation_retry_policy.clone())
    }
}

/// Steps of a parallel block.
#[derive(Debug, Default)]
pub struct GroupBuilder {
    steps: Vec<StepDefinition>,
}

impl GroupBuilder {
    pub fn add_step<F, C>(&mut self, name: impl Into<String>, forward: F, compensate: C) -> &mut Self
    where
        F: Fn(&SagaContext) -> Result<ContextUpdate, StepError> + Send + Sync + 'static,
        C: Fn(&SagaContext) -> Result<ContextUpdate, StepError> + Send + Sync + 'static,
    {
        let compensate: Arc<dyn StepAction> = Arc::new(compensate);
        self.steps
            .push(StepDefinition::new(name, Arc::new(forward), Some(compensate)));
        self
    }

    pub fn step<F>(&mut self, name: impl Into<String>, forward: F) -> &mut Self
    where
        F: Fn(&SagaContext) -> Result<ContextUpdate, StepError> + Send + Sync + 'static,
    {
        self.steps.push(StepDefinition::new(name, Arc::new(forward), None));
        self
    }

    pub fn add_action(
        &mut self,
        name: impl Into<String>,
        forward: impl StepAction + 'static,
        compensate: Option<Arc<dyn StepAction>>,
    ) -> &mut Self {
        self.steps
            .push(StepDefinition::new(name, Arc::new(forward), compensate));
        self
    }

    /// Override the policies of the most recently added step.
    pub fn with_options(&mut self, options: StepOptions) -> &mut Self {
        if let Some(last) = self.steps.last_mut() {
            last.options = options;
        }
        self
    }
}

/// Builder for [`Saga`].
///
/// ```ignore
/// let saga = SagaBuilder::new("order_fulfilment")
///     .add_step("reserveInventory", reserve, release)
///     .add_step("chargePayment", charge, refund)
///     .step("shipOrder", ship)
///     .build()?;
/// ```
#[derive(Debug)]
pub struct SagaBuilder {
    id: Option<SagaId>,
    saga_type: String,
    groups: Vec<Vec<StepDefinition>>,
    initial_context: SagaContext,
    retry_policy: RetryPolicy,
    compensation_retry_policy: RetryPolicy,
}

impl SagaBuilder {
    pub fn new(saga_type: impl Into<String>) -> Self {
        Self {
            id: None,
            saga_type: saga_type.into(),
            groups: Vec::new(),
            initial_context: SagaContext::new(),
            retry_policy: RetryPolicy::default(),
            compensation_retry_policy: RetryPolicy::default(),
        }
    }

    /// Reuse an existing id, e.g. to resume a persisted saga.
    pub fn with_id(mut self, id: SagaId) -> Self {
        self.id = Some(id);
        self
    }

    pub fn with_context(mut self, context: SagaContext) -> Self {
        self.initial_context = context;
        self
    }

    /// Default forward retry policy for every step.
    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Default compensation retry policy for every step.
    pub fn compensation_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.compensation_retry_policy = policy;
        self
    }

    pub fn add_step<F, C>(mut self, name: impl Into<String>, forward: F, compensate: C) -> Self
    where
        F: Fn(&SagaContext) -> Result<ContextUpdate, StepError> + Send + Sync + 'static,
        C: Fn(&SagaContext) -> Result<ContextUpdate, StepError> + Send + Sync + 'static,
    {
        let compensate: Arc<dyn StepAction> = Arc::new(compensate);
        self.groups
            .push(vec![StepDefinition::new(name, Arc::new(forward), Some(compensate))]);
        self
    }

    /// A step with nothing to undo.
    pub fn step<F>(mut self, name: impl Into<String>, forward: F) -> Self
    where
        F: Fn(&SagaContext) -> Result<ContextUpdate, StepError> + Send + Sync + 'static,
    {
        self.groups
            .push(vec![StepDefinition::new(name, Arc::new(forward), None)]);
        self
    }

    /// A step backed by any [`StepAction`], such as a [`crate::QueuedStep`].
    pub fn add_action(
        mut self,
        name: impl Into<String>,
        forward: impl StepAction + 'static,
        compensate: Option<Arc<dyn StepAction>>,
    ) -> Self {
        self.groups
            .push(vec![StepDefinition::new(name, Arc::new(forward), compensate)]);
        self
    }

    /// Override the policies of the most recently added step.
    pub fn with_options(mut self, options: StepOptions) -> Self {
        if let Some(last) = self.groups.last_mut().and_then(|g| g.last_mut()) {
            last.options = options;
        }
        self
    }

    /// Steps that run concurrently. The saga moves on only when all of them
    /// complete; if any fails, every completed member is compensated too.
    pub fn parallel(mut self, build: impl FnOnce(&mut GroupBuilder)) -> Self {
        let mut group = GroupBuilder::default();
        build(&mut group);
        self.groups.push(group.steps);
        self
    }

    pub fn build(self) -> Result<Saga, SagaError> {
        if self.groups.is_empty() {
            return Err(SagaError::InvalidDefinition("saga has no steps".to_string()));
        }
        if let Some(idx) = self.groups.iter().position(|g| g.is_empty()) {
            return Err(SagaError::InvalidDefinition(format!(
                "parallel group {idx} has no steps"
            )));
        }

        let mut seen = HashSet::new();
        for step in self.groups.iter().flatten() {
            if step.name.is_empty() {
                return Err(SagaError::InvalidDefinition("step name is empty".to_string()));
            }
            if !seen.insert(step.name.as_str()) {
                return Err(SagaError::InvalidDefinition(format!(
                    "duplicate step name '{}'",
                    step.name
                )));
            }
        }

        let invalid = |e: forgeflow_resilience::PolicyError| SagaError::InvalidDefinition(e.to_string());
        self.retry_policy.validate().map_err(invalid)?;
        self.compensation_retry_policy.validate().map_err(invalid)?;
        for step in self.groups.iter().flatten() {
            if let Some(policy) = &step.options.retry {
                policy.validate().map_err(invalid)?;
            }
            if let Some(policy) = &step.options.compensation_retry {
                policy.validate().map_err(invalid)?;
            }
        }

        Ok(Saga {
            id: self.id.unwrap_or_default(),
            saga_type: self.saga_type,
            groups: self.groups,
            initial_context: self.initial_context,
            retry_policy: self.retry_policy,
            compensation_retry_policy: self.compensation_retry_policy,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn noop(_: &SagaContext) -> Result<ContextUpdate, StepError> {
        Ok(ContextUpdate::new())
    }

    #[test]
    fn builds_groups_in_declaration_order() {
        let saga = SagaBuilder::new("order")
            .add_step("reserve", noop, noop)
            .parallel(|g| {
                g.step("email", noop).add_step("ledger", noop, noop);
            })
            .step("ship", noop)
            .build()
            .unwrap();

        let names: Vec<_> = saga.steps().map(|s| s.name()).collect();
        assert_eq!(names, vec!["reserve", "email", "ledger", "ship"]);
        assert_eq!(saga.groups().len(), 3);
        assert!(saga.step("reserve").unwrap().has_compensation());
        assert!(!saga.step("ship").unwrap().has_compensation());
    }

    #[test]
    fn rejects_empty_and_duplicate_definitions() {
        assert!(matches!(
            SagaBuilder::new("empty").build(),
            Err(SagaError::InvalidDefinition(_))
        ));
        assert!(matches!(
            SagaBuilder::new("g").parallel(|_| {}).build(),
            Err(SagaError::InvalidDefinition(_))
        ));
        assert!(matches!(
            SagaBuilder::new("dup").step("a", noop).step("a", noop).build(),
            Err(SagaError::InvalidDefinition(_))
        ));
    }

    #[test]
    fn rejects_invalid_policies() {
        let bad = RetryPolicy {
            max_attempts: 0,
            ..RetryPolicy::default()
        };
        assert!(SagaBuilder::new("s").step("a", noop).retry_policy(bad.clone()).build().is_err());
        assert!(
            SagaBuilder::new("s")
                .step("a", noop)
                .with_options(StepOptions::new().with_retry(bad))
                .build()
                .is_err()
        );
    }

    #[test]
    fn step_options_override_saga_policy() {
        let saga = SagaBuilder::new("s")
            .retry_policy(RetryPolicy::immediate(2))
            .step("a", noop)
            .with_options(
                StepOptions::new()
                    .with_retry(RetryPolicy::immediate(7))
                    .with_timeout(Duration::from_millis(50)),
            )
            .step("b", noop)
            .build()
            .unwrap();

        let a = saga.step("a").unwrap();
        let b = saga.step("b").unwrap();
        assert_eq!(saga.retry_policy_for(a).max_attempts, 7);
        assert_eq!(saga.retry_policy_for(b).max_attempts, 2);
        assert_eq!(a.options().timeout, Some(Duration::from_millis(50)));
    }

    #[test]
    fn with_id_is_kept() {
        let id = SagaId::new();
        let saga = SagaBuilder::new("s").with_id(id).step("a", noop).build().unwrap();
        assert_eq!(saga.id(), id);
    }
}
