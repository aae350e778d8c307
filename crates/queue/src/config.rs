//! Queue and worker configuration.

use std::time::Duration;

use forgeflow_resilience::CircuitBreakerConfig;

use crate::types::TaskOptions;

/// Task queue configuration.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Options applied by `TaskQueue::enqueue_default`
    pub default_options: TaskOptions,
    /// Breaker settings for every per-queue circuit breaker
    pub circuit_breaker: CircuitBreakerConfig,
    /// Floor for the redelivery delay of a task deferred by an open circuit
    pub min_defer_delay: Duration,
    /// How often `wait_for` re-reads task state
    pub wait_poll_interval: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            default_options: TaskOptions::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            min_defer_delay: Duration::from_millis(100),
            wait_poll_interval: Duration::from_millis(10),
        }
    }
}

impl QueueConfig {
    pub fn with_default_options(mut self, options: TaskOptions) -> Self {
        self.default_options = options;
        self
    }

    pub fn with_circuit_breaker(mut self, config: CircuitBreakerConfig) -> Self {
        self.circuit_breaker = config;
        self
    }

    pub fn with_min_defer_delay(mut self, delay: Duration) -> Self {
        self.min_defer_delay = delay;
        self
    }
}

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Name for logging and the worker thread
    pub name: String,
    /// How long one broker receive blocks before re-checking for shutdown
    pub poll_interval: Duration,
    /// How often the worker scans for tasks whose visibility timeout expired
    pub reap_interval: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            name: "task-worker".to_string(),
            poll_interval: Duration::from_millis(250),
            reap_interval: Duration::from_secs(1),
        }
    }
}

impl WorkerConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_reap_interval(mut self, interval: Duration) -> Self {
        self.reap_interval = interval;
        self
    }
}
