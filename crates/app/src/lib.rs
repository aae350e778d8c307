//! Wiring for the forgeflow runtime: broker, task queue, workers and the
//! saga orchestrator, configured from the environment.

pub mod config;
pub mod demo;

use std::sync::Arc;

use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::info;

use forgeflow_broker::{BrokerError, BrokerTransport, InMemoryBroker};
use forgeflow_queue::{
    DeadLetterQueue, InMemoryTaskStore, QueueError, TaskContext, TaskError, TaskQueue, WorkerPool,
    WorkerStats,
};
use forgeflow_saga::SagaOrchestrator;

pub use config::{AppConfig, ConfigError};

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error(transparent)]
    Queue(#[from] QueueError),
}

/// A running task queue with its worker pools and an orchestrator.
#[derive(Debug)]
pub struct Runtime {
    config: AppConfig,
    queue: TaskQueue,
    orchestrator: SagaOrchestrator,
    pools: Vec<(String, WorkerPool)>,
}

impl Runtime {
    pub fn new(config: AppConfig) -> Result<Self, RuntimeError> {
        let broker = build_broker(&config)?;
        let queue = TaskQueue::with_stores(
            broker,
            InMemoryTaskStore::arc(),
            DeadLetterQueue::default(),
            config.queue_config(),
        );

        Ok(Self {
            config,
            queue,
            orchestrator: SagaOrchestrator::in_memory(),
            pools: Vec::new(),
        })
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn queue(&self) -> &TaskQueue {
        &self.queue
    }

    pub fn orchestrator(&self) -> &SagaOrchestrator {
        &self.orchestrator
    }

    pub fn register_handler<F>(&self, pattern: &str, handler: F)
    where
        F: Fn(&TaskContext) -> Result<JsonValue, TaskError> + Send + Sync + 'static,
    {
        self.queue.register_handler(pattern, handler);
    }

    /// Start `worker_concurrency` workers on `queue_name`.
    pub fn spawn_workers(&mut self, queue_name: &str) -> Result<(), RuntimeError> {
        let config = self
            .config
            .worker_config()
            .with_name(format!("worker-{queue_name}"));
        let pool = WorkerPool::spawn(
            &self.queue,
            queue_name,
            self.config.worker_concurrency,
            config,
        )?;
        info!(queue = %queue_name, workers = pool.len(), "worker pool started");
        self.pools.push((queue_name.to_string(), pool));
        Ok(())
    }

    /// Stop every worker pool and return their combined statistics.
    pub fn shutdown(self) -> WorkerStats {
        let mut total = WorkerStats::default();
        for (queue_name, pool) in self.pools {
            let stats = pool.shutdown();
            info!(queue = %queue_name, processed = stats.processed, dead_lettered = stats.dead_lettered, "worker pool stopped");
            total.merge(&stats);
        }
        total
    }
}

fn build_broker(config: &AppConfig) -> Result<Arc<dyn BrokerTransport>, RuntimeError> {
    match &config.redis_url {
        Some(url) => redis_broker(url),
        None => Ok(Arc::new(InMemoryBroker::new())),
    }
}

#[cfg(feature = "redis")]
fn redis_broker(url: &str) -> Result<Arc<dyn BrokerTransport>, RuntimeError> {
    let broker = forgeflow_broker::RedisStreamsBroker::new(url, None, None)?;
    info!("using Redis Streams broker");
    Ok(Arc::new(broker))
}

#[cfg(not(feature = "redis"))]
fn redis_broker(_url: &str) -> Result<Arc<dyn BrokerTransport>, RuntimeError> {
    tracing::warn!("REDIS_URL set but redis feature not enabled, falling back to in-memory broker");
    Ok(Arc::new(InMemoryBroker::new()))
}
