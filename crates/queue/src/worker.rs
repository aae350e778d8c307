//! Background workers pulling deliveries from a broker queue.

use std::sync::{Arc, Mutex, mpsc};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, error, info};

use forgeflow_broker::{BrokerError, Subscription};

use crate::config::WorkerConfig;
use crate::queue::{QueueError, Settlement, TaskQueue};

/// Worker runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct WorkerStats {
    pub processed: u64,
    pub acked: u64,
    pub requeued: u64,
    pub dead_lettered: u64,
    pub deferred: u64,
    pub skipped: u64,
    pub reaped: u64,
    pub uptime_secs: u64,
}

impl WorkerStats {
    fn record(&mut self, settlement: Settlement) {
        self.processed += 1;
        match settlement {
            Settlement::Acked => self.acked += 1,
            Settlement::Requeued { .. } => self.requeued += 1,
            Settlement::DeadLettered { .. } => self.dead_lettered += 1,
            Settlement::Deferred { .. } => self.deferred += 1,
            Settlement::Stale | Settlement::Skipped => self.skipped += 1,
        }
    }

    pub fn merge(&mut self, other: &WorkerStats) {
        self.processed += other.processed;
        self.acked += other.acked;
        self.requeued += other.requeued;
        self.dead_lettered += other.dead_lettered;
        self.deferred += other.deferred;
        self.skipped += other.skipped;
        self.reaped += other.reaped;
        self.uptime_secs = self.uptime_secs.max(other.uptime_secs);
    }
}

/// A single consumer of one broker queue.
///
/// `process_next` handles at most one delivery on the calling thread;
/// `spawn` runs that in a loop on a dedicated thread.
pub struct Worker {
    queue: TaskQueue,
    subscription: Box<dyn Subscription>,
    config: WorkerConfig,
    stats: Arc<Mutex<WorkerStats>>,
    last_reap: Instant,
}

impl core::fmt::Debug for Worker {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Worker")
            .field("queue", &self.subscription.queue())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Worker {
    pub fn new(queue: TaskQueue, queue_name: &str, config: WorkerConfig) -> Result<Self, QueueError> {
        let subscription = queue.subscribe(queue_name)?;
        Ok(Self {
            queue,
            subscription,
            config,
            stats: Arc::new(Mutex::new(WorkerStats::default())),
            last_reap: Instant::now(),
        })
    }

    pub fn stats(&self) -> WorkerStats {
        self.stats.lock().unwrap().clone()
    }

    /// Wait up to `timeout` for one delivery and process it.
    ///
    /// Also expires overdue in-flight tasks once per `reap_interval`.
    pub fn process_next(&mut self, timeout: Duration) -> Result<Option<Settlement>, QueueError> {
        if self.last_reap.elapsed() >= self.config.reap_interval {
            self.last_reap = Instant::now();
            let reaped = self.queue.reap_expired()?;
            if reaped > 0 {
                self.stats.lock().unwrap().reaped += reaped as u64;
            }
        }

        let Some(delivery) = self.subscription.recv_timeout(timeout)? else {
            return Ok(None);
        };

        let settlement = self.queue.process(delivery)?;
        self.stats.lock().unwrap().record(settlement);
        Ok(Some(settlement))
    }

    /// Spawn the worker loop in a background thread.
    pub fn spawn(self) -> Result<WorkerHandle, QueueError> {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let stats = self.stats.clone();
        let name = self.config.name.clone();

        let join = thread::Builder::new()
            .name(name)
            .spawn(move || worker_loop(self, shutdown_rx))
            .map_err(|e| QueueError::Spawn(e.to_string()))?;

        Ok(WorkerHandle {
            shutdown: shutdown_tx,
            join: Some(join),
            stats,
        })
    }
}

fn worker_loop(mut worker: Worker, shutdown_rx: mpsc::Receiver<()>) {
    let name = worker.config.name.clone();
    let queue_name = worker.subscription.queue().to_string();
    let poll = worker.config.poll_interval;
    let start_time = Instant::now();
    info!(worker = %name, queue = %queue_name, "task worker started");

    loop {
        // Shutdown check (non-blocking)
        match shutdown_rx.try_recv() {
            Ok(()) | Err(mpsc::TryRecvError::Disconnected) => break,
            Err(mpsc::TryRecvError::Empty) => {}
        }

        worker.stats.lock().unwrap().uptime_secs = start_time.elapsed().as_secs();

        match worker.process_next(poll) {
            Ok(Some(settlement)) => {
                debug!(worker = %name, queue = %queue_name, ?settlement, "delivery processed");
            }
            Ok(None) => {}
            Err(QueueError::Broker(BrokerError::Closed)) => {
                info!(worker = %name, "broker closed");
                break;
            }
            Err(e) => {
                error!(worker = %name, queue = %queue_name, error = %e, "failed to process delivery");
                thread::sleep(poll);
            }
        }
    }

    info!(worker = %name, queue = %queue_name, "task worker stopped");
}

/// Handle to control and join a background worker.
#[derive(Debug)]
pub struct WorkerHandle {
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
    stats: Arc<Mutex<WorkerStats>>,
}

impl WorkerHandle {
    /// Request graceful shutdown and wait for the worker to stop. A delivery
    /// already being processed is finished first.
    pub fn shutdown(mut self) {
        let _ = self.shutdown.send(());
        if let Some(j) = self.join.take() {
            let _ = j.join();
        }
    }

    pub fn stats(&self) -> WorkerStats {
        self.stats.lock().unwrap().clone()
    }
}

/// Several workers competing on one queue.
#[derive(Debug)]
pub struct WorkerPool {
    handles: Vec<WorkerHandle>,
}

impl WorkerPool {
    /// Spawn `concurrency` workers named `{config.name}-{n}`.
    pub fn spawn(
        queue: &TaskQueue,
        queue_name: &str,
        concurrency: usize,
        config: WorkerConfig,
    ) -> Result<Self, QueueError> {
        let mut handles = Vec::with_capacity(concurrency);
        for n in 0..concurrency.max(1) {
            let worker_config = config.clone().with_name(format!("{}-{}", config.name, n + 1));
            let worker = Worker::new(queue.clone(), queue_name, worker_config)?;
            handles.push(worker.spawn()?);
        }
        Ok(Self { handles })
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Combined statistics of every worker.
    pub fn stats(&self) -> WorkerStats {
        let mut total = WorkerStats::default();
        for handle in &self.handles {
            total.merge(&handle.stats());
        }
        total
    }

    /// Stop every worker and return their final combined statistics.
    pub fn shutdown(self) -> WorkerStats {
        let mut total = WorkerStats::default();
        for handle in self.handles {
            let stats = handle.stats.clone();
            handle.shutdown();
            total.merge(&stats.lock().unwrap());
        }
        total
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueueConfig;
    use crate::types::{TaskError, TaskOptions, TaskStatus};
    use forgeflow_broker::InMemoryBroker;
    use forgeflow_resilience::Backoff;
    use serde_json::json;

    fn fast_config() -> WorkerConfig {
        WorkerConfig::default()
            .with_poll_interval(Duration::from_millis(20))
            .with_reap_interval(Duration::from_millis(20))
    }

    #[test]
    fn process_next_returns_none_when_idle() {
        let queue = TaskQueue::new(InMemoryBroker::new(), QueueConfig::default());
        let mut worker = Worker::new(queue, "idle", fast_config()).unwrap();
        assert_eq!(worker.process_next(Duration::from_millis(10)).unwrap(), None);
    }

    #[test]
    fn process_next_records_stats() {
        let queue = TaskQueue::new(InMemoryBroker::new(), QueueConfig::default());
        queue.register_handler("q", |_| Err(TaskError::permanent("nope")));
        queue.enqueue("q", json!({}), TaskOptions::default()).unwrap();

        let mut worker = Worker::new(queue, "q", fast_config()).unwrap();
        let settlement = worker.process_next(Duration::from_millis(200)).unwrap();

        assert!(matches!(settlement, Some(Settlement::DeadLettered { .. })));
        let stats = worker.stats();
        assert_eq!(stats.processed, 1);
        assert_eq!(stats.dead_lettered, 1);
    }

    #[test]
    fn pool_processes_tasks_concurrently() {
        let queue = TaskQueue::new(InMemoryBroker::new(), QueueConfig::default());
        queue.register_handler("jobs", |ctx| {
            thread::sleep(Duration::from_millis(5));
            Ok(ctx.payload.clone())
        });

        let pool = WorkerPool::spawn(&queue, "jobs", 4, fast_config()).unwrap();
        assert_eq!(pool.len(), 4);

        let options = TaskOptions::default().with_backoff(Backoff::none());
        let tasks: Vec<_> = (0..20)
            .map(|i| queue.enqueue("jobs", json!(i), options.clone()).unwrap())
            .collect();

        for task in &tasks {
            let done = queue.wait_for(task.id, Duration::from_secs(5)).unwrap();
            assert_eq!(done.status, TaskStatus::Acked);
            assert_eq!(done.output.as_ref(), Some(&task.payload));
        }

        let stats = pool.shutdown();
        assert_eq!(stats.acked, 20);
        assert_eq!(stats.processed, 20);
    }

    #[test]
    fn shutdown_stops_worker() {
        let queue = TaskQueue::new(InMemoryBroker::new(), QueueConfig::default());
        let handle = Worker::new(queue, "q", fast_config()).unwrap().spawn().unwrap();
        handle.shutdown();
    }
}
