//! End-to-end saga scenarios, including steps dispatched through the task
//! queue to background workers.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier, Mutex};
use std::thread;
use std::time::Duration;

use serde_json::json;

use forgeflow_broker::InMemoryBroker;
use forgeflow_queue::{QueueConfig, TaskError, TaskOptions, TaskQueue, WorkerConfig, WorkerPool};
use forgeflow_resilience::{Backoff, RetryPolicy};

use crate::builder::SagaBuilder;
use crate::context::{ContextUpdate, SagaContext};
use crate::orchestrator::{OrchestratorConfig, SagaError, SagaOrchestrator};
use crate::step::{QueuedStep, StepAction, StepError};
use crate::store::{InMemorySagaStore, SagaStore};
use crate::types::{SagaState, SagaStatus, StepStatus};

type Log = Arc<Mutex<Vec<String>>>;

fn recording(log: &Log, entry: &str) -> impl Fn(&SagaContext) -> Result<ContextUpdate, StepError> + Send + Sync + 'static {
    let log = log.clone();
    let entry = entry.to_string();
    move |_| {
        log.lock().unwrap().push(entry.clone());
        Ok(ContextUpdate::new())
    }
}

fn entries(log: &Log) -> Vec<String> {
    log.lock().unwrap().clone()
}

#[test]
fn order_saga_compensates_when_payment_is_declined() {
    let log: Log = Arc::default();
    let charge_log = log.clone();

    let saga = SagaBuilder::new("order_fulfilment")
        .retry_policy(RetryPolicy::immediate(3))
        .with_context([("order_id", json!("o-42"))].into_iter().collect())
        .add_step(
            "reserveInventory",
            {
                let log = log.clone();
                move |_| {
                    log.lock().unwrap().push("reserveInventory".to_string());
                    Ok(ContextUpdate::new().set("reservation_id", json!("r-1")))
                }
            },
            {
                let log = log.clone();
                move |ctx| {
                    assert_eq!(ctx.get("reservation_id"), Some(&json!("r-1")));
                    log.lock().unwrap().push("release:reserveInventory".to_string());
                    Ok(ContextUpdate::new().set("reservation_released", json!(true)))
                }
            },
        )
        .add_step(
            "chargePayment",
            move |_| {
                charge_log.lock().unwrap().push("chargePayment".to_string());
                Err(StepError::permanent("card declined"))
            },
            recording(&log, "refund:chargePayment"),
        )
        .add_step("shipOrder", recording(&log, "shipOrder"), recording(&log, "cancel:shipOrder"))
        .build()
        .unwrap();

    let orchestrator = SagaOrchestrator::in_memory();
    let result = orchestrator.execute(&saga).unwrap();

    assert_eq!(result.status, SagaStatus::Compensated);
    assert_eq!(result.failed_step.as_deref(), Some("chargePayment"));
    assert!(result.error.as_deref().unwrap().contains("card declined"));
    assert_eq!(result.compensation_failed_step, None);
    assert_eq!(result.context.get("reservation_released"), Some(&json!(true)));
    let at_failure = result.failure_context.as_ref().unwrap();
    assert_eq!(at_failure.get("reservation_id"), Some(&json!("r-1")));
    assert!(!at_failure.contains_key("reservation_released"));
    assert_eq!(
        entries(&log),
        vec!["reserveInventory", "chargePayment", "release:reserveInventory"]
    );

    let state = orchestrator.status(saga.id()).unwrap().unwrap();
    assert_eq!(state.step("reserveInventory").unwrap().status, StepStatus::Compensated);
    assert_eq!(state.step("chargePayment").unwrap().status, StepStatus::Failed);
    assert_eq!(state.step("chargePayment").unwrap().attempts, 1);
    assert_eq!(state.step("shipOrder").unwrap().status, StepStatus::Pending);
    assert_eq!(state.step("shipOrder").unwrap().attempts, 0);
}

#[test]
fn transient_failures_are_retried_until_success() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();

    let saga = SagaBuilder::new("flaky")
        .retry_policy(RetryPolicy::immediate(3))
        .step("lockStock", move |_| {
            if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(StepError::transient("lock contention"))
            } else {
                Ok(ContextUpdate::new().set("locked", json!(true)))
            }
        })
        .build()
        .unwrap();

    let orchestrator = SagaOrchestrator::in_memory();
    let result = orchestrator.execute(&saga).unwrap();

    assert_eq!(result.status, SagaStatus::Completed);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    let state = orchestrator.status(saga.id()).unwrap().unwrap();
    assert_eq!(state.step("lockStock").unwrap().attempts, 3);
}

#[test]
fn exhausted_transient_retries_trigger_compensation() {
    let log: Log = Arc::default();
    let saga = SagaBuilder::new("flaky")
        .retry_policy(RetryPolicy::immediate(2))
        .add_step("a", recording(&log, "a"), recording(&log, "undo:a"))
        .step("b", |_| Err(StepError::transient("upstream unavailable")))
        .build()
        .unwrap();

    let orchestrator = SagaOrchestrator::in_memory();
    let result = orchestrator.execute(&saga).unwrap();

    assert_eq!(result.status, SagaStatus::Compensated);
    assert_eq!(result.failed_step.as_deref(), Some("b"));
    assert_eq!(entries(&log), vec!["a", "undo:a"]);
    let state = orchestrator.status(saga.id()).unwrap().unwrap();
    assert_eq!(state.step("b").unwrap().attempts, 2);
}

#[test]
fn failed_compensation_halts_rollback() {
    let log: Log = Arc::default();
    let undo_b_calls = Arc::new(AtomicUsize::new(0));
    let counter = undo_b_calls.clone();

    let saga = SagaBuilder::new("partial")
        .retry_policy(RetryPolicy::no_retry())
        .compensation_retry_policy(RetryPolicy::immediate(2))
        .add_step("a", recording(&log, "a"), recording(&log, "undo:a"))
        .add_step("b", recording(&log, "b"), move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(StepError::transient("refund service down"))
        })
        .step("c", |_| Err(StepError::permanent("rejected")))
        .build()
        .unwrap();

    let orchestrator = SagaOrchestrator::in_memory();
    let result = orchestrator.execute(&saga).unwrap();

    assert_eq!(result.status, SagaStatus::Failed);
    assert_eq!(result.failed_step.as_deref(), Some("c"));
    assert_eq!(result.compensation_failed_step.as_deref(), Some("b"));
    assert_eq!(undo_b_calls.load(Ordering::SeqCst), 2);
    // "a" is never compensated once "b" gives up.
    assert_eq!(entries(&log), vec!["a", "b"]);

    let state = orchestrator.status(saga.id()).unwrap().unwrap();
    assert_eq!(state.step("a").unwrap().status, StepStatus::Completed);
    assert_eq!(state.step("b").unwrap().status, StepStatus::Compensating);
    assert_eq!(state.step("b").unwrap().compensation_attempts, 2);
}

#[test]
fn completed_saga_is_not_run_again() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let saga = SagaBuilder::new("once")
        .step("a", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(ContextUpdate::new().set("n", json!(1)))
        })
        .build()
        .unwrap();

    let orchestrator = SagaOrchestrator::in_memory();
    let first = orchestrator.execute(&saga).unwrap();
    let second = orchestrator.execute(&saga).unwrap();

    assert_eq!(first, second);
    assert_eq!(second.status, SagaStatus::Completed);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn resumes_from_last_checkpoint() {
    let store = InMemorySagaStore::arc();
    let log: Log = Arc::default();
    let saga = SagaBuilder::new("resume")
        .add_step("a", recording(&log, "a"), recording(&log, "undo:a"))
        .add_step("b", recording(&log, "b"), recording(&log, "undo:b"))
        .build()
        .unwrap();

    // A previous orchestrator finished "a" and crashed while "b" was running.
    let mut state = SagaState::new(&saga);
    state.steps[0].status = StepStatus::Completed;
    state.steps[0].attempts = 1;
    state.steps[1].status = StepStatus::Running;
    state.context.insert("from_a", json!("kept"));
    state.version = 7;
    store.save(&state).unwrap();

    let orchestrator = SagaOrchestrator::new(store, OrchestratorConfig::default());
    let result = orchestrator.execute(&saga).unwrap();

    assert_eq!(result.status, SagaStatus::Completed);
    assert_eq!(result.context.get("from_a"), Some(&json!("kept")));
    assert_eq!(entries(&log), vec!["b"]);
}

#[test]
fn parallel_group_runs_members_concurrently() {
    let barrier = Arc::new(Barrier::new(2));
    let (b1, b2) = (barrier.clone(), barrier.clone());

    let saga = SagaBuilder::new("fan_out")
        .parallel(|g| {
            g.step("email", move |_| {
                b1.wait();
                Ok(ContextUpdate::new().set("emailed", json!(true)))
            })
            .step("ledger", move |_| {
                b2.wait();
                Ok(ContextUpdate::new().set("posted", json!(true)))
            });
        })
        .build()
        .unwrap();

    let result = SagaOrchestrator::in_memory().execute(&saga).unwrap();

    assert_eq!(result.status, SagaStatus::Completed);
    assert_eq!(result.context.get("emailed"), Some(&json!(true)));
    assert_eq!(result.context.get("posted"), Some(&json!(true)));
}

#[test]
fn parallel_group_failure_rolls_back_whole_group() {
    let log: Log = Arc::default();
    let saga = SagaBuilder::new("fan_out")
        .retry_policy(RetryPolicy::no_retry())
        .add_step("reserve", recording(&log, "reserve"), recording(&log, "undo:reserve"))
        .parallel(|g| {
            g.add_step("notify", recording(&log, "notify"), recording(&log, "undo:notify"))
                .add_step(
                    "charge",
                    |_| Err(StepError::permanent("insufficient funds")),
                    recording(&log, "undo:charge"),
                );
        })
        .add_step("ship", recording(&log, "ship"), recording(&log, "undo:ship"))
        .build()
        .unwrap();

    let orchestrator = SagaOrchestrator::in_memory();
    let result = orchestrator.execute(&saga).unwrap();

    assert_eq!(result.status, SagaStatus::Compensated);
    assert_eq!(result.failed_step.as_deref(), Some("charge"));

    let log = entries(&log);
    assert_eq!(log[..2], ["reserve".to_string(), "notify".to_string()]);
    assert_eq!(log[2..], ["undo:notify".to_string(), "undo:reserve".to_string()]);

    let state = orchestrator.status(saga.id()).unwrap().unwrap();
    assert_eq!(state.step("notify").unwrap().status, StepStatus::Compensated);
    assert_eq!(state.step("charge").unwrap().status, StepStatus::Failed);
    assert_eq!(state.step("ship").unwrap().status, StepStatus::Pending);
}

#[test]
fn cancellation_waits_for_running_step_then_compensates() {
    let log: Log = Arc::default();
    let started = Arc::new(AtomicBool::new(false));
    let release = Arc::new(AtomicBool::new(false));

    let saga = {
        let slow_log = log.clone();
        let started = started.clone();
        let release = release.clone();
        SagaBuilder::new("cancellable")
            .add_step(
                "slow",
                move |_| {
                    started.store(true, Ordering::SeqCst);
                    while !release.load(Ordering::SeqCst) {
                        thread::sleep(Duration::from_millis(5));
                    }
                    slow_log.lock().unwrap().push("slow".to_string());
                    Ok(ContextUpdate::new())
                },
                recording(&log, "undo:slow"),
            )
            .add_step("next", recording(&log, "next"), recording(&log, "undo:next"))
            .build()
            .unwrap()
    };

    let orchestrator = SagaOrchestrator::in_memory();
    let result = thread::scope(|s| {
        let running = s.spawn(|| orchestrator.execute(&saga));

        while !started.load(Ordering::SeqCst) {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(orchestrator.cancel(saga.id()).unwrap());
        release.store(true, Ordering::SeqCst);

        running.join().unwrap().unwrap()
    });

    assert_eq!(result.status, SagaStatus::Compensated);
    assert_eq!(result.error.as_deref(), Some("cancelled"));
    assert_eq!(result.failed_step, None);
    assert_eq!(entries(&log), vec!["slow", "undo:slow"]);
}

#[test]
fn one_saga_cannot_run_twice_at_once() {
    let store = InMemorySagaStore::arc();
    let first = SagaOrchestrator::new(store.clone(), OrchestratorConfig::default().with_owner("first"));
    let second = SagaOrchestrator::new(store, OrchestratorConfig::default().with_owner("second"));

    let started = Arc::new(AtomicBool::new(false));
    let release = Arc::new(AtomicBool::new(false));
    let saga = {
        let started = started.clone();
        let release = release.clone();
        SagaBuilder::new("exclusive")
            .step("hold", move |_| {
                started.store(true, Ordering::SeqCst);
                while !release.load(Ordering::SeqCst) {
                    thread::sleep(Duration::from_millis(5));
                }
                Ok(ContextUpdate::new())
            })
            .build()
            .unwrap()
    };

    thread::scope(|s| {
        let running = s.spawn(|| first.execute(&saga));
        while !started.load(Ordering::SeqCst) {
            thread::sleep(Duration::from_millis(5));
        }

        assert!(matches!(second.execute(&saga), Err(SagaError::LeaseHeld(_))));
        assert!(matches!(first.execute(&saga), Err(SagaError::LeaseHeld(_))));

        release.store(true, Ordering::SeqCst);
        assert_eq!(running.join().unwrap().unwrap().status, SagaStatus::Completed);
    });

    // Lease released: the other orchestrator now sees the stored result.
    assert_eq!(second.execute(&saga).unwrap().status, SagaStatus::Completed);
}

#[test]
fn lease_outlives_a_step_longer_than_its_ttl() {
    let ttl = Duration::from_millis(150);
    let store = InMemorySagaStore::arc();
    let first = SagaOrchestrator::new(
        store.clone(),
        OrchestratorConfig::default().with_owner("first").with_lease_ttl(ttl),
    );
    let second = SagaOrchestrator::new(
        store,
        OrchestratorConfig::default().with_owner("second").with_lease_ttl(ttl),
    );

    let active = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let runs = Arc::new(AtomicUsize::new(0));
    let saga = {
        let (active, peak, runs) = (active.clone(), peak.clone(), runs.clone());
        SagaBuilder::new("long_running")
            .step("slow", move |_| {
                runs.fetch_add(1, Ordering::SeqCst);
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                thread::sleep(ttl * 4);
                active.fetch_sub(1, Ordering::SeqCst);
                Ok(ContextUpdate::new())
            })
            .build()
            .unwrap()
    };

    thread::scope(|s| {
        let running = s.spawn(|| first.execute(&saga));
        thread::sleep(ttl * 2);

        assert!(matches!(second.execute(&saga), Err(SagaError::LeaseHeld(_))));
        assert_eq!(running.join().unwrap().unwrap().status, SagaStatus::Completed);
    });

    assert_eq!(runs.load(Ordering::SeqCst), 1);
    assert_eq!(peak.load(Ordering::SeqCst), 1);
}

fn fast_workers() -> WorkerConfig {
    WorkerConfig::default()
        .with_poll_interval(Duration::from_millis(10))
        .with_reap_interval(Duration::from_millis(50))
}

#[test]
fn queued_steps_dead_letter_and_compensate() {
    let queue = TaskQueue::new(InMemoryBroker::new(), QueueConfig::default());
    queue.register_handler("inventory.reserve", |ctx| {
        let order = ctx.payload["order_id"].as_str().unwrap_or_default().to_string();
        Ok(json!({ "reservation_id": format!("r-{order}") }))
    });
    queue.register_handler("payments.charge", |_| Err(TaskError::permanent("card declined")));

    let inventory = WorkerPool::spawn(&queue, "inventory.reserve", 2, fast_workers()).unwrap();
    let payments = WorkerPool::spawn(&queue, "payments.charge", 2, fast_workers()).unwrap();

    let options = TaskOptions::default()
        .with_max_attempts(3)
        .with_backoff(Backoff::none());
    let released = Arc::new(AtomicBool::new(false));
    let flag = released.clone();
    let release_stock: Arc<dyn StepAction> =
        Arc::new(move |ctx: &SagaContext| -> Result<ContextUpdate, StepError> {
            assert_eq!(ctx.get("reservation_id"), Some(&json!("r-o-7")));
            flag.store(true, Ordering::SeqCst);
            Ok(ContextUpdate::new())
        });

    let saga = SagaBuilder::new("order_fulfilment")
        .retry_policy(RetryPolicy::no_retry())
        .with_context([("order_id", json!("o-7"))].into_iter().collect())
        .add_action(
            "reserveInventory",
            QueuedStep::new(queue.clone(), "inventory.reserve")
                .with_options(options.clone())
                .with_wait_timeout(Duration::from_secs(5)),
            Some(release_stock),
        )
        .add_action(
            "chargePayment",
            QueuedStep::new(queue.clone(), "payments.charge")
                .with_options(options)
                .with_wait_timeout(Duration::from_secs(5)),
            None,
        )
        .build()
        .unwrap();

    let result = SagaOrchestrator::in_memory().execute(&saga).unwrap();

    inventory.shutdown();
    let payment_stats = payments.shutdown();

    assert_eq!(result.status, SagaStatus::Compensated);
    assert_eq!(result.failed_step.as_deref(), Some("chargePayment"));
    assert!(result.error.as_deref().unwrap().contains("card declined"));
    assert_eq!(result.context.get("reservation_id"), Some(&json!("r-o-7")));
    assert!(released.load(Ordering::SeqCst));

    assert_eq!(payment_stats.dead_lettered, 1);
    let dead = queue.dead_letters().list("payments.charge").unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].failures.len(), 1);
    assert_eq!(dead[0].task.payload["order_id"], json!("o-7"));
}

#[test]
fn queued_step_survives_transient_task_failures() {
    let queue = TaskQueue::new(InMemoryBroker::new(), QueueConfig::default());
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    queue.register_handler("shipping.*", move |ctx| {
        if counter.fetch_add(1, Ordering::SeqCst) < 2 {
            Err(TaskError::transient("carrier timeout"))
        } else {
            Ok(json!({ "tracking": format!("t-{}", ctx.attempt) }))
        }
    });
    let pool = WorkerPool::spawn(&queue, "shipping.book", 1, fast_workers()).unwrap();

    let saga = SagaBuilder::new("ship")
        .retry_policy(RetryPolicy::no_retry())
        .add_action(
            "shipOrder",
            QueuedStep::new(queue.clone(), "shipping.book")
                .with_options(
                    TaskOptions::default()
                        .with_max_attempts(3)
                        .with_backoff(Backoff::fixed(Duration::from_millis(10))),
                )
                .with_wait_timeout(Duration::from_secs(5)),
            None,
        )
        .build()
        .unwrap();

    let result = SagaOrchestrator::in_memory().execute(&saga).unwrap();
    let stats = pool.shutdown();

    assert_eq!(result.status, SagaStatus::Completed);
    assert_eq!(result.context.get("tracking"), Some(&json!("t-3")));
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(stats.requeued, 2);
    assert!(queue.dead_letters().list_all().unwrap().is_empty());
}
