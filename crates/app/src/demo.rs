//! Order fulfilment saga: reserve stock, charge the customer, book shipping,
//! then send a confirmation.
//!
//! Every step runs as a task on its own queue; stock reservations and
//! charges have compensating tasks. The confirmation is best effort: when it
//! cannot be sent the order still completes and is flagged for a later
//! notification.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Value as JsonValue, json};

use forgeflow_queue::{TaskContext, TaskError};
use forgeflow_resilience::{Fallback, RetryPolicy};
use forgeflow_saga::{
    ContextUpdate, QueuedStep, Saga, SagaBuilder, SagaContext, SagaError, StepAction, StepError,
};
use tracing::warn;

use crate::{Runtime, RuntimeError};

pub const RESERVE_QUEUE: &str = "inventory.reserve";
pub const RELEASE_QUEUE: &str = "inventory.release";
pub const CHARGE_QUEUE: &str = "payments.charge";
pub const REFUND_QUEUE: &str = "payments.refund";
pub const SHIP_QUEUE: &str = "shipping.book";
pub const NOTIFY_QUEUE: &str = "notifications.order_confirmed";

/// Largest charge the demo payment provider accepts.
const CHARGE_LIMIT_CENTS: u64 = 100_000;
const STOCK_ON_HAND: u32 = 50;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    pub order_id: String,
    pub sku: String,
    pub quantity: u32,
    pub amount_cents: u64,
    /// Where the confirmation goes; orders without one get no confirmation
    #[serde(default)]
    pub email: Option<String>,
}

/// One order that goes through and one whose charge is declined.
pub fn sample_orders() -> Vec<Order> {
    vec![
        Order {
            order_id: "o-1001".to_string(),
            sku: "widget".to_string(),
            quantity: 2,
            amount_cents: 4_999,
            email: Some("ada@example.com".to_string()),
        },
        Order {
            order_id: "o-1002".to_string(),
            sku: "widget".to_string(),
            quantity: 1,
            amount_cents: 250_000,
            email: None,
        },
    ]
}

fn order_id(ctx: &TaskContext) -> Result<String, TaskError> {
    ctx.payload["order_id"]
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| TaskError::permanent("payload has no order_id"))
}

fn reserve(ctx: &TaskContext) -> Result<JsonValue, TaskError> {
    let order = order_id(ctx)?;
    let quantity = ctx.payload["quantity"].as_u64().unwrap_or(0);
    if quantity > u64::from(STOCK_ON_HAND) {
        return Err(TaskError::permanent(format!("insufficient stock for {order}")));
    }
    Ok(json!({ "reservation_id": format!("res-{order}") }))
}

fn release(ctx: &TaskContext) -> Result<JsonValue, TaskError> {
    let order = order_id(ctx)?;
    Ok(json!({ "reservation_released": format!("res-{order}") }))
}

fn charge(ctx: &TaskContext) -> Result<JsonValue, TaskError> {
    let order = order_id(ctx)?;
    let amount = ctx.payload["amount_cents"].as_u64().unwrap_or(0);
    if amount > CHARGE_LIMIT_CENTS {
        return Err(TaskError::permanent("card declined"));
    }
    Ok(json!({ "charge_id": format!("ch-{order}") }))
}

fn refund(ctx: &TaskContext) -> Result<JsonValue, TaskError> {
    let order = order_id(ctx)?;
    Ok(json!({ "refunded": format!("ch-{order}") }))
}

fn ship(ctx: &TaskContext) -> Result<JsonValue, TaskError> {
    let order = order_id(ctx)?;
    Ok(json!({ "tracking_number": format!("trk-{order}") }))
}

fn notify(ctx: &TaskContext) -> Result<JsonValue, TaskError> {
    let order = order_id(ctx)?;
    let Some(email) = ctx.payload["email"].as_str() else {
        return Err(TaskError::permanent(format!("no contact address for {order}")));
    };
    Ok(json!({ "notification_id": format!("ntf-{order}"), "notified": email }))
}

/// Register the demo handlers and start workers on every demo queue.
pub fn install(runtime: &mut Runtime) -> Result<(), RuntimeError> {
    runtime.register_handler(RESERVE_QUEUE, reserve);
    runtime.register_handler(RELEASE_QUEUE, release);
    runtime.register_handler(CHARGE_QUEUE, charge);
    runtime.register_handler(REFUND_QUEUE, refund);
    runtime.register_handler(SHIP_QUEUE, ship);
    runtime.register_handler(NOTIFY_QUEUE, notify);

    for queue in [
        RESERVE_QUEUE,
        RELEASE_QUEUE,
        CHARGE_QUEUE,
        REFUND_QUEUE,
        SHIP_QUEUE,
        NOTIFY_QUEUE,
    ] {
        runtime.spawn_workers(queue)?;
    }
    Ok(())
}

fn context_for(order: &Order) -> SagaContext {
    match serde_json::to_value(order) {
        Ok(JsonValue::Object(fields)) => fields.into_iter().collect(),
        _ => SagaContext::new(),
    }
}

/// The order fulfilment saga for one order.
///
/// Forward steps are not retried by the saga: the queue already redelivers
/// transient failures. Compensations get a few retries of their own.
pub fn order_saga(runtime: &Runtime, order: &Order) -> Result<Saga, SagaError> {
    let queue = runtime.queue();
    let wait = runtime.config().handler_timeout * runtime.config().max_attempts + Duration::from_secs(5);
    let queued = |name: &str| QueuedStep::new(queue.clone(), name).with_wait_timeout(wait);
    let release: Arc<dyn StepAction> = Arc::new(queued(RELEASE_QUEUE));
    let refund: Arc<dyn StepAction> = Arc::new(queued(REFUND_QUEUE));

    let confirmation = queued(NOTIFY_QUEUE);
    let best_effort = Fallback::<StepError>::new();
    let notify_customer = move |ctx: &SagaContext| {
        best_effort.run(
            || confirmation.run(ctx),
            |err| {
                warn!(error = %err, "order confirmation not sent");
                Ok(ContextUpdate::new().set("notification", json!("deferred")))
            },
        )
    };

    SagaBuilder::new("order_fulfilment")
        .with_context(context_for(order))
        .retry_policy(RetryPolicy::no_retry())
        .compensation_retry_policy(RetryPolicy::exponential(
            3,
            Duration::from_millis(100),
            Duration::from_secs(1),
        ))
        .add_action("reserveInventory", queued(RESERVE_QUEUE), Some(release))
        .add_action("chargePayment", queued(CHARGE_QUEUE), Some(refund))
        .add_action("shipOrder", queued(SHIP_QUEUE), None)
        .add_action("notifyCustomer", notify_customer, None)
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::AppConfig;
    use forgeflow_saga::SagaStatus;

    fn runtime() -> Runtime {
        let config = AppConfig {
            worker_concurrency: 1,
            poll_interval: Duration::from_millis(10),
            ..AppConfig::default()
        };
        let mut runtime = Runtime::new(config).unwrap();
        install(&mut runtime).unwrap();
        runtime
    }

    #[test]
    fn sample_orders_complete_and_compensate() {
        let runtime = runtime();
        let orders = sample_orders();

        let shipped = runtime
            .orchestrator()
            .execute(&order_saga(&runtime, &orders[0]).unwrap())
            .unwrap();
        assert_eq!(shipped.status, SagaStatus::Completed);
        assert_eq!(shipped.context.get("tracking_number"), Some(&json!("trk-o-1001")));
        assert_eq!(shipped.context.get("charge_id"), Some(&json!("ch-o-1001")));
        assert_eq!(shipped.context.get("notification_id"), Some(&json!("ntf-o-1001")));

        let declined = runtime
            .orchestrator()
            .execute(&order_saga(&runtime, &orders[1]).unwrap())
            .unwrap();
        assert_eq!(declined.status, SagaStatus::Compensated);
        assert_eq!(declined.failed_step.as_deref(), Some("chargePayment"));
        assert_eq!(
            declined.context.get("reservation_released"),
            Some(&json!("res-o-1002"))
        );
        assert!(!declined.context.contains_key("refunded"));

        let stats = runtime.shutdown();
        assert_eq!(stats.dead_lettered, 1);
    }

    #[test]
    fn oversized_order_fails_at_reservation() {
        let runtime = runtime();
        let order = Order {
            order_id: "o-big".to_string(),
            sku: "widget".to_string(),
            quantity: STOCK_ON_HAND + 1,
            amount_cents: 10,
            email: None,
        };

        let result = runtime
            .orchestrator()
            .execute(&order_saga(&runtime, &order).unwrap())
            .unwrap();
        assert_eq!(result.status, SagaStatus::Compensated);
        assert_eq!(result.failed_step.as_deref(), Some("reserveInventory"));
        assert!(!result.context.contains_key("reservation_released"));

        let queue = runtime.queue().clone();
        runtime.shutdown();
        let dead = queue.dead_letters().summary(RESERVE_QUEUE).unwrap();
        assert_eq!(dead.total, 1);
    }

    #[test]
    fn unsent_confirmation_does_not_fail_the_order() {
        let runtime = runtime();
        let order = Order {
            order_id: "o-quiet".to_string(),
            sku: "widget".to_string(),
            quantity: 1,
            amount_cents: 1_000,
            email: None,
        };

        let result = runtime
            .orchestrator()
            .execute(&order_saga(&runtime, &order).unwrap())
            .unwrap();
        assert_eq!(result.status, SagaStatus::Completed);
        assert_eq!(result.context.get("tracking_number"), Some(&json!("trk-o-quiet")));
        assert_eq!(result.context.get("notification"), Some(&json!("deferred")));
        assert!(!result.context.contains_key("reservation_released"));

        let queue = runtime.queue().clone();
        runtime.shutdown();
        assert_eq!(queue.dead_letters().summary(NOTIFY_QUEUE).unwrap().total, 1);
    }
}
