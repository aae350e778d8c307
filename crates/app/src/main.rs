use anyhow::Context;
use tracing::info;

use forgeflow_app::{AppConfig, Runtime, demo};
use forgeflow_observability::LogConfig;

fn main() -> anyhow::Result<()> {
    let config = AppConfig::from_env().context("invalid configuration")?;
    forgeflow_observability::init_with(&LogConfig::default().with_format(config.log_format));

    let mut runtime = Runtime::new(config).context("failed to start runtime")?;
    demo::install(&mut runtime)?;

    for order in demo::sample_orders() {
        let saga = demo::order_saga(&runtime, &order)?;
        let result = runtime
            .orchestrator()
            .execute(&saga)
            .with_context(|| format!("saga for order {} could not run", order.order_id))?;
        println!("{}", serde_json::to_string_pretty(&result)?);
    }

    let queue = runtime.queue().clone();
    let stats = runtime.shutdown();
    info!(
        processed = stats.processed,
        acked = stats.acked,
        requeued = stats.requeued,
        dead_lettered = stats.dead_lettered,
        "runtime stopped"
    );

    for queue_name in [
        demo::RESERVE_QUEUE,
        demo::CHARGE_QUEUE,
        demo::SHIP_QUEUE,
        demo::NOTIFY_QUEUE,
    ] {
        let summary = queue.dead_letters().summary(queue_name)?;
        if summary.total > 0 {
            println!("dead letters on {queue_name}: {}", serde_json::to_string(&summary)?);
        }
    }

    Ok(())
}
