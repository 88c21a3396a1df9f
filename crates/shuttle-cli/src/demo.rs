//! `--demo`: run the bundled handlers against an in-process engine.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use shuttle_core::impls::{InMemoryEngine, NewTask};
use shuttle_core::{WorkerBuilder, WorkerConfig, WorkerReport};
use tracing::{info, warn};

use crate::handlers::{self, PAYMENT_TOPIC};

const SETTLE_TIMEOUT: Duration = Duration::from_secs(60);

/// `(amount, customerId)`; the last two are rejected by the handler.
const SAMPLES: &[(f64, Option<&str>)] = &[
    (150.75, Some("C-1001")),
    (42.0, Some("C-1002")),
    (980.10, Some("C-1003")),
    (-10.0, Some("C-1004")),
    (25.0, None),
];

pub async fn run(config: WorkerConfig) -> anyhow::Result<WorkerReport> {
    let engine = Arc::new(InMemoryEngine::new());
    let mut ids = Vec::with_capacity(SAMPLES.len());
    for (n, (amount, customer)) in SAMPLES.iter().enumerate() {
        let mut task = NewTask::new(PAYMENT_TOPIC)
            .with_variable("amount", *amount)
            .with_business_key(format!("order-{}", n + 1));
        if let Some(customer) = customer {
            task = task.with_variable("customerId", *customer);
        }
        ids.push(engine.add(task).await);
    }
    info!(tasks = ids.len(), "demo engine seeded");

    let worker = handlers::register(WorkerBuilder::new(config).client(engine.clone()))
        .build()
        .context("building demo worker")?;
    let handle = worker.start();

    tokio::select! {
        settled = engine.wait_until_settled(SETTLE_TIMEOUT) => {
            if !settled {
                warn!(open = engine.open_count().await, "demo tasks did not settle in time");
            }
        }
        _ = crate::shutdown_signal() => {}
    }
    let report = handle.shutdown_and_join().await?;

    for id in &ids {
        if let Some(snapshot) = engine.snapshot(id).await {
            info!(
                task_id = %id,
                status = ?snapshot.status,
                variables = ?snapshot.variables,
                "demo task"
            );
        }
    }
    Ok(report)
}
