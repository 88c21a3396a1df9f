mod cli;
mod demo;
mod handlers;
mod logging;

use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use shuttle_core::{WorkerBuilder, WorkerConfig, WorkerReport};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::cli::Cli;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    if let Err(e) = logging::logger_init(&cli.logger_config()) {
        eprintln!("{e}");
        return ExitCode::FAILURE;
    }

    match run(cli).await {
        Ok(report) => {
            info!(
                worker_id = %report.worker_id,
                stats = %serde_json::to_string(&report.stats).unwrap_or_default(),
                aborted = report.aborted,
                "worker stopped gracefully"
            );
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %format!("{e:#}"), "worker stopped due to an error");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<WorkerReport> {
    let mut config =
        WorkerConfig::load(cli.config.as_deref()).context("loading configuration")?;
    cli.apply(&mut config);
    config.validate().context("invalid configuration")?;

    if cli.demo {
        info!("running against the in-memory demo engine");
        return demo::run(config).await;
    }

    let base_url = config.base_url.clone();
    let worker = handlers::register(WorkerBuilder::connect(config)?)
        .build()
        .context("building worker")?;
    info!(
        worker_id = %worker.worker_id(),
        %base_url,
        topics = ?worker.topics(),
        "starting external task worker"
    );
    worker
        .check_engine()
        .await
        .with_context(|| format!("engine at {base_url} is not reachable"))?;

    let shutdown = CancellationToken::new();
    let trigger = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        trigger.cancel();
    });
    info!("press Ctrl+C to stop the worker");
    Ok(worker.run(shutdown).await)
}

/// Resolves on Ctrl+C or SIGTERM.
pub(crate) async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "cannot listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received Ctrl+C, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}
