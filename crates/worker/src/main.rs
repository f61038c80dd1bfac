use std::sync::Arc;

use anyhow::Context;
use fishsense_pipeline::{default_registries, PostgresBroker, TaskQueue, WorkflowClient, TASK_QUEUE};
use fishsense_worker::{connect, logging, schedule_workflows, Worker, WorkerConfig};
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    // Logging needs the configured directory, so config errors go to stderr.
    let config = match WorkerConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("invalid worker configuration: {e}");
            std::process::exit(1);
        }
    };
    let guard = match logging::init(&config.log_dir) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("failed to initialise logging: {e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = run(config).await {
        tracing::error!(error = format!("{e:#}"), "Worker failed to start");
        drop(guard);
        std::process::exit(1);
    }
}

async fn run(config: WorkerConfig) -> anyhow::Result<()> {
    tracing::debug!(?config, "Loaded worker configuration");

    let pool = connect(&config).await.context("failed to connect to broker")?;
    fishsense_db::run_migrations(&pool)
        .await
        .context("failed to run database migrations")?;

    let broker: Arc<dyn TaskQueue> = Arc::new(PostgresBroker::new(pool));
    let client = WorkflowClient::new(broker.clone(), TASK_QUEUE);
    schedule_workflows(&client)
        .await
        .context("failed to register workflow schedules")?;

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            shutdown_signal().await;
            shutdown.cancel();
        }
    });

    let (workflows, activities) = default_registries();
    Worker::new(broker, TASK_QUEUE, workflows, activities, config.max_workers)
        .run(shutdown)
        .await;
    Ok(())
}

/// Wait for Ctrl-C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("Shutdown signal received");
}
