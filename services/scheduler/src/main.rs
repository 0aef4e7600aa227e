//! mlsched scheduler
//!
//! Runs the scheduling engine against a stream of desired-state events. On
//! startup it can replay a JSON-lines event file; dispatch commands are
//! logged for an external dispatcher to pick up.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use mlsched_events::{DesiredStateEvent, DispatchCommand};
use mlsched_scheduler::{
    config::Config,
    experiment::ExperimentStore,
    reconciler::EventReconciler,
    store::ModelServerStore,
    worker::{SchedulerWorker, WorkerConfig},
};
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const CHANNEL_CAPACITY: usize = 1024;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    // Initialize tracing (prefer RUST_LOG, fallback to MLSCHED_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting mlsched scheduler");
    info!(
        cluster_id = %config.cluster_id,
        max_load_retries = config.max_load_retries,
        metrics_level = %config.metrics_level,
        "Configuration loaded"
    );

    let store = Arc::new(ModelServerStore::new(config.store_config()));
    let experiments = Arc::new(ExperimentStore::new());
    let worker = SchedulerWorker::new(
        EventReconciler::new(Arc::clone(&store), experiments),
        WorkerConfig {
            reschedule_interval: config.reschedule_interval,
            usage_interval: config.usage_interval,
            metrics_level: config.metrics_level,
            cluster_id: config.cluster_id.clone(),
        },
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (event_tx, event_rx) = mpsc::channel(CHANNEL_CAPACITY);
    let (command_tx, command_rx) = mpsc::channel(CHANNEL_CAPACITY);

    let worker_handle = tokio::spawn(async move { worker.run(event_rx, command_tx, shutdown_rx).await });
    let dispatch_handle = tokio::spawn(log_dispatch(command_rx));

    if let Some(path) = &config.bootstrap_file {
        let events = load_events(path)
            .await
            .with_context(|| format!("failed to load bootstrap file {}", path.display()))?;
        info!(path = %path.display(), events = events.len(), "Replaying bootstrap events");
        for event in events {
            if event_tx.send(event).await.is_err() {
                error!("Scheduler worker exited during bootstrap");
                break;
            }
        }
    }

    tokio::signal::ctrl_c().await?;
    info!("Received shutdown signal");
    let _ = shutdown_tx.send(true);
    drop(event_tx);

    info!("Waiting for workers to shut down...");
    let shutdown_timeout = std::time::Duration::from_secs(10);
    match tokio::time::timeout(shutdown_timeout, worker_handle).await {
        Ok(Ok(stats)) => info!(
            events_applied = stats.events_applied,
            events_failed = stats.events_failed,
            "Scheduler worker exited"
        ),
        Ok(Err(e)) => error!(error = %e, "Scheduler worker panicked"),
        Err(_) => warn!("Scheduler worker did not shut down in time"),
    }
    if tokio::time::timeout(shutdown_timeout, dispatch_handle).await.is_err() {
        warn!("Dispatch logger did not shut down in time");
    }

    info!(models = store.model_count(), servers = store.server_count(), "Shutdown complete");
    Ok(())
}

/// Parse a JSON-lines file of events, skipping blank lines.
async fn load_events(path: &Path) -> Result<Vec<DesiredStateEvent>> {
    let contents = tokio::fs::read_to_string(path).await?;
    contents
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(number, line)| {
            DesiredStateEvent::from_json_line(line)
                .with_context(|| format!("line {}", number + 1))
        })
        .collect()
}

async fn log_dispatch(mut commands: mpsc::Receiver<DispatchCommand>) {
    while let Some(command) = commands.recv().await {
        match serde_json::to_string(&command) {
            Ok(json) => info!(
                model = command.model(),
                server = command.server(),
                command = %json,
                "Dispatch command"
            ),
            Err(e) => error!(error = %e, "Failed to encode dispatch command"),
        }
    }
}
