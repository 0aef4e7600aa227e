//! Scheduler background worker.
//!
//! Consumes desired-state events, forwards the resulting dispatch commands,
//! periodically retries unschedulable models and logs a usage summary.

use std::time::Duration;

use mlsched_events::{DesiredStateEvent, DispatchCommand};
use mlsched_reconcile::DEFAULT_RESCHEDULE_INTERVAL;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, instrument, warn};

use crate::reconciler::{EventReconciler, ReconcileStats};
use crate::usage::{MetricsLevel, UsageSummary};

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub reschedule_interval: Duration,
    pub usage_interval: Duration,
    pub metrics_level: MetricsLevel,
    pub cluster_id: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            reschedule_interval: DEFAULT_RESCHEDULE_INTERVAL,
            usage_interval: Duration::from_secs(3600),
            metrics_level: MetricsLevel::default(),
            cluster_id: "default".to_string(),
        }
    }
}

pub struct SchedulerWorker {
    reconciler: EventReconciler,
    config: WorkerConfig,
}

impl SchedulerWorker {
    pub fn new(reconciler: EventReconciler, config: WorkerConfig) -> Self {
        Self { reconciler, config }
    }

    /// Run until shutdown is signaled or either channel closes.
    #[instrument(skip_all)]
    pub async fn run(
        &self,
        mut events: mpsc::Receiver<DesiredStateEvent>,
        commands: mpsc::Sender<DispatchCommand>,
        mut shutdown: watch::Receiver<bool>,
    ) -> ReconcileStats {
        info!(
            reschedule_interval_secs = self.config.reschedule_interval.as_secs(),
            usage_interval_secs = self.config.usage_interval.as_secs(),
            "Starting scheduler worker"
        );

        let mut reschedule = tokio::time::interval(self.config.reschedule_interval);
        let mut usage = tokio::time::interval(self.config.usage_interval);
        // Skip the immediate first ticks
        reschedule.tick().await;
        usage.tick().await;

        let mut stats = ReconcileStats::default();
        loop {
            tokio::select! {
                event = events.recv() => {
                    let Some(event) = event else {
                        info!("Event channel closed");
                        break;
                    };
                    let out = self.reconciler.handle(event, &mut stats);
                    if !forward(&commands, out).await {
                        break;
                    }
                }
                _ = reschedule.tick() => {
                    let out = self.reconciler.reschedule_failed();
                    if !out.is_empty() {
                        info!(placed = out.len(), "Placed previously unschedulable models");
                    }
                    stats.commands_emitted += out.len() as u64;
                    if !forward(&commands, out).await {
                        break;
                    }
                }
                _ = usage.tick() => self.report_usage(),
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Scheduler worker shutting down");
                        break;
                    }
                }
            }
        }

        info!(
            events_applied = stats.events_applied,
            events_stale = stats.events_stale,
            events_failed = stats.events_failed,
            commands_emitted = stats.commands_emitted,
            "Scheduler worker stopped"
        );
        stats
    }

    fn report_usage(&self) {
        let summary = UsageSummary::collect(
            &self.config.cluster_id,
            self.reconciler.store(),
            self.reconciler.experiments(),
        );
        match summary.to_properties(self.config.metrics_level) {
            Ok(properties) => {
                let properties = serde_json::Value::Object(properties);
                info!(
                    level = %self.config.metrics_level,
                    properties = %properties,
                    "Usage summary"
                );
            }
            Err(e) => error!(error = %e, "Failed to build usage summary"),
        }
    }
}

/// Send commands downstream. Returns false once the receiver is gone.
async fn forward(sink: &mpsc::Sender<DispatchCommand>, commands: Vec<DispatchCommand>) -> bool {
    for command in commands {
        debug!(model = command.model(), server = command.server(), "Dispatching command");
        if sink.send(command).await.is_err() {
            warn!("Dispatch channel closed");
            return false;
        }
    }
    true
}
