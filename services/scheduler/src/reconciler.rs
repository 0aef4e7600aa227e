//! Applies desired-state events to the store.
//!
//! The reconciler is responsible for:
//! - Routing each event to the matching store operation
//! - Collecting the dispatch commands the store decided on
//! - Dropping stale events with a debug log
//! - Retrying placement of failed models when capacity may have changed

use std::sync::Arc;

use mlsched_events::{DesiredStateEvent, DispatchCommand};
use tracing::{debug, info, instrument, warn};

use crate::experiment::ExperimentStore;
use crate::store::{ModelServerStore, RescheduleOutcome, StoreResult};

/// Counters from applying a batch of events.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileStats {
    pub events_applied: u64,
    pub events_stale: u64,
    pub events_failed: u64,
    pub commands_emitted: u64,
}

pub struct EventReconciler {
    store: Arc<ModelServerStore>,
    experiments: Arc<ExperimentStore>,
}

impl EventReconciler {
    pub fn new(store: Arc<ModelServerStore>, experiments: Arc<ExperimentStore>) -> Self {
        Self { store, experiments }
    }

    pub fn store(&self) -> &Arc<ModelServerStore> {
        &self.store
    }

    pub fn experiments(&self) -> &Arc<ExperimentStore> {
        &self.experiments
    }

    /// Apply one event, returning the resulting dispatch commands.
    pub fn apply(&self, event: DesiredStateEvent) -> StoreResult<Vec<DispatchCommand>> {
        match event {
            DesiredStateEvent::ModelUpserted { model, generation } => {
                Ok(self.store.upsert_model(model, generation)?.commands)
            }
            DesiredStateEvent::ModelDeleted { name, generation } => {
                let change = self.store.delete_model(&name, generation)?;
                let referencing = self.experiments.experiments_referencing(&name);
                if !referencing.is_empty() {
                    info!(
                        model = %name,
                        experiments = ?referencing,
                        "Deleted model is still referenced by experiments"
                    );
                }
                Ok(change.commands)
            }
            DesiredStateEvent::ServerUpserted { server, generation } => {
                self.store.upsert_server(server, generation)?;
                Ok(self.reschedule_failed())
            }
            DesiredStateEvent::ServerRemoved { name, generation } => {
                let outcomes = self.store.remove_server(&name, generation)?;
                Ok(commands_from(&outcomes))
            }
            DesiredStateEvent::ReplicaStatusReported { report } => {
                Ok(self.store.update_replica_status(&report)?.commands)
            }
        }
    }

    /// Apply one event, logging instead of returning failures.
    pub fn handle(&self, event: DesiredStateEvent, stats: &mut ReconcileStats) -> Vec<DispatchCommand> {
        let event_type = event.event_type();
        let resource = event.resource_name().to_string();
        let generation = event.generation();

        match self.apply(event) {
            Ok(commands) => {
                stats.events_applied += 1;
                stats.commands_emitted += commands.len() as u64;
                commands
            }
            Err(e) if e.is_stale() => {
                stats.events_stale += 1;
                debug!(event_type, resource = %resource, generation, error = %e, "Dropped stale event");
                Vec::new()
            }
            Err(e) => {
                stats.events_failed += 1;
                warn!(
                    event_type,
                    resource = %resource,
                    generation,
                    kind = %e.kind(),
                    error = %e,
                    "Failed to apply event"
                );
                Vec::new()
            }
        }
    }

    /// Apply events in order.
    #[instrument(skip_all)]
    pub fn apply_all(
        &self,
        events: impl IntoIterator<Item = DesiredStateEvent>,
    ) -> (Vec<DispatchCommand>, ReconcileStats) {
        let mut stats = ReconcileStats::default();
        let mut commands = Vec::new();
        for event in events {
            commands.extend(self.handle(event, &mut stats));
        }

        info!(
            events_applied = stats.events_applied,
            events_stale = stats.events_stale,
            events_failed = stats.events_failed,
            commands_emitted = stats.commands_emitted,
            "Event batch applied"
        );
        (commands, stats)
    }

    /// Retry placement of models that found no server earlier.
    pub fn reschedule_failed(&self) -> Vec<DispatchCommand> {
        commands_from(&self.store.reschedule_failed())
    }
}

fn commands_from(outcomes: &[RescheduleOutcome]) -> Vec<DispatchCommand> {
    outcomes.iter().filter_map(RescheduleOutcome::command).collect()
}
