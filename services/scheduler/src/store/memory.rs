//! In-memory model/server store.
//!
//! Models live in a sharded map of individually locked records, so updates to
//! unrelated models never contend. Servers live in one table behind a
//! read/write lock; placement takes it for writing so capacity checks and
//! reservations commit together.
//!
//! Lock order is always model record, then server table.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use mlsched_events::{DispatchCommand, ModelSpec, PlacementDecision, ReplicaStatusReport, ServerSpec};
use mlsched_reconcile::{
    GenerationCheckpoint, RetryBudget, SpecHash, DEFAULT_MAX_LOAD_RETRIES, DEFAULT_RETRY_WINDOW,
};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, instrument, warn};

use super::error::{StoreError, StoreResult};
use super::model::{ModelState, ModelVersion, ReplicaBounds};
use super::server::{Reservation, ServerRecord, ServerSnapshot};
use crate::filters::FilterPipeline;

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Load failures a replica may have before its model is `Failed`.
    pub max_load_retries: u32,
    pub retry_window: Duration,
    pub filters: FilterPipeline,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            max_load_retries: DEFAULT_MAX_LOAD_RETRIES,
            retry_window: DEFAULT_RETRY_WINDOW,
            filters: FilterPipeline::default(),
        }
    }
}

/// Result of a model mutation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModelChange {
    /// The model after the mutation.
    pub model: Option<ModelVersion>,
    /// Commands for the dispatch layer.
    pub commands: Vec<DispatchCommand>,
    /// The model finished draining and left the store.
    pub removed: bool,
}

/// What happened to one model when its placement was re-run.
#[derive(Debug)]
pub enum RescheduleOutcome {
    Placed(PlacementDecision),
    /// No eligible server; the model is now `Failed`.
    Unscheduled { model: String, error: StoreError },
    /// The model was already deleted and had nothing left to drain.
    Removed { model: String },
}

impl RescheduleOutcome {
    pub fn model(&self) -> &str {
        match self {
            Self::Placed(decision) => &decision.model,
            Self::Unscheduled { model, .. } | Self::Removed { model } => model,
        }
    }

    pub fn command(&self) -> Option<DispatchCommand> {
        match self {
            Self::Placed(decision) => Some(decision.clone().into()),
            _ => None,
        }
    }
}

#[derive(Debug)]
struct ModelRecord {
    model: Option<ModelVersion>,
    checkpoint: GenerationCheckpoint,
    spec_hash: Option<SpecHash>,
    load_retries: RetryBudget<u32>,
    /// Set once the record has left the map; holders must look it up again.
    removed: bool,
}

impl ModelRecord {
    fn new(config: &StoreConfig) -> Self {
        Self {
            model: None,
            checkpoint: GenerationCheckpoint::default(),
            spec_hash: None,
            load_retries: RetryBudget::new(config.max_load_retries, config.retry_window),
            removed: false,
        }
    }
}

/// Authoritative owner of model versions and servers.
pub struct ModelServerStore {
    config: StoreConfig,
    models: DashMap<String, Arc<Mutex<ModelRecord>>>,
    servers: RwLock<BTreeMap<String, ServerRecord>>,
    /// Last applied generation of models that left the store.
    model_tombstones: DashMap<String, GenerationCheckpoint>,
    /// Last applied generation of removed servers. Guarded by `servers`.
    server_tombstones: DashMap<String, GenerationCheckpoint>,
}

impl Default for ModelServerStore {
    fn default() -> Self {
        Self::new(StoreConfig::default())
    }
}

impl ModelServerStore {
    pub fn new(config: StoreConfig) -> Self {
        Self {
            config,
            models: DashMap::new(),
            servers: RwLock::new(BTreeMap::new()),
            model_tombstones: DashMap::new(),
            server_tombstones: DashMap::new(),
        }
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    // =========================================================================
    // Models
    // =========================================================================

    /// Create or update a model.
    ///
    /// An unchanged spec is a no-op. A changed spec becomes a new version:
    /// the previous version's replicas are unloaded and placement re-runs.
    /// A placement failure is recorded on the model, not returned.
    #[instrument(skip_all, fields(model = %spec.name, generation = generation))]
    pub fn upsert_model(&self, spec: ModelSpec, generation: i64) -> StoreResult<ModelChange> {
        validate_name("model", &spec.name)?;
        ReplicaBounds::from_scaling(&spec.name, &spec.scaling)?;
        let hash = SpecHash::of(&spec)?;
        let name = spec.name.clone();

        loop {
            let record = self.record_or_insert(&name);
            let mut guard = record.lock();
            if guard.removed {
                continue;
            }
            let rec = &mut *guard;

            let tombstone = match rec.model {
                None => self.model_tombstones.get(&name).map(|t| *t),
                Some(_) => None,
            };
            if let Some(tombstone) = tombstone.filter(|t| !t.is_newer(generation)) {
                let err = StoreError::stale(
                    &name,
                    format!(
                        "generation {} not newer than deletion at {}",
                        generation,
                        tombstone.last_applied()
                    ),
                );
                self.discard_if_empty(&name, &record, rec);
                return Err(err);
            }

            if rec.checkpoint.is_stale(generation) {
                let err = StoreError::stale(
                    &name,
                    format!(
                        "generation {} older than applied {}",
                        generation,
                        rec.checkpoint.last_applied()
                    ),
                );
                self.discard_if_empty(&name, &record, rec);
                return Err(err);
            }

            if let Some(current) = &rec.model {
                if current.is_deleted() {
                    return Err(StoreError::ModelTerminating(name));
                }
                if rec.spec_hash.as_ref() == Some(&hash) {
                    rec.checkpoint.advance(generation);
                    debug!(version = current.version(), "Model spec unchanged");
                    return Ok(ModelChange {
                        model: Some(current.clone()),
                        ..Default::default()
                    });
                }
            }

            let version = rec.model.as_ref().map_or(1, |m| m.version() + 1);
            let mut model = ModelVersion::new(
                spec,
                version,
                None,
                BTreeMap::new(),
                false,
                ModelState::Progressing,
            )?;

            let mut commands = Vec::new();
            let placement = {
                let mut servers = self.servers.write();
                if let Some(previous) = rec.model.take() {
                    if let Some(unload) = release_previous(&previous, &mut servers) {
                        commands.push(unload);
                    }
                }
                self.place(&mut model, &mut servers)
            };

            match placement {
                Ok(Some(decision)) => {
                    info!(
                        version,
                        server = %decision.server,
                        replicas = decision.replicas.len(),
                        "Model placed"
                    );
                    commands.push(decision.into());
                }
                Ok(None) => info!(version, "Model scaled to zero"),
                Err(e) => warn!(version, error = %e, "Model unschedulable"),
            }

            rec.load_retries = RetryBudget::new(self.config.max_load_retries, self.config.retry_window);
            rec.spec_hash = Some(hash);
            rec.checkpoint.advance(generation);
            rec.model = Some(model.clone());
            self.model_tombstones.remove(&name);

            return Ok(ModelChange {
                model: Some(model),
                commands,
                removed: false,
            });
        }
    }

    /// Delete a model.
    ///
    /// Live replicas move to `Draining` and are unloaded; the model leaves the
    /// store once every replica is terminal. Deleting a model that is already
    /// terminating is a no-op.
    #[instrument(skip(self))]
    pub fn delete_model(&self, name: &str, generation: i64) -> StoreResult<ModelChange> {
        let record = self
            .record(name)
            .ok_or_else(|| StoreError::ModelNotFound(name.to_string()))?;
        let mut guard = record.lock();
        let rec = &mut *guard;
        if rec.removed {
            return Err(StoreError::ModelNotFound(name.to_string()));
        }

        if rec.checkpoint.is_stale(generation) {
            return Err(StoreError::stale(
                name,
                format!(
                    "generation {} older than applied {}",
                    generation,
                    rec.checkpoint.last_applied()
                ),
            ));
        }

        let Some(model) = rec.model.as_mut() else {
            return Err(StoreError::ModelNotFound(name.to_string()));
        };
        rec.checkpoint.advance(generation);

        if model.is_deleted() {
            debug!("Model already terminating");
            return Ok(ModelChange {
                model: Some(model.clone()),
                ..Default::default()
            });
        }

        let draining = model.begin_termination();
        let mut commands = Vec::new();
        if let Some(server) = model.server() {
            if !draining.is_empty() {
                commands.push(DispatchCommand::UnloadModel {
                    model: name.to_string(),
                    version: model.version(),
                    server: server.to_string(),
                    replicas: draining.clone(),
                });
            }
        }
        info!(version = model.version(), draining = draining.len(), "Model terminating");

        let snapshot = model.clone();
        let removed = snapshot.is_drained();
        if removed {
            self.remove_record(name, &record, rec);
        }

        Ok(ModelChange {
            model: Some(snapshot),
            commands,
            removed,
        })
    }

    /// Apply an agent's replica status report.
    ///
    /// A load failure within budget yields a retry load command. A deleted
    /// model whose last replica reaches a terminal state is removed.
    #[instrument(skip_all, fields(model = %report.model, replica = report.replica, state = %report.state))]
    pub fn update_replica_status(&self, report: &ReplicaStatusReport) -> StoreResult<ModelChange> {
        let record = self
            .record(&report.model)
            .ok_or_else(|| StoreError::ModelNotFound(report.model.clone()))?;
        let mut guard = record.lock();
        let rec = &mut *guard;
        if rec.removed {
            return Err(StoreError::ModelNotFound(report.model.clone()));
        }
        let Some(model) = rec.model.as_mut() else {
            return Err(StoreError::ModelNotFound(report.model.clone()));
        };

        let previous_state = model.state();
        let transition = model.apply_report(report, &mut rec.load_retries)?;
        if transition.from != transition.to {
            debug!(from = %transition.from, to = %transition.to, "Replica transition applied");
        }

        let mut commands = Vec::new();
        if transition.retry_load {
            if let Some(server) = model.server() {
                info!(
                    failures = rec.load_retries.failures(&report.replica),
                    "Retrying replica load"
                );
                commands.push(DispatchCommand::LoadModel {
                    model: report.model.clone(),
                    version: model.version(),
                    server: server.to_string(),
                    replicas: vec![report.replica],
                });
            }
        }

        if model.state() != previous_state {
            match model.state() {
                ModelState::Failed => warn!(
                    reason = model.state_reason().unwrap_or_default(),
                    "Model failed"
                ),
                state => info!(state = %state, "Model state changed"),
            }
        }

        let snapshot = model.clone();
        let removed = snapshot.is_drained();
        if removed {
            info!("Model drained, removing");
            self.remove_record(&report.model, &record, rec);
        }

        Ok(ModelChange {
            model: Some(snapshot),
            commands,
            removed,
        })
    }

    pub fn get_model(&self, name: &str) -> StoreResult<ModelVersion> {
        self.record(name)
            .and_then(|record| current_model(&record))
            .ok_or_else(|| StoreError::ModelNotFound(name.to_string()))
    }

    /// All models, sorted by name.
    pub fn list_models(&self) -> Vec<ModelVersion> {
        let mut models: Vec<ModelVersion> = self
            .records()
            .into_iter()
            .filter_map(|record| current_model(&record))
            .collect();
        models.sort_by(|a, b| a.name().cmp(b.name()));
        models
    }

    /// Models assigned to `server`, sorted by name.
    pub fn list_models_for_server(&self, server: &str) -> StoreResult<Vec<ModelVersion>> {
        let names: Vec<String> = {
            let servers = self.servers.read();
            let record = servers
                .get(server)
                .ok_or_else(|| StoreError::ServerNotFound(server.to_string()))?;
            record.models().cloned().collect()
        };

        Ok(names
            .iter()
            .filter_map(|name| self.get_model(name).ok())
            .filter(|model| model.server() == Some(server))
            .collect())
    }

    pub fn model_count(&self) -> usize {
        self.list_models().len()
    }

    // =========================================================================
    // Servers
    // =========================================================================

    /// Register a server or update its capacity.
    ///
    /// Shrinking a server does not evict models already placed on it.
    #[instrument(skip_all, fields(server = %spec.name, generation = generation))]
    pub fn upsert_server(&self, spec: ServerSpec, generation: i64) -> StoreResult<ServerSnapshot> {
        validate_name("server", &spec.name)?;

        let mut servers = self.servers.write();
        let snapshot = match servers.get_mut(&spec.name) {
            Some(record) => {
                if record.checkpoint.is_stale(generation) {
                    return Err(StoreError::stale(
                        &spec.name,
                        format!(
                            "generation {} older than applied {}",
                            generation,
                            record.checkpoint.last_applied()
                        ),
                    ));
                }
                record.spec = spec;
                record.checkpoint.advance(generation);
                record.snapshot()
            }
            None => {
                if let Some(tombstone) = self
                    .server_tombstones
                    .get(&spec.name)
                    .map(|t| *t)
                    .filter(|t| !t.is_newer(generation))
                {
                    return Err(StoreError::stale(
                        &spec.name,
                        format!(
                            "generation {} not newer than removal at {}",
                            generation,
                            tombstone.last_applied()
                        ),
                    ));
                }
                self.server_tombstones.remove(&spec.name);
                let record = ServerRecord::new(spec, generation);
                let snapshot = record.snapshot();
                servers.insert(snapshot.name.clone(), record);
                snapshot
            }
        };

        info!(
            memory_bytes = snapshot.total_memory_bytes,
            replica_slots = snapshot.replica_slots,
            shared = snapshot.shared,
            "Server registered"
        );
        Ok(snapshot)
    }

    /// Remove a server and re-place every model it hosted.
    ///
    /// Each model is handled on its own: one that finds no eligible server is
    /// marked `Failed` without affecting the others.
    #[instrument(skip(self))]
    pub fn remove_server(&self, name: &str, generation: i64) -> StoreResult<Vec<RescheduleOutcome>> {
        let affected: Vec<String> = {
            let mut servers = self.servers.write();
            let record = servers
                .get(name)
                .ok_or_else(|| StoreError::ServerNotFound(name.to_string()))?;
            if record.checkpoint.is_stale(generation) {
                return Err(StoreError::stale(
                    name,
                    format!(
                        "generation {} older than applied {}",
                        generation,
                        record.checkpoint.last_applied()
                    ),
                ));
            }
            let affected: Vec<String> = record.models().cloned().collect();
            let mut checkpoint = record.checkpoint;
            checkpoint.advance(generation);
            self.server_tombstones.insert(name.to_string(), checkpoint);
            servers.remove(name);
            affected
        };

        info!(models = affected.len(), "Server removed, rescheduling models");

        let outcomes: Vec<RescheduleOutcome> = affected
            .iter()
            .filter_map(|model| self.reschedule_from(model, name))
            .collect();
        Ok(outcomes)
    }

    pub fn get_server(&self, name: &str) -> StoreResult<ServerSnapshot> {
        self.servers
            .read()
            .get(name)
            .map(ServerRecord::snapshot)
            .ok_or_else(|| StoreError::ServerNotFound(name.to_string()))
    }

    /// Snapshots of every server, sorted by name.
    pub fn server_snapshots(&self) -> Vec<ServerSnapshot> {
        self.servers.read().values().map(ServerRecord::snapshot).collect()
    }

    pub fn server_count(&self) -> usize {
        self.servers.read().len()
    }

    // =========================================================================
    // Rescheduling
    // =========================================================================

    /// Retry placement of every model that previously found no server.
    #[instrument(skip(self))]
    pub fn reschedule_failed(&self) -> Vec<RescheduleOutcome> {
        let mut names: Vec<String> = self.models.iter().map(|e| e.key().clone()).collect();
        names.sort();

        let mut outcomes = Vec::new();
        for name in names {
            let Some(record) = self.record(&name) else {
                continue;
            };
            let mut guard = record.lock();
            let rec = &mut *guard;
            if rec.removed {
                continue;
            }
            let Some(model) = rec.model.as_mut() else {
                continue;
            };
            if !model.is_unscheduled() {
                continue;
            }

            let placement = {
                let mut servers = self.servers.write();
                self.place(model, &mut servers)
            };
            match placement {
                Ok(Some(decision)) => {
                    info!(model = %name, server = %decision.server, "Failed model placed");
                    outcomes.push(RescheduleOutcome::Placed(decision));
                }
                Ok(None) => {}
                Err(error) => {
                    debug!(model = %name, error = %error, "Model still unschedulable");
                    outcomes.push(RescheduleOutcome::Unscheduled { model: name, error });
                }
            }
        }
        outcomes
    }

    /// Re-place `name` after `lost_server` went away.
    fn reschedule_from(&self, name: &str, lost_server: &str) -> Option<RescheduleOutcome> {
        let record = self.record(name)?;
        let mut guard = record.lock();
        let rec = &mut *guard;
        if rec.removed {
            return None;
        }
        let model = rec.model.as_mut()?;
        if model.server() != Some(lost_server) {
            return None;
        }

        model.mark_replicas_unloaded("server removed");
        if model.is_deleted() {
            info!(model = %name, "Deleted model lost its server, removing");
            self.remove_record(name, &record, rec);
            return Some(RescheduleOutcome::Removed {
                model: name.to_string(),
            });
        }

        rec.load_retries = RetryBudget::new(self.config.max_load_retries, self.config.retry_window);
        let placement = {
            let mut servers = self.servers.write();
            self.place(model, &mut servers)
        };

        match placement {
            Ok(Some(decision)) => {
                info!(model = %name, server = %decision.server, "Model rescheduled");
                Some(RescheduleOutcome::Placed(decision))
            }
            Ok(None) => None,
            Err(error) => {
                warn!(model = %name, error = %error, "Model unschedulable after server removal");
                Some(RescheduleOutcome::Unscheduled {
                    model: name.to_string(),
                    error,
                })
            }
        }
    }

    /// Pick a server for `model` and reserve its capacity.
    ///
    /// On failure the model is marked `Failed` with the filters' explanation.
    fn place(
        &self,
        model: &mut ModelVersion,
        servers: &mut BTreeMap<String, ServerRecord>,
    ) -> StoreResult<Option<PlacementDecision>> {
        let replicas = model.desired_replicas();
        if replicas == 0 {
            model.assign_none();
            return Ok(None);
        }

        let snapshots: Vec<ServerSnapshot> = servers.values().map(ServerRecord::snapshot).collect();
        let chosen = self
            .config
            .filters
            .eligible(model, &snapshots)
            .first()
            .map(|server| server.name.clone());

        let Some(server) = chosen.filter(|name| servers.contains_key(name)) else {
            let reason = self.config.filters.explain(model, &snapshots);
            model.mark_unschedulable(reason.clone());
            return Err(StoreError::CapacityExhausted {
                model: model.name().to_string(),
                reason,
            });
        };

        if let Some(record) = servers.get_mut(&server) {
            record.reserve(
                model.name(),
                Reservation {
                    version: model.version(),
                    replicas,
                    memory_bytes: model.memory_bytes().saturating_mul(u64::from(replicas)),
                },
            );
        }
        model.assign(server.clone(), replicas);

        Ok(Some(PlacementDecision {
            model: model.name().to_string(),
            version: model.version(),
            server,
            replicas: (0..replicas).collect(),
        }))
    }

    // =========================================================================
    // Records
    // =========================================================================

    fn record(&self, name: &str) -> Option<Arc<Mutex<ModelRecord>>> {
        self.models.get(name).map(|entry| Arc::clone(entry.value()))
    }

    fn record_or_insert(&self, name: &str) -> Arc<Mutex<ModelRecord>> {
        Arc::clone(
            self.models
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(ModelRecord::new(&self.config))))
                .value(),
        )
    }

    fn records(&self) -> Vec<Arc<Mutex<ModelRecord>>> {
        self.models.iter().map(|entry| Arc::clone(entry.value())).collect()
    }

    /// Release the model's capacity and drop its record. Caller holds the record lock.
    fn remove_record(&self, name: &str, record: &Arc<Mutex<ModelRecord>>, rec: &mut ModelRecord) {
        if let Some(server) = rec.model.as_ref().and_then(|m| m.server()) {
            if let Some(server) = self.servers.write().get_mut(server) {
                server.release(name);
            }
        }
        rec.model = None;
        rec.removed = true;
        self.model_tombstones.insert(name.to_string(), rec.checkpoint);
        self.models.remove_if(name, |_, current| Arc::ptr_eq(current, record));
    }

    fn discard_if_empty(&self, name: &str, record: &Arc<Mutex<ModelRecord>>, rec: &mut ModelRecord) {
        if rec.model.is_none() {
            rec.removed = true;
            self.models.remove_if(name, |_, current| Arc::ptr_eq(current, record));
        }
    }
}

fn current_model(record: &Mutex<ModelRecord>) -> Option<ModelVersion> {
    record.lock().model.clone()
}

/// Release the previous version's capacity and unload its live replicas.
fn release_previous(
    previous: &ModelVersion,
    servers: &mut BTreeMap<String, ServerRecord>,
) -> Option<DispatchCommand> {
    let server = previous.server()?;
    if let Some(record) = servers.get_mut(server) {
        record.release(previous.name());
    }

    let live = previous.live_replicas();
    if live.is_empty() {
        return None;
    }
    Some(DispatchCommand::UnloadModel {
        model: previous.name().to_string(),
        version: previous.version(),
        server: server.to_string(),
        replicas: live,
    })
}

fn validate_name(resource: &'static str, name: &str) -> StoreResult<()> {
    if name.trim().is_empty() {
        return Err(StoreError::Invalid {
            resource,
            message: "name must not be empty".to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use mlsched_events::ReplicaState;

    use super::*;

    fn server(name: &str, memory_bytes: u64, slots: u32) -> ServerSpec {
        ServerSpec {
            name: name.to_string(),
            memory_bytes,
            replica_slots: slots,
            shared: true,
            capabilities: vec![],
        }
    }

    fn model(name: &str, replicas: u32, memory_bytes: u64) -> ModelSpec {
        let mut spec = ModelSpec::new(name);
        spec.memory_bytes = memory_bytes;
        spec.scaling.replicas = Some(replicas);
        spec
    }

    fn report(model: &ModelVersion, replica: u32, state: ReplicaState, generation: i64) -> ReplicaStatusReport {
        ReplicaStatusReport {
            model: model.name().to_string(),
            version: model.version(),
            replica,
            server: model.server().unwrap_or_default().to_string(),
            state,
            reason: None,
            generation,
            reported_at: Utc::now(),
        }
    }

    #[test]
    fn test_upsert_places_and_reserves() {
        let store = ModelServerStore::default();
        store.upsert_server(server("mlserver", 1_000, 4), 1).unwrap();

        let change = store.upsert_model(model("iris", 2, 100), 1).unwrap();
        let placed = change.model.unwrap();
        assert_eq!(placed.version(), 1);
        assert_eq!(placed.server(), Some("mlserver"));
        assert_eq!(placed.replicas().len(), 2);
        assert_eq!(
            change.commands,
            vec![DispatchCommand::LoadModel {
                model: "iris".to_string(),
                version: 1,
                server: "mlserver".to_string(),
                replicas: vec![0, 1],
            }]
        );

        let snapshot = store.get_server("mlserver").unwrap();
        assert_eq!(snapshot.available_memory_bytes, 800);
        assert_eq!(snapshot.free_replica_slots, 2);
    }

    #[test]
    fn test_unchanged_spec_is_noop() {
        let store = ModelServerStore::default();
        store.upsert_server(server("mlserver", 1_000, 4), 1).unwrap();
        store.upsert_model(model("iris", 1, 100), 1).unwrap();

        let change = store.upsert_model(model("iris", 1, 100), 2).unwrap();
        assert!(change.commands.is_empty());
        assert_eq!(change.model.unwrap().version(), 1);
    }

    #[test]
    fn test_changed_spec_bumps_version_and_unloads_previous() {
        let store = ModelServerStore::default();
        store.upsert_server(server("mlserver", 1_000, 4), 1).unwrap();
        store.upsert_model(model("iris", 2, 100), 1).unwrap();

        let change = store.upsert_model(model("iris", 1, 200), 2).unwrap();
        assert_eq!(change.model.as_ref().unwrap().version(), 2);
        assert!(matches!(
            &change.commands[0],
            DispatchCommand::UnloadModel { version: 1, replicas, .. } if replicas == &vec![0, 1]
        ));
        assert!(matches!(
            &change.commands[1],
            DispatchCommand::LoadModel { version: 2, .. }
        ));

        // Only the new version's reservation remains.
        assert_eq!(store.get_server("mlserver").unwrap().available_memory_bytes, 800);
    }

    #[test]
    fn test_stale_upsert_is_rejected() {
        let store = ModelServerStore::default();
        store.upsert_server(server("mlserver", 1_000, 4), 1).unwrap();
        store.upsert_model(model("iris", 1, 100), 5).unwrap();

        let err = store.upsert_model(model("iris", 2, 100), 4).unwrap_err();
        assert!(err.is_stale());
        assert_eq!(store.get_model("iris").unwrap().desired_replicas(), 1);
    }

    #[test]
    fn test_unschedulable_model_is_failed_then_placed_when_capacity_joins() {
        let store = ModelServerStore::default();
        let change = store.upsert_model(model("iris", 1, 100), 1).unwrap();
        let failed = change.model.unwrap();
        assert_eq!(failed.state(), ModelState::Failed);
        assert_eq!(failed.state_reason(), Some("no servers registered"));
        assert!(change.commands.is_empty());

        store.upsert_server(server("mlserver", 1_000, 4), 1).unwrap();
        let outcomes = store.reschedule_failed();
        assert_eq!(outcomes.len(), 1);
        assert!(matches!(&outcomes[0], RescheduleOutcome::Placed(d) if d.server == "mlserver"));
        assert_eq!(store.get_model("iris").unwrap().state(), ModelState::Progressing);
    }

    #[test]
    fn test_delete_drains_then_removes() {
        let store = ModelServerStore::default();
        store.upsert_server(server("mlserver", 1_000, 4), 1).unwrap();
        let placed = store.upsert_model(model("iris", 1, 100), 1).unwrap().model.unwrap();
        store
            .update_replica_status(&report(&placed, 0, ReplicaState::Available, 1))
            .unwrap();

        let change = store.delete_model("iris", 2).unwrap();
        assert!(!change.removed);
        assert_eq!(change.model.as_ref().unwrap().state(), ModelState::Terminating);
        assert!(matches!(&change.commands[0], DispatchCommand::UnloadModel { .. }));

        // Repeated delete is a no-op.
        let again = store.delete_model("iris", 2).unwrap();
        assert!(again.commands.is_empty());

        let change = store
            .update_replica_status(&report(&placed, 0, ReplicaState::Unloaded, 2))
            .unwrap();
        assert!(change.removed);
        assert!(store.get_model("iris").unwrap_err().is_not_found());
        assert_eq!(store.get_server("mlserver").unwrap().available_memory_bytes, 1_000);
    }

    #[test]
    fn test_delete_without_live_replicas_removes_immediately() {
        let store = ModelServerStore::default();
        store.upsert_model(model("iris", 1, 100), 1).unwrap();

        let change = store.delete_model("iris", 2).unwrap();
        assert!(change.removed);
        assert!(store.delete_model("iris", 3).unwrap_err().is_not_found());
    }

    #[test]
    fn test_load_failure_retries_then_fails() {
        let store = ModelServerStore::new(StoreConfig {
            max_load_retries: 1,
            ..Default::default()
        });
        store.upsert_server(server("mlserver", 1_000, 4), 1).unwrap();
        let placed = store.upsert_model(model("iris", 1, 100), 1).unwrap().model.unwrap();

        let first = store
            .update_replica_status(&report(&placed, 0, ReplicaState::LoadingFailed, 1))
            .unwrap();
        assert_eq!(first.commands.len(), 1);
        assert_eq!(first.model.unwrap().state(), ModelState::Progressing);

        let second = store
            .update_replica_status(&report(&placed, 0, ReplicaState::LoadingFailed, 2))
            .unwrap();
        assert!(second.commands.is_empty());
        assert_eq!(second.model.unwrap().state(), ModelState::Failed);
    }

    #[test]
    fn test_report_from_wrong_server_is_stale() {
        let store = ModelServerStore::default();
        store.upsert_server(server("mlserver", 1_000, 4), 1).unwrap();
        let placed = store.upsert_model(model("iris", 1, 100), 1).unwrap().model.unwrap();

        let mut stray = report(&placed, 0, ReplicaState::Available, 1);
        stray.server = "triton".to_string();
        assert!(store.update_replica_status(&stray).unwrap_err().is_stale());
    }

    #[test]
    fn test_empty_names_are_rejected() {
        let store = ModelServerStore::default();
        assert!(store.upsert_model(ModelSpec::new(""), 1).unwrap_err().is_validation());
        assert!(store
            .upsert_server(server(" ", 1_000, 1), 1)
            .unwrap_err()
            .is_validation());
        assert_eq!(store.model_count(), 0);
    }
}
