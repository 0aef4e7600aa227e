//! Model versions and the per-replica state machine.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use mlsched_events::{ModelSpec, ReplicaState, ReplicaStatusReport, ScalingSpec};
use mlsched_reconcile::RetryBudget;
use serde::{Deserialize, Serialize};

use super::error::{StoreError, StoreResult};

/// Coarse lifecycle of a model version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelState {
    /// Placed (or being placed) but not all desired replicas are available.
    Progressing,
    /// Every desired replica is available.
    Available,
    /// Unschedulable, or a replica exhausted its load retries.
    Failed,
    /// Deleted; replicas are draining.
    Terminating,
}

impl ModelState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Progressing => "progressing",
            Self::Available => "available",
            Self::Failed => "failed",
            Self::Terminating => "terminating",
        }
    }
}

impl std::fmt::Display for ModelState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Desired replica count bounds. Invariant: `min <= target <= max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaBounds {
    pub min: u32,
    pub target: u32,
    /// `None` is unbounded.
    pub max: Option<u32>,
}

impl ReplicaBounds {
    pub fn new(model: &str, min: u32, target: u32, max: Option<u32>) -> StoreResult<Self> {
        let invalid = |message: String| StoreError::InvalidReplicaBounds {
            model: model.to_string(),
            message,
        };

        if target < min {
            return Err(invalid(format!(
                "replicas {target} below min replicas {min}"
            )));
        }
        if let Some(max) = max {
            if target > max {
                return Err(invalid(format!(
                    "replicas {target} above max replicas {max}"
                )));
            }
        }

        Ok(Self { min, target, max })
    }

    /// Resolve submitted scaling settings.
    ///
    /// Target defaults to min if set, else 1. A max of zero is treated as unset.
    pub fn from_scaling(model: &str, scaling: &ScalingSpec) -> StoreResult<Self> {
        let min = scaling.min_replicas.unwrap_or(0);
        let max = scaling.max_replicas.filter(|max| *max > 0);
        let target = scaling.replicas.or(scaling.min_replicas).unwrap_or(1);
        Self::new(model, min, target, max)
    }
}

/// State of one replica of a model version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaStatus {
    pub state: ReplicaState,
    pub reason: Option<String>,
    /// Last transition time.
    pub timestamp: DateTime<Utc>,
    /// Generation of the last applied report.
    pub generation: i64,
    /// Load retries ran out. Cleared only by a report of a newer generation.
    #[serde(default)]
    pub exhausted: bool,
}

impl ReplicaStatus {
    pub fn new(state: ReplicaState) -> Self {
        Self {
            state,
            reason: None,
            timestamp: Utc::now(),
            generation: 0,
            exhausted: false,
        }
    }
}

/// Outcome of applying an agent report to a replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplicaTransition {
    pub replica: u32,
    pub from: ReplicaState,
    pub to: ReplicaState,
    /// The load failed but the replica still has retry budget left.
    pub retry_load: bool,
}

/// One versioned deployment of a named model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModelVersion {
    spec: ModelSpec,
    version: u32,
    bounds: ReplicaBounds,
    server: Option<String>,
    replicas: BTreeMap<u32, ReplicaStatus>,
    deleted: bool,
    state: ModelState,
    state_reason: Option<String>,
}

impl ModelVersion {
    /// Build a model version, validating its replica bounds.
    pub fn new(
        spec: ModelSpec,
        version: u32,
        server: Option<String>,
        replicas: BTreeMap<u32, ReplicaStatus>,
        deleted: bool,
        state: ModelState,
    ) -> StoreResult<Self> {
        let bounds = ReplicaBounds::from_scaling(&spec.name, &spec.scaling)?;
        Ok(Self {
            spec,
            version,
            bounds,
            server,
            replicas,
            deleted,
            state,
            state_reason: None,
        })
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn spec(&self) -> &ModelSpec {
        &self.spec
    }

    pub fn bounds(&self) -> ReplicaBounds {
        self.bounds
    }

    pub fn desired_replicas(&self) -> u32 {
        self.bounds.target
    }

    /// Server the model is assigned to, if scheduled.
    pub fn server(&self) -> Option<&str> {
        self.server.as_deref()
    }

    /// Server the model is explicitly pinned to, if any.
    pub fn pinned_server(&self) -> Option<&str> {
        self.spec.server.as_deref()
    }

    pub fn memory_bytes(&self) -> u64 {
        self.spec.memory_bytes
    }

    pub fn requirements(&self) -> &[String] {
        &self.spec.requirements
    }

    pub fn replicas(&self) -> &BTreeMap<u32, ReplicaStatus> {
        &self.replicas
    }

    pub fn replica(&self, index: u32) -> Option<&ReplicaStatus> {
        self.replicas.get(&index)
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted
    }

    pub fn state(&self) -> ModelState {
        self.state
    }

    pub fn state_reason(&self) -> Option<&str> {
        self.state_reason.as_deref()
    }

    /// Replicas counted toward the desired replica count.
    pub fn available_replicas(&self) -> u32 {
        self.replicas_in(ReplicaState::Available).len() as u32
    }

    pub fn replicas_in(&self, state: ReplicaState) -> Vec<u32> {
        self.replicas
            .iter()
            .filter(|(_, status)| status.state == state)
            .map(|(index, _)| *index)
            .collect()
    }

    /// Assign `replicas` fresh replicas on `server`.
    pub(crate) fn assign(&mut self, server: String, replicas: u32) {
        self.server = Some(server);
        self.replicas = (0..replicas)
            .map(|index| (index, ReplicaStatus::new(ReplicaState::Unknown)))
            .collect();
        self.state = if replicas == 0 {
            ModelState::Available
        } else {
            ModelState::Progressing
        };
        self.state_reason = None;
    }

    /// A model that scales to zero needs no server.
    pub(crate) fn assign_none(&mut self) {
        self.server = None;
        self.replicas.clear();
        self.state = ModelState::Available;
        self.state_reason = None;
    }

    pub(crate) fn mark_unschedulable(&mut self, reason: String) {
        self.server = None;
        self.replicas.clear();
        self.state = ModelState::Failed;
        self.state_reason = Some(reason);
    }

    /// Returns true if the model failed placement and holds no server.
    pub(crate) fn is_unscheduled(&self) -> bool {
        !self.deleted && self.server.is_none() && self.state == ModelState::Failed
    }

    /// Apply an agent report.
    ///
    /// Reports for another version or server, an unassigned replica, an older
    /// generation, or a backwards move within the same generation are stale.
    /// A terminating model only accepts reports that move replicas out.
    pub(crate) fn apply_report(
        &mut self,
        report: &ReplicaStatusReport,
        retries: &mut RetryBudget<u32>,
    ) -> StoreResult<ReplicaTransition> {
        let resource = format!("{}/{}", self.name(), report.replica);

        if report.version != self.version {
            return Err(StoreError::stale(
                resource,
                format!(
                    "report for version {} but current version is {}",
                    report.version, self.version
                ),
            ));
        }

        if self.server.as_deref() != Some(report.server.as_str()) {
            return Err(StoreError::stale(
                resource,
                format!(
                    "report from server {} but replica is assigned to {}",
                    report.server,
                    self.server.as_deref().unwrap_or("none")
                ),
            ));
        }

        let deleted = self.deleted;
        let Some(current) = self.replicas.get_mut(&report.replica) else {
            return Err(StoreError::stale(resource, "replica is not assigned"));
        };

        if report.generation < current.generation {
            return Err(StoreError::stale(
                resource,
                format!(
                    "generation {} older than applied {}",
                    report.generation, current.generation
                ),
            ));
        }

        let from = current.state;
        if report.generation == current.generation {
            if report.state == from {
                return Ok(ReplicaTransition {
                    replica: report.replica,
                    from,
                    to: from,
                    retry_load: false,
                });
            }
            if report.state.rank() < from.rank() {
                return Err(StoreError::stale(
                    resource,
                    format!("transition {} -> {} goes backwards", from, report.state),
                ));
            }
        }

        if deleted && !(report.state.is_removing() || report.state == ReplicaState::LoadingFailed)
        {
            return Err(StoreError::stale(
                resource,
                format!("model is terminating, ignoring {}", report.state),
            ));
        }

        if report.generation > current.generation {
            current.exhausted = false;
        }
        current.state = report.state;
        current.reason = report.reason.clone();
        current.timestamp = report.reported_at;
        current.generation = report.generation;

        let mut retry_load = false;
        match report.state {
            ReplicaState::LoadingFailed if !deleted => {
                if retries.record_failure(report.replica) {
                    current.exhausted = true;
                } else {
                    retry_load = !current.exhausted;
                }
            }
            ReplicaState::Available => retries.clear(&report.replica),
            _ => {}
        }

        self.refresh_state();

        Ok(ReplicaTransition {
            replica: report.replica,
            from,
            to: report.state,
            retry_load,
        })
    }

    /// Mark the model deleted and move every live replica to `Draining`.
    ///
    /// Returns the replicas that started draining.
    pub(crate) fn begin_termination(&mut self) -> Vec<u32> {
        self.deleted = true;
        self.state = ModelState::Terminating;
        self.state_reason = None;

        let now = Utc::now();
        let mut draining = Vec::new();
        for (index, status) in self.replicas.iter_mut() {
            if is_terminal_when_deleted(status.state) || status.state.is_removing() {
                continue;
            }
            status.state = ReplicaState::Draining;
            status.reason = Some("model deleted".to_string());
            status.timestamp = now;
            draining.push(*index);
        }
        draining
    }

    /// Replicas that are neither unloaded nor failed.
    pub(crate) fn live_replicas(&self) -> Vec<u32> {
        self.replicas
            .iter()
            .filter(|(_, status)| !is_terminal_when_deleted(status.state))
            .map(|(index, _)| *index)
            .collect()
    }

    /// Every replica of a deleted model reached a terminal state.
    pub(crate) fn is_drained(&self) -> bool {
        self.deleted
            && self
                .replicas
                .values()
                .all(|status| is_terminal_when_deleted(status.state))
    }

    /// The hosting server went away: nothing is loaded anymore.
    pub(crate) fn mark_replicas_unloaded(&mut self, reason: &str) {
        let now = Utc::now();
        for status in self.replicas.values_mut() {
            if status.state != ReplicaState::Unloaded {
                status.state = ReplicaState::Unloaded;
                status.reason = Some(reason.to_string());
                status.timestamp = now;
            }
        }
    }

    /// Recompute the coarse state from replica states.
    pub(crate) fn refresh_state(&mut self) {
        if self.deleted {
            self.state = ModelState::Terminating;
            return;
        }
        if self.server.is_none() {
            // Unscheduled models keep their placement verdict.
            return;
        }

        let exhausted = self
            .replicas
            .iter()
            .find(|(_, status)| status.state == ReplicaState::LoadingFailed && status.exhausted);

        if let Some((index, status)) = exhausted {
            self.state = ModelState::Failed;
            self.state_reason = Some(format!(
                "replica {} failed to load: {}",
                index,
                status.reason.as_deref().unwrap_or("unknown")
            ));
        } else if self.available_replicas() >= self.bounds.target {
            self.state = ModelState::Available;
            self.state_reason = None;
        } else {
            self.state = ModelState::Progressing;
            self.state_reason = None;
        }
    }
}

/// `Unloaded` is always terminal; a failed load leaves nothing to unload.
fn is_terminal_when_deleted(state: ReplicaState) -> bool {
    matches!(state, ReplicaState::Unloaded | ReplicaState::LoadingFailed)
}
