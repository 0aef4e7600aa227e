//! Server table entries and the snapshots filters read.

use std::collections::{BTreeMap, BTreeSet};

use mlsched_events::ServerSpec;
use mlsched_reconcile::GenerationCheckpoint;
use serde::Serialize;

/// Point-in-time view of one inference server.
///
/// Rebuilt from the server table on every read; filters never mutate it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ServerSnapshot {
    pub name: String,
    pub total_memory_bytes: u64,
    pub available_memory_bytes: u64,
    pub replica_slots: u32,
    pub free_replica_slots: u32,
    pub shared: bool,
    pub capabilities: BTreeSet<String>,
    /// model name -> assigned version
    pub models: BTreeMap<String, u32>,
}

impl ServerSnapshot {
    /// Snapshot of an empty server described by `spec`.
    pub fn from_spec(spec: &ServerSpec) -> Self {
        Self {
            name: spec.name.clone(),
            total_memory_bytes: spec.memory_bytes,
            available_memory_bytes: spec.memory_bytes,
            replica_slots: spec.replica_slots,
            free_replica_slots: spec.replica_slots,
            shared: spec.shared,
            capabilities: spec.capabilities.iter().cloned().collect(),
            models: BTreeMap::new(),
        }
    }
}

/// Capacity held by one model version on a server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Reservation {
    pub version: u32,
    pub replicas: u32,
    pub memory_bytes: u64,
}

#[derive(Debug, Clone)]
pub(crate) struct ServerRecord {
    pub spec: ServerSpec,
    pub checkpoint: GenerationCheckpoint,
    reservations: BTreeMap<String, Reservation>,
}

impl ServerRecord {
    pub fn new(spec: ServerSpec, generation: i64) -> Self {
        Self {
            spec,
            checkpoint: GenerationCheckpoint::new(generation),
            reservations: BTreeMap::new(),
        }
    }

    pub fn snapshot(&self) -> ServerSnapshot {
        let mut snapshot = ServerSnapshot::from_spec(&self.spec);
        for (model, reservation) in &self.reservations {
            snapshot.available_memory_bytes = snapshot
                .available_memory_bytes
                .saturating_sub(reservation.memory_bytes);
            snapshot.free_replica_slots = snapshot
                .free_replica_slots
                .saturating_sub(reservation.replicas);
            snapshot.models.insert(model.clone(), reservation.version);
        }
        snapshot
    }

    /// Reserve capacity for `model`, replacing any previous reservation.
    pub fn reserve(&mut self, model: &str, reservation: Reservation) {
        self.reservations.insert(model.to_string(), reservation);
    }

    pub fn release(&mut self, model: &str) -> Option<Reservation> {
        self.reservations.remove(model)
    }

    pub fn models(&self) -> impl Iterator<Item = &String> {
        self.reservations.keys()
    }
}
