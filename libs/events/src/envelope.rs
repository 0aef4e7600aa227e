//! Desired-state events delivered by the reconciliation layer.

use serde::{Deserialize, Serialize};

use crate::{EventError, ModelSpec, ReplicaStatusReport, ServerSpec};

/// All event type names as constants.
pub mod event_types {
    pub const MODEL_UPSERTED: &str = "model.upserted";
    pub const MODEL_DELETED: &str = "model.deleted";
    pub const SERVER_UPSERTED: &str = "server.upserted";
    pub const SERVER_REMOVED: &str = "server.removed";
    pub const REPLICA_STATUS_REPORTED: &str = "replica.status_reported";
}

/// A change the scheduler must apply to its store.
///
/// Desired-state variants carry the generation of the resource they describe;
/// the store rejects anything older than what it has already applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DesiredStateEvent {
    ModelUpserted { model: ModelSpec, generation: i64 },
    ModelDeleted { name: String, generation: i64 },
    ServerUpserted { server: ServerSpec, generation: i64 },
    ServerRemoved { name: String, generation: i64 },
    ReplicaStatusReported { report: ReplicaStatusReport },
}

impl DesiredStateEvent {
    /// Dotted event type name, as used in logs.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::ModelUpserted { .. } => event_types::MODEL_UPSERTED,
            Self::ModelDeleted { .. } => event_types::MODEL_DELETED,
            Self::ServerUpserted { .. } => event_types::SERVER_UPSERTED,
            Self::ServerRemoved { .. } => event_types::SERVER_REMOVED,
            Self::ReplicaStatusReported { .. } => event_types::REPLICA_STATUS_REPORTED,
        }
    }

    /// Name of the model or server the event targets.
    pub fn resource_name(&self) -> &str {
        match self {
            Self::ModelUpserted { model, .. } => &model.name,
            Self::ModelDeleted { name, .. } | Self::ServerRemoved { name, .. } => name,
            Self::ServerUpserted { server, .. } => &server.name,
            Self::ReplicaStatusReported { report } => &report.model,
        }
    }

    pub fn generation(&self) -> i64 {
        match self {
            Self::ModelUpserted { generation, .. }
            | Self::ModelDeleted { generation, .. }
            | Self::ServerUpserted { generation, .. }
            | Self::ServerRemoved { generation, .. } => *generation,
            Self::ReplicaStatusReported { report } => report.generation,
        }
    }

    /// Parse one event from a JSON line.
    pub fn from_json_line(line: &str) -> Result<Self, EventError> {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return Err(EventError::InvalidPayload("empty line".to_string()));
        }
        Ok(serde_json::from_str(trimmed)?)
    }
}
