//! Payload types for desired state, agent reports and dispatch decisions.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::EventError;

// =============================================================================
// Desired State
// =============================================================================

/// Replica scaling settings as submitted by the desired-state layer.
///
/// Unset fields are defaulted by the scheduler when it converts the spec into
/// replica bounds.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScalingSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_replicas: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_replicas: Option<u32>,
}

/// Desired definition of a model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelSpec {
    pub name: String,

    /// Memory needed by one replica.
    #[serde(default)]
    pub memory_bytes: u64,

    /// Capability tags a hosting server must declare.
    #[serde(default)]
    pub requirements: Vec<String>,

    /// Explicit server pin. Unpinned models only go to shared servers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server: Option<String>,

    #[serde(default)]
    pub scaling: ScalingSpec,
}

impl ModelSpec {
    /// A minimal spec with one replica and no requirements.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            memory_bytes: 0,
            requirements: Vec::new(),
            server: None,
            scaling: ScalingSpec::default(),
        }
    }
}

/// Desired definition of an inference server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerSpec {
    pub name: String,

    /// Total memory available for model replicas.
    pub memory_bytes: u64,

    /// Total model replicas the server can host.
    pub replica_slots: u32,

    /// Whether the server accepts models that are not pinned to it.
    #[serde(default)]
    pub shared: bool,

    #[serde(default)]
    pub capabilities: Vec<String>,
}

// =============================================================================
// Replica State
// =============================================================================

/// Lifecycle state of one model replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ReplicaState {
    #[default]
    Unknown,
    Loading,
    Available,
    LoadingFailed,
    Draining,
    Unloading,
    Unloaded,
}

impl ReplicaState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Loading => "loading",
            Self::Available => "available",
            Self::LoadingFailed => "loading_failed",
            Self::Draining => "draining",
            Self::Unloading => "unloading",
            Self::Unloaded => "unloaded",
        }
    }

    /// Position in the lifecycle. Within one report generation a replica
    /// may only move to a state of equal or higher rank.
    pub fn rank(&self) -> u8 {
        match self {
            Self::Unknown => 0,
            Self::Loading => 1,
            Self::Available | Self::LoadingFailed => 2,
            Self::Draining => 3,
            Self::Unloading => 4,
            Self::Unloaded => 5,
        }
    }

    /// Returns true for states on the way out of the server.
    pub fn is_removing(&self) -> bool {
        matches!(self, Self::Draining | Self::Unloading | Self::Unloaded)
    }
}

impl std::fmt::Display for ReplicaState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ReplicaState {
    type Err = EventError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unknown" => Ok(Self::Unknown),
            "loading" => Ok(Self::Loading),
            "available" => Ok(Self::Available),
            "loading_failed" => Ok(Self::LoadingFailed),
            "draining" => Ok(Self::Draining),
            "unloading" => Ok(Self::Unloading),
            "unloaded" => Ok(Self::Unloaded),
            other => Err(EventError::UnknownReplicaState(other.to_string())),
        }
    }
}

/// Asynchronous status report from the agent owning a replica.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaStatusReport {
    pub model: String,
    pub version: u32,
    pub replica: u32,
    /// Server whose agent produced the report.
    pub server: String,
    pub state: ReplicaState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    /// Agent-side report counter; older generations are dropped.
    pub generation: i64,

    pub reported_at: DateTime<Utc>,
}

// =============================================================================
// Decisions
// =============================================================================

/// A committed placement: which replicas of a model version go to a server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlacementDecision {
    pub model: String,
    pub version: u32,
    pub server: String,
    pub replicas: Vec<u32>,
}

/// Command for the dispatch layer, which turns it into agent RPCs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum DispatchCommand {
    LoadModel {
        model: String,
        version: u32,
        server: String,
        replicas: Vec<u32>,
    },
    UnloadModel {
        model: String,
        version: u32,
        server: String,
        replicas: Vec<u32>,
    },
}

impl DispatchCommand {
    pub fn model(&self) -> &str {
        match self {
            Self::LoadModel { model, .. } | Self::UnloadModel { model, .. } => model,
        }
    }

    pub fn server(&self) -> &str {
        match self {
            Self::LoadModel { server, .. } | Self::UnloadModel { server, .. } => server,
        }
    }
}

impl From<PlacementDecision> for DispatchCommand {
    fn from(decision: PlacementDecision) -> Self {
        Self::LoadModel {
            model: decision.model,
            version: decision.version,
            server: decision.server,
            replicas: decision.replicas,
        }
    }
}

/// An agent-side decision to unload a model to free memory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvictionDecision {
    pub model: String,
    pub priority: i64,
    pub freed_bytes: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_replica_state_round_trips_through_str() {
        for state in [
            ReplicaState::Unknown,
            ReplicaState::Loading,
            ReplicaState::Available,
            ReplicaState::LoadingFailed,
            ReplicaState::Draining,
            ReplicaState::Unloading,
            ReplicaState::Unloaded,
        ] {
            assert_eq!(state.as_str().parse::<ReplicaState>().unwrap(), state);
        }
        assert!("booting".parse::<ReplicaState>().is_err());
    }

    #[test]
    fn test_replica_state_rank_is_lifecycle_order() {
        assert!(ReplicaState::Unknown.rank() < ReplicaState::Loading.rank());
        assert!(ReplicaState::Loading.rank() < ReplicaState::Available.rank());
        assert_eq!(
            ReplicaState::Available.rank(),
            ReplicaState::LoadingFailed.rank()
        );
        assert!(ReplicaState::Draining.rank() < ReplicaState::Unloading.rank());
        assert!(ReplicaState::Unloading.rank() < ReplicaState::Unloaded.rank());
    }

    #[test]
    fn test_dispatch_command_serialization() {
        let cmd = DispatchCommand::from(PlacementDecision {
            model: "iris".to_string(),
            version: 2,
            server: "mlserver".to_string(),
            replicas: vec![0, 1],
        });
        let json = serde_json::to_value(&cmd).unwrap();
        assert_eq!(json["command"], "load_model");
        assert_eq!(json["server"], "mlserver");
        assert_eq!(cmd.model(), "iris");
    }

    #[test]
    fn test_model_spec_defaults_from_json() {
        let spec: ModelSpec = serde_json::from_str(r#"{"name": "iris"}"#).unwrap();
        assert_eq!(spec, ModelSpec::new("iris"));
    }
}
