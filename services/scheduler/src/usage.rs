//! Usage summary of the scheduler's desired state.
//!
//! A summary is grouped into sections; [`MetricsLevel`] controls how many
//! sections are reported. Sections flatten into one property map.

use std::str::FromStr;

use mlsched_events::ErrorKind;
use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::experiment::ExperimentStore;
use crate::store::ModelServerStore;

const BYTES_PER_GB: f64 = 1024.0 * 1024.0 * 1024.0;

#[derive(Debug, Error)]
pub enum UsageError {
    #[error("level {0} not recognised")]
    UnknownLevel(String),

    #[error("failed to serialize usage summary: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl UsageError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::Validation
    }
}

/// How much detail a usage report carries. Each level includes the ones
/// before it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum MetricsLevel {
    #[default]
    Cluster,
    Resource,
    Feature,
}

impl MetricsLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cluster => "CLUSTER",
            Self::Resource => "RESOURCE",
            Self::Feature => "FEATURE",
        }
    }
}

impl std::fmt::Display for MetricsLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for MetricsLevel {
    type Err = UsageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "CLUSTER" => Ok(Self::Cluster),
            "RESOURCE" => Ok(Self::Resource),
            "FEATURE" => Ok(Self::Feature),
            _ => Err(UsageError::UnknownLevel(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CollectorMetrics {
    pub collector_version: String,
}

impl Default for CollectorMetrics {
    fn default() -> Self {
        Self {
            collector_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ClusterMetrics {
    pub cluster_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ResourceMetrics {
    pub model_count: u64,
    pub experiment_count: u64,
    pub server_count: u64,
    pub server_replica_slots: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FeatureMetrics {
    pub shared_server_count: u64,
    pub pinned_model_count: u64,
    pub server_memory_gb_sum: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct UsageSummary {
    #[serde(flatten)]
    pub collector: CollectorMetrics,
    #[serde(flatten)]
    pub cluster: ClusterMetrics,
    #[serde(flatten)]
    pub resource: ResourceMetrics,
    #[serde(flatten)]
    pub feature: FeatureMetrics,
}

impl UsageSummary {
    pub fn collect(cluster_id: &str, store: &ModelServerStore, experiments: &ExperimentStore) -> Self {
        let models = store.list_models();
        let servers = store.server_snapshots();

        Self {
            collector: CollectorMetrics::default(),
            cluster: ClusterMetrics {
                cluster_id: cluster_id.to_string(),
            },
            resource: ResourceMetrics {
                model_count: models.len() as u64,
                experiment_count: experiments.len() as u64,
                server_count: servers.len() as u64,
                server_replica_slots: servers.iter().map(|s| u64::from(s.replica_slots)).sum(),
            },
            feature: FeatureMetrics {
                shared_server_count: servers.iter().filter(|s| s.shared).count() as u64,
                pinned_model_count: models
                    .iter()
                    .filter(|m| m.pinned_server().is_some())
                    .count() as u64,
                server_memory_gb_sum: servers
                    .iter()
                    .map(|s| s.total_memory_bytes as f64 / BYTES_PER_GB)
                    .sum(),
            },
        }
    }

    /// Flat property map holding the sections enabled by `level`.
    pub fn to_properties(&self, level: MetricsLevel) -> Result<Map<String, Value>, UsageError> {
        let mut properties = Map::new();
        merge(&mut properties, serde_json::to_value(&self.collector)?);
        merge(&mut properties, serde_json::to_value(&self.cluster)?);
        if level >= MetricsLevel::Resource {
            merge(&mut properties, serde_json::to_value(&self.resource)?);
        }
        if level >= MetricsLevel::Feature {
            merge(&mut properties, serde_json::to_value(&self.feature)?);
        }
        Ok(properties)
    }
}

fn merge(properties: &mut Map<String, Value>, section: Value) {
    if let Value::Object(fields) = section {
        properties.extend(fields);
    }
}
