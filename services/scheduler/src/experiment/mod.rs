//! Traffic-split experiments.

mod errors;
mod store;

use serde::{Deserialize, Serialize};

pub use errors::{ExperimentError, ExperimentResult};
pub use store::ExperimentStore;

/// What an experiment splits traffic between.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    #[default]
    Model,
    Pipeline,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candidate {
    pub name: String,
    pub weight: u32,
}

/// Receives a copy of a share of traffic; responses are discarded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mirror {
    pub name: String,
    pub percent: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Experiment {
    pub name: String,
    /// Baseline resource; must be one of the candidates.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
    #[serde(default)]
    pub resource_kind: ResourceKind,
    #[serde(default)]
    pub candidates: Vec<Candidate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mirror: Option<Mirror>,
}

impl Experiment {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            default: None,
            resource_kind: ResourceKind::Model,
            candidates: Vec::new(),
            mirror: None,
        }
    }

    pub fn with_default(mut self, default: impl Into<String>) -> Self {
        self.default = Some(default.into());
        self
    }

    pub fn with_candidate(mut self, name: impl Into<String>, weight: u32) -> Self {
        self.candidates.push(Candidate {
            name: name.into(),
            weight,
        });
        self
    }

    pub fn with_mirror(mut self, name: impl Into<String>, percent: u32) -> Self {
        self.mirror = Some(Mirror {
            name: name.into(),
            percent,
        });
        self
    }

    pub fn with_resource_kind(mut self, kind: ResourceKind) -> Self {
        self.resource_kind = kind;
        self
    }

    /// Candidate names followed by the mirror, in declaration order.
    pub fn resources(&self) -> impl Iterator<Item = &str> {
        self.candidates
            .iter()
            .map(|c| c.name.as_str())
            .chain(self.mirror.iter().map(|m| m.name.as_str()))
    }

    pub fn references(&self, resource: &str) -> bool {
        self.default.as_deref() == Some(resource) || self.resources().any(|r| r == resource)
    }

    pub fn has_candidate(&self, resource: &str) -> bool {
        self.candidates.iter().any(|c| c.name == resource)
    }
}
