//! Validated experiment store with a baseline ownership index.

use std::collections::{BTreeMap, HashMap, HashSet};

use parking_lot::RwLock;
use tracing::{debug, info, instrument};

use super::errors::{ExperimentError, ExperimentResult};
use super::{Experiment, ResourceKind};

#[derive(Debug, Default)]
struct ExperimentIndex {
    experiments: BTreeMap<String, Experiment>,
    /// baseline resource -> owning experiment, per resource kind
    model_baselines: HashMap<String, String>,
    pipeline_baselines: HashMap<String, String>,
}

impl ExperimentIndex {
    fn baselines(&self, kind: ResourceKind) -> &HashMap<String, String> {
        match kind {
            ResourceKind::Model => &self.model_baselines,
            ResourceKind::Pipeline => &self.pipeline_baselines,
        }
    }

    fn baselines_mut(&mut self, kind: ResourceKind) -> &mut HashMap<String, String> {
        match kind {
            ResourceKind::Model => &mut self.model_baselines,
            ResourceKind::Pipeline => &mut self.pipeline_baselines,
        }
    }

    /// Drop `experiment`'s baseline claim if it still holds it.
    fn release_baseline(&mut self, experiment: &Experiment) {
        let Some(default) = &experiment.default else {
            return;
        };
        let baselines = self.baselines_mut(experiment.resource_kind);
        if baselines.get(default) == Some(&experiment.name) {
            baselines.remove(default);
        }
    }

    /// First violation, checked in order: duplicate resources, default not a
    /// candidate, default owned by another experiment, nothing to route to.
    fn validate(&self, experiment: &Experiment) -> ExperimentResult<()> {
        if experiment.name.trim().is_empty() {
            return Err(ExperimentError::Invalid("name must not be empty".to_string()));
        }

        let mut seen = HashSet::new();
        for resource in experiment.resources() {
            if !seen.insert(resource) {
                return Err(ExperimentError::NoDuplicates {
                    experiment: experiment.name.clone(),
                    resource: resource.to_string(),
                });
            }
        }

        if let Some(default) = &experiment.default {
            if !experiment.has_candidate(default) {
                return Err(ExperimentError::DefaultNotFound {
                    experiment: experiment.name.clone(),
                    default: default.clone(),
                });
            }
            if let Some(owner) = self.baselines(experiment.resource_kind).get(default) {
                if owner != &experiment.name {
                    return Err(ExperimentError::BaselineExists {
                        experiment: experiment.name.clone(),
                        resource: default.clone(),
                        owner: owner.clone(),
                    });
                }
            }
        }

        if experiment.candidates.is_empty() && experiment.mirror.is_none() {
            return Err(ExperimentError::NoCandidatesOrMirrors(
                experiment.name.clone(),
            ));
        }

        Ok(())
    }
}

/// Experiment definitions keyed by name.
///
/// Validation and commit happen under one write lock, so a rejected
/// experiment never leaves partial state behind.
#[derive(Debug, Default)]
pub struct ExperimentStore {
    index: RwLock<ExperimentIndex>,
}

impl ExperimentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Check `experiment` against the current store without committing.
    pub fn validate(&self, experiment: &Experiment) -> ExperimentResult<()> {
        self.index.read().validate(experiment)
    }

    /// Validate and commit `experiment`, replacing any experiment of the
    /// same name. Returns the replaced definition.
    #[instrument(skip_all, fields(experiment = %experiment.name))]
    pub fn start_experiment(&self, experiment: Experiment) -> ExperimentResult<Option<Experiment>> {
        let mut index = self.index.write();
        index.validate(&experiment)?;

        let previous = index.experiments.remove(&experiment.name);
        if let Some(previous) = &previous {
            index.release_baseline(previous);
        }
        if let Some(default) = &experiment.default {
            index
                .baselines_mut(experiment.resource_kind)
                .insert(default.clone(), experiment.name.clone());
        }

        info!(
            candidates = experiment.candidates.len(),
            mirror = experiment.mirror.is_some(),
            baseline = experiment.default.as_deref().unwrap_or_default(),
            updated = previous.is_some(),
            "Experiment committed"
        );
        index
            .experiments
            .insert(experiment.name.clone(), experiment);

        Ok(previous)
    }

    /// Remove an experiment and release its baseline claim.
    #[instrument(skip(self))]
    pub fn delete_experiment(&self, name: &str) -> ExperimentResult<Experiment> {
        let mut index = self.index.write();
        let experiment = index
            .experiments
            .remove(name)
            .ok_or_else(|| ExperimentError::NotFound(name.to_string()))?;
        index.release_baseline(&experiment);

        info!("Experiment deleted");
        Ok(experiment)
    }

    pub fn get_experiment(&self, name: &str) -> ExperimentResult<Experiment> {
        self.index
            .read()
            .experiments
            .get(name)
            .cloned()
            .ok_or_else(|| ExperimentError::NotFound(name.to_string()))
    }

    /// All experiments, sorted by name.
    pub fn list_experiments(&self) -> Vec<Experiment> {
        self.index.read().experiments.values().cloned().collect()
    }

    /// Experiment that holds `resource` as its baseline.
    pub fn baseline_owner(&self, resource: &str, kind: ResourceKind) -> Option<String> {
        self.index.read().baselines(kind).get(resource).cloned()
    }

    /// Names of experiments that route to `resource` in any role.
    pub fn experiments_referencing(&self, resource: &str) -> Vec<String> {
        let names: Vec<String> = self
            .index
            .read()
            .experiments
            .values()
            .filter(|e| e.references(resource))
            .map(|e| e.name.clone())
            .collect();
        debug!(resource, experiments = names.len(), "Resolved experiment references");
        names
    }

    pub fn len(&self) -> usize {
        self.index.read().experiments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    fn store_with_b_owning_model1() -> ExperimentStore {
        let store = ExperimentStore::new();
        store
            .start_experiment(
                Experiment::new("b")
                    .with_default("model1")
                    .with_candidate("model1", 50)
                    .with_candidate("model3", 50),
            )
            .unwrap();
        store
    }

    #[rstest]
    #[case::valid(
        Experiment::new("a").with_default("model1").with_candidate("model1", 50).with_candidate("model2", 50),
        None
    )]
    #[case::duplicate_mirror(
        Experiment::new("a").with_candidate("model1", 50).with_candidate("model2", 50).with_mirror("model2", 10),
        Some(ExperimentError::NoDuplicates { experiment: "a".to_string(), resource: "model2".to_string() })
    )]
    #[case::duplicate_candidate(
        Experiment::new("a").with_candidate("model1", 50).with_candidate("model1", 50),
        Some(ExperimentError::NoDuplicates { experiment: "a".to_string(), resource: "model1".to_string() })
    )]
    #[case::default_not_candidate(
        Experiment::new("a").with_default("model1").with_candidate("model2", 100),
        Some(ExperimentError::DefaultNotFound { experiment: "a".to_string(), default: "model1".to_string() })
    )]
    #[case::default_without_candidates(
        Experiment::new("a").with_default("model1"),
        Some(ExperimentError::DefaultNotFound { experiment: "a".to_string(), default: "model1".to_string() })
    )]
    #[case::nothing_to_route(
        Experiment::new("a"),
        Some(ExperimentError::NoCandidatesOrMirrors("a".to_string()))
    )]
    #[case::mirror_only(Experiment::new("a").with_mirror("model1", 20), None)]
    #[case::duplicate_beats_default(
        Experiment::new("a").with_default("model9").with_candidate("model1", 50).with_mirror("model1", 5),
        Some(ExperimentError::NoDuplicates { experiment: "a".to_string(), resource: "model1".to_string() })
    )]
    fn test_validate(#[case] experiment: Experiment, #[case] expected: Option<ExperimentError>) {
        let store = ExperimentStore::new();
        assert_eq!(store.validate(&experiment).err(), expected);
    }

    #[test]
    fn test_baseline_claimed_by_other_experiment() {
        let store = store_with_b_owning_model1();
        let a = Experiment::new("a")
            .with_default("model1")
            .with_candidate("model1", 50)
            .with_candidate("model2", 50);

        let err = store.start_experiment(a).unwrap_err();
        assert_eq!(
            err,
            ExperimentError::BaselineExists {
                experiment: "a".to_string(),
                resource: "model1".to_string(),
                owner: "b".to_string(),
            }
        );
        assert!(store.get_experiment("a").unwrap_err().is_not_found());
        assert_eq!(store.baseline_owner("model1", ResourceKind::Model).as_deref(), Some("b"));
    }

    #[test]
    fn test_resubmitting_owner_is_idempotent() {
        let store = store_with_b_owning_model1();
        let b = store.get_experiment("b").unwrap();

        let previous = store.start_experiment(b.clone()).unwrap();
        assert_eq!(previous, Some(b));
        assert_eq!(store.baseline_owner("model1", ResourceKind::Model).as_deref(), Some("b"));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_baselines_are_per_resource_kind() {
        let store = store_with_b_owning_model1();
        let pipeline = Experiment::new("p")
            .with_resource_kind(ResourceKind::Pipeline)
            .with_default("model1")
            .with_candidate("model1", 100);

        store.start_experiment(pipeline).unwrap();
        assert_eq!(
            store.baseline_owner("model1", ResourceKind::Pipeline).as_deref(),
            Some("p")
        );
    }

    #[test]
    fn test_update_moves_baseline() {
        let store = store_with_b_owning_model1();
        store
            .start_experiment(
                Experiment::new("b")
                    .with_default("model3")
                    .with_candidate("model1", 50)
                    .with_candidate("model3", 50),
            )
            .unwrap();

        assert_eq!(store.baseline_owner("model1", ResourceKind::Model), None);
        assert_eq!(store.baseline_owner("model3", ResourceKind::Model).as_deref(), Some("b"));
    }

    #[test]
    fn test_delete_releases_baseline() {
        let store = store_with_b_owning_model1();
        store.delete_experiment("b").unwrap();
        assert_eq!(store.baseline_owner("model1", ResourceKind::Model), None);
        assert!(store.is_empty());

        let err = store.delete_experiment("b").unwrap_err();
        assert_eq!(err.to_string(), "Experiment not found b");
    }

    #[test]
    fn test_experiments_referencing() {
        let store = store_with_b_owning_model1();
        store
            .start_experiment(Experiment::new("shadow").with_mirror("model3", 10))
            .unwrap();

        assert_eq!(store.experiments_referencing("model3"), vec!["b", "shadow"]);
        assert_eq!(store.experiments_referencing("model1"), vec!["b"]);
        assert!(store.experiments_referencing("model9").is_empty());
    }
}
