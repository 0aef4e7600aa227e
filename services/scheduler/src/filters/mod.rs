//! Placement filter pipeline.
//!
//! Each filter is a side-effect free predicate over a model version and a
//! server snapshot. A pipeline ANDs its filters and ranks the survivors by
//! most available memory, then by name, so the same input state always
//! yields the same placement.

use serde::Serialize;

use crate::store::{ModelVersion, ServerSnapshot};

/// A placement predicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerFilter {
    /// A pinned model only goes to the server it names.
    ExplicitServer,
    /// Unpinned models only go to shared servers. A pin overrides sharing.
    Sharing,
    /// Memory and replica slots must cover every replica being placed.
    Capacity,
    /// Server capabilities must include every model requirement.
    Requirements,
}

impl ServerFilter {
    pub const ALL: [ServerFilter; 4] = [
        Self::ExplicitServer,
        Self::Sharing,
        Self::Capacity,
        Self::Requirements,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::ExplicitServer => "explicit_server",
            Self::Sharing => "sharing",
            Self::Capacity => "capacity",
            Self::Requirements => "requirements",
        }
    }

    /// Returns true if `server` may host `model`.
    pub fn filter(&self, model: &ModelVersion, server: &ServerSnapshot) -> bool {
        match self {
            Self::ExplicitServer => match model.pinned_server() {
                Some(pinned) => pinned == server.name,
                None => true,
            },
            Self::Sharing => match model.pinned_server() {
                Some(pinned) => pinned == server.name,
                None => server.shared,
            },
            Self::Capacity => {
                let replicas = model.desired_replicas();
                let memory = model.memory_bytes().saturating_mul(u64::from(replicas));
                memory <= server.available_memory_bytes && replicas <= server.free_replica_slots
            }
            Self::Requirements => model
                .requirements()
                .iter()
                .all(|tag| server.capabilities.contains(tag)),
        }
    }

    /// Why `server` was rejected for `model`.
    pub fn description(&self, model: &ModelVersion, server: &ServerSnapshot) -> String {
        match self {
            Self::ExplicitServer | Self::Sharing => match model.pinned_server() {
                Some(pinned) => format!("model is pinned to server {pinned}"),
                None => "server is not shared".to_string(),
            },
            Self::Capacity => format!(
                "needs {} bytes and {} slots, has {} bytes and {} slots",
                model
                    .memory_bytes()
                    .saturating_mul(u64::from(model.desired_replicas())),
                model.desired_replicas(),
                server.available_memory_bytes,
                server.free_replica_slots
            ),
            Self::Requirements => {
                let missing: Vec<&str> = model
                    .requirements()
                    .iter()
                    .filter(|tag| !server.capabilities.contains(*tag))
                    .map(String::as_str)
                    .collect();
                format!("missing capabilities [{}]", missing.join(", "))
            }
        }
    }
}

impl std::fmt::Display for ServerFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// An ordered set of filters combined by logical AND.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterPipeline {
    filters: Vec<ServerFilter>,
}

impl Default for FilterPipeline {
    fn default() -> Self {
        Self::new(ServerFilter::ALL)
    }
}

impl FilterPipeline {
    pub fn new(filters: impl IntoIterator<Item = ServerFilter>) -> Self {
        Self {
            filters: filters.into_iter().collect(),
        }
    }

    pub fn filters(&self) -> &[ServerFilter] {
        &self.filters
    }

    pub fn accepts(&self, model: &ModelVersion, server: &ServerSnapshot) -> bool {
        self.filters.iter().all(|f| f.filter(model, server))
    }

    /// Filters that reject `server` for `model`.
    pub fn rejections(&self, model: &ModelVersion, server: &ServerSnapshot) -> Vec<ServerFilter> {
        self.filters
            .iter()
            .copied()
            .filter(|f| !f.filter(model, server))
            .collect()
    }

    /// Servers eligible to host `model`, best first.
    pub fn eligible<'a>(
        &self,
        model: &ModelVersion,
        servers: &'a [ServerSnapshot],
    ) -> Vec<&'a ServerSnapshot> {
        let mut eligible: Vec<&ServerSnapshot> = servers
            .iter()
            .filter(|server| self.accepts(model, server))
            .collect();
        eligible.sort_by(|a, b| {
            b.available_memory_bytes
                .cmp(&a.available_memory_bytes)
                .then_with(|| a.name.cmp(&b.name))
        });
        eligible
    }

    /// One-line account of why no server passed, for failure reasons.
    pub fn explain(&self, model: &ModelVersion, servers: &[ServerSnapshot]) -> String {
        if servers.is_empty() {
            return "no servers registered".to_string();
        }

        servers
            .iter()
            .filter_map(|server| {
                let first = self.rejections(model, server).into_iter().next()?;
                Some(format!(
                    "{}: {} ({})",
                    server.name,
                    first,
                    first.description(model, server)
                ))
            })
            .collect::<Vec<_>>()
            .join("; ")
    }
}

#[cfg(test)]
mod tests {
    use std::cmp::Reverse;
    use std::collections::BTreeMap;

    use mlsched_events::ModelSpec;
    use proptest::prelude::*;
    use rstest::rstest;

    use super::*;
    use crate::store::ModelState;

    fn model(pinned: Option<&str>) -> ModelVersion {
        let mut spec = ModelSpec::new("iris");
        spec.server = pinned.map(str::to_string);
        ModelVersion::new(spec, 1, None, BTreeMap::new(), false, ModelState::Progressing).unwrap()
    }

    fn server(name: &str, shared: bool) -> ServerSnapshot {
        ServerSnapshot {
            name: name.to_string(),
            total_memory_bytes: 1_000,
            available_memory_bytes: 1_000,
            replica_slots: 4,
            free_replica_slots: 4,
            shared,
            ..Default::default()
        }
    }

    #[rstest]
    #[case::pinned_unshared_match(Some("foo"), "foo", false, true)]
    #[case::pinned_shared_match(Some("foo"), "foo", true, true)]
    #[case::pinned_mismatch(Some("foo"), "bar", true, false)]
    #[case::unpinned_shared(None, "bar", true, true)]
    #[case::unpinned_unshared(None, "foo", false, false)]
    fn test_sharing_filter(
        #[case] pinned: Option<&str>,
        #[case] server_name: &str,
        #[case] shared: bool,
        #[case] expected: bool,
    ) {
        let ok = ServerFilter::Sharing.filter(&model(pinned), &server(server_name, shared));
        assert_eq!(ok, expected);
    }

    #[test]
    fn test_explicit_server_filter() {
        assert!(ServerFilter::ExplicitServer.filter(&model(Some("a")), &server("a", false)));
        assert!(!ServerFilter::ExplicitServer.filter(&model(Some("a")), &server("b", true)));
        assert!(ServerFilter::ExplicitServer.filter(&model(None), &server("b", false)));
    }

    #[rstest]
    #[case::fits(100, 2, 200, 2, true)]
    #[case::memory_short(100, 3, 250, 4, false)]
    #[case::slots_short(10, 3, 1_000, 2, false)]
    #[case::zero_replicas(100, 0, 0, 0, true)]
    fn test_capacity_filter(
        #[case] memory_bytes: u64,
        #[case] replicas: u32,
        #[case] available_memory: u64,
        #[case] free_slots: u32,
        #[case] expected: bool,
    ) {
        let mut spec = ModelSpec::new("iris");
        spec.memory_bytes = memory_bytes;
        spec.scaling.replicas = Some(replicas);
        let model =
            ModelVersion::new(spec, 1, None, BTreeMap::new(), false, ModelState::Progressing)
                .unwrap();

        let mut server = server("mlserver", true);
        server.available_memory_bytes = available_memory;
        server.free_replica_slots = free_slots;

        assert_eq!(ServerFilter::Capacity.filter(&model, &server), expected);
    }

    #[test]
    fn test_requirements_filter() {
        let mut spec = ModelSpec::new("iris");
        spec.requirements = vec!["sklearn".to_string(), "gpu".to_string()];
        let model =
            ModelVersion::new(spec, 1, None, BTreeMap::new(), false, ModelState::Progressing)
                .unwrap();

        let mut server = server("mlserver", true);
        server.capabilities = ["sklearn".to_string()].into_iter().collect();
        assert!(!ServerFilter::Requirements.filter(&model, &server));
        assert_eq!(
            ServerFilter::Requirements.description(&model, &server),
            "missing capabilities [gpu]"
        );

        server.capabilities.insert("gpu".to_string());
        assert!(ServerFilter::Requirements.filter(&model, &server));
    }

    #[test]
    fn test_pipeline_ranks_by_memory_then_name() {
        let mut small = server("a-small", true);
        small.available_memory_bytes = 100;
        let big_b = server("b-big", true);
        let big_a = server("a-big", true);
        let unshared = server("c-unshared", false);
        let servers = vec![small, big_b, unshared, big_a];

        let pipeline = FilterPipeline::default();
        let names: Vec<&str> = pipeline
            .eligible(&model(None), &servers)
            .into_iter()
            .map(|s| s.name.as_str())
            .collect();
        assert_eq!(names, vec!["a-big", "b-big", "a-small"]);
    }

    #[test]
    fn test_pipeline_explain_names_first_rejection() {
        let servers = vec![server("triton", false)];
        let pipeline = FilterPipeline::default();

        assert!(pipeline.eligible(&model(None), &servers).is_empty());
        assert_eq!(
            pipeline.rejections(&model(None), &servers[0]),
            vec![ServerFilter::Sharing]
        );
        assert_eq!(
            pipeline.explain(&model(None), &servers),
            "triton: sharing (server is not shared)"
        );
        assert_eq!(pipeline.explain(&model(None), &[]), "no servers registered");
    }

    proptest! {
        #[test]
        fn prop_eligible_servers_are_accepted_and_ranked(
            servers in proptest::collection::vec((0u64..2_000, 0u32..8, any::<bool>()), 0..12),
        ) {
            let snapshots: Vec<ServerSnapshot> = servers
                .iter()
                .enumerate()
                .map(|(i, (memory, slots, shared))| ServerSnapshot {
                    name: format!("server-{}", i % 4),
                    total_memory_bytes: *memory,
                    available_memory_bytes: *memory,
                    replica_slots: *slots,
                    free_replica_slots: *slots,
                    shared: *shared,
                    ..Default::default()
                })
                .collect();
            let mut spec = ModelSpec::new("iris");
            spec.memory_bytes = 100;
            let model =
                ModelVersion::new(spec, 1, None, BTreeMap::new(), false, ModelState::Progressing)
                    .unwrap();

            let pipeline = FilterPipeline::default();
            let eligible = pipeline.eligible(&model, &snapshots);

            let accepted = snapshots.iter().filter(|s| pipeline.accepts(&model, s)).count();
            prop_assert_eq!(eligible.len(), accepted);
            for pair in eligible.windows(2) {
                let first = (Reverse(pair[0].available_memory_bytes), pair[0].name.as_str());
                let second = (Reverse(pair[1].available_memory_bytes), pair[1].name.as_str());
                prop_assert!(first <= second);
            }
        }
    }
}
