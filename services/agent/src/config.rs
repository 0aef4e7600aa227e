use anyhow::{Context, Result};

use crate::cache::{CacheConfig, DefaultPriority};
use crate::local::LocalCacheConfig;

#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Server this agent runs beside.
    pub server_name: String,
    pub cache: LocalCacheConfig,
}

impl AgentConfig {
    pub fn from_env() -> Result<Self> {
        let server_name = std::env::var("MLSCHED_AGENT_SERVER_NAME")
            .context("MLSCHED_AGENT_SERVER_NAME must be set")?;
        anyhow::ensure!(
            !server_name.is_empty(),
            "MLSCHED_AGENT_SERVER_NAME must not be empty"
        );

        let defaults = LocalCacheConfig::default();

        let capacity_bytes = match std::env::var("MLSCHED_AGENT_CAPACITY_BYTES") {
            Ok(v) => v
                .parse()
                .with_context(|| format!("invalid MLSCHED_AGENT_CAPACITY_BYTES: {v}"))?,
            Err(_) => defaults.capacity_bytes,
        };

        let default_priority = match std::env::var("MLSCHED_AGENT_DEFAULT_PRIORITY") {
            Ok(v) => v.parse()?,
            Err(_) => DefaultPriority::default(),
        };

        Ok(Self {
            server_name,
            cache: LocalCacheConfig {
                capacity_bytes,
                cache: CacheConfig { default_priority },
            },
        })
    }
}
