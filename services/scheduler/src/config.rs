use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use mlsched_reconcile::{DEFAULT_MAX_LOAD_RETRIES, DEFAULT_RESCHEDULE_INTERVAL, DEFAULT_RETRY_WINDOW};

use crate::store::StoreConfig;
use crate::usage::MetricsLevel;

#[derive(Debug, Clone)]
pub struct Config {
    pub log_level: String,
    pub cluster_id: String,
    pub reschedule_interval: Duration,
    pub usage_interval: Duration,
    pub max_load_retries: u32,
    pub retry_window: Duration,
    pub metrics_level: MetricsLevel,
    /// JSON-lines file of desired-state events replayed on startup.
    pub bootstrap_file: Option<PathBuf>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let log_level = std::env::var("MLSCHED_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        let cluster_id =
            std::env::var("MLSCHED_CLUSTER_ID").unwrap_or_else(|_| "default".to_string());

        let reschedule_interval = secs_from_env(
            "MLSCHED_RESCHEDULE_INTERVAL_SECS",
            DEFAULT_RESCHEDULE_INTERVAL,
        )?;

        let usage_interval =
            secs_from_env("MLSCHED_USAGE_INTERVAL_SECS", Duration::from_secs(3600))?;

        let max_load_retries = match std::env::var("MLSCHED_LOAD_RETRIES") {
            Ok(v) => v
                .parse()
                .with_context(|| format!("invalid MLSCHED_LOAD_RETRIES: {v}"))?,
            Err(_) => DEFAULT_MAX_LOAD_RETRIES,
        };

        let retry_window = secs_from_env("MLSCHED_RETRY_WINDOW_SECS", DEFAULT_RETRY_WINDOW)?;

        let metrics_level = match std::env::var("MLSCHED_METRICS_LEVEL") {
            Ok(v) => v.parse()?,
            Err(_) => MetricsLevel::default(),
        };

        let bootstrap_file = std::env::var("MLSCHED_BOOTSTRAP_FILE")
            .ok()
            .filter(|v| !v.is_empty())
            .map(PathBuf::from);

        Ok(Self {
            log_level,
            cluster_id,
            reschedule_interval,
            usage_interval,
            max_load_retries,
            retry_window,
            metrics_level,
            bootstrap_file,
        })
    }

    pub fn store_config(&self) -> StoreConfig {
        StoreConfig {
            max_load_retries: self.max_load_retries,
            retry_window: self.retry_window,
            ..Default::default()
        }
    }
}

fn secs_from_env(key: &str, default: Duration) -> Result<Duration> {
    match std::env::var(key) {
        Ok(v) => {
            let secs: u64 = v.parse().with_context(|| format!("invalid {key}: {v}"))?;
            anyhow::ensure!(secs > 0, "{key} must be positive");
            Ok(Duration::from_secs(secs))
        }
        Err(_) => Ok(default),
    }
}
