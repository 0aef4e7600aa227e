//! Model scaling stats collector.
//!
//! Request-handling paths call [`DataPlaneStatsCollector::scaling_metrics_setup`]
//! when a request for a model starts and
//! [`DataPlaneStatsCollector::scaling_metrics_tear_down`] when it completes.
//! The autoscaler reads [`DataPlaneStatsCollector::snapshot`] periodically.

mod keepers;

use chrono::{DateTime, Utc};
use mlsched_events::ErrorKind;
use serde::Serialize;
use thiserror::Error;
use tracing::debug;

pub use keepers::{LagKeeper, LastUsedKeeper};

pub type StatsResult<T> = Result<T, StatsError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StatsError {
    #[error("model {0} is not tracked")]
    NotTracked(String),
}

impl StatsError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotTracked(_) => ErrorKind::NotFound,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }
}

/// Scaling signals of one model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModelScalingSignal {
    pub model: String,
    /// Requests started but not yet completed.
    pub lag: u32,
    /// Unix seconds of the last access.
    pub last_used: i64,
}

impl ModelScalingSignal {
    pub fn last_used_at(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp(self.last_used, 0)
    }
}

/// Per-model lag and last-used tracking.
#[derive(Debug, Default)]
pub struct DataPlaneStatsCollector {
    lags: LagKeeper,
    last_used: LastUsedKeeper,
}

impl DataPlaneStatsCollector {
    pub fn new(lags: LagKeeper, last_used: LastUsedKeeper) -> Self {
        Self { lags, last_used }
    }

    /// A request for `model` started.
    pub fn scaling_metrics_setup(&self, model: &str) {
        let lag = self.lags.inc(model);
        let last_used = self.last_used.touch(model);
        debug!(model = %model, lag, last_used, "Request started");
    }

    /// A request for `model` completed.
    pub fn scaling_metrics_tear_down(&self, model: &str) -> StatsResult<()> {
        let lag = self
            .lags
            .dec(model)
            .ok_or_else(|| StatsError::NotTracked(model.to_string()))?;
        self.last_used.touch(model);
        debug!(model = %model, lag, "Request completed");
        Ok(())
    }

    pub fn get_lag(&self, model: &str) -> StatsResult<u32> {
        self.lags
            .get(model)
            .ok_or_else(|| StatsError::NotTracked(model.to_string()))
    }

    pub fn get_last_used(&self, model: &str) -> StatsResult<i64> {
        self.last_used
            .get(model)
            .ok_or_else(|| StatsError::NotTracked(model.to_string()))
    }

    /// Stop tracking `model`, e.g. once it is unloaded. Returns its last signal.
    pub fn remove_model(&self, model: &str) -> Option<ModelScalingSignal> {
        let lag = self.lags.remove(model);
        let last_used = self.last_used.remove(model);
        match (lag, last_used) {
            (None, None) => None,
            (lag, last_used) => Some(ModelScalingSignal {
                model: model.to_string(),
                lag: lag.unwrap_or_default(),
                last_used: last_used.unwrap_or_default(),
            }),
        }
    }

    /// Signals of every tracked model, sorted by name.
    pub fn snapshot(&self) -> Vec<ModelScalingSignal> {
        let mut signals: Vec<ModelScalingSignal> = self
            .lags
            .models()
            .into_iter()
            .filter_map(|model| {
                let lag = self.lags.get(&model)?;
                let last_used = self.last_used.get(&model).unwrap_or_default();
                Some(ModelScalingSignal {
                    model,
                    lag,
                    last_used,
                })
            })
            .collect();
        signals.sort_by(|a, b| a.model.cmp(&b.model));
        signals
    }
}
