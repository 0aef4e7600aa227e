use chrono::Utc;
use dashmap::DashMap;

/// In-flight request count per model.
#[derive(Debug, Default)]
pub struct LagKeeper {
    lags: DashMap<String, u32>,
}

impl LagKeeper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Increment and return the new count, tracking the model if needed.
    pub fn inc(&self, model: &str) -> u32 {
        let mut lag = self.lags.entry(model.to_string()).or_insert(0);
        *lag = lag.saturating_add(1);
        *lag
    }

    /// Decrement and return the new count. `None` if the model is untracked.
    pub fn dec(&self, model: &str) -> Option<u32> {
        let mut lag = self.lags.get_mut(model)?;
        *lag = lag.saturating_sub(1);
        Some(*lag)
    }

    pub fn get(&self, model: &str) -> Option<u32> {
        self.lags.get(model).map(|lag| *lag)
    }

    pub fn remove(&self, model: &str) -> Option<u32> {
        self.lags.remove(model).map(|(_, lag)| lag)
    }

    pub fn models(&self) -> Vec<String> {
        self.lags.iter().map(|entry| entry.key().clone()).collect()
    }
}

/// Unix seconds of the last access per model.
#[derive(Debug, Default)]
pub struct LastUsedKeeper {
    last_used: DashMap<String, i64>,
}

impl LastUsedKeeper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stamp the model with the current time and return it.
    pub fn touch(&self, model: &str) -> i64 {
        let now = Utc::now().timestamp();
        let mut last = self.last_used.entry(model.to_string()).or_insert(now);
        // Never move backwards if two accesses race.
        *last = (*last).max(now);
        *last
    }

    pub fn get(&self, model: &str) -> Option<i64> {
        self.last_used.get(model).map(|ts| *ts)
    }

    pub fn remove(&self, model: &str) -> Option<i64> {
        self.last_used.remove(model).map(|(_, ts)| ts)
    }
}
