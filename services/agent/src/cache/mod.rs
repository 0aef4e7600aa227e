//! Cache eviction manager.
//!
//! A priority structure over opaque ids. The agent evicts the lowest priority
//! entry first when it needs memory for a new model. Ties break by the order
//! in which entries were last added or updated, oldest first.

mod priority;

use std::str::FromStr;

use chrono::Utc;
use mlsched_events::ErrorKind;
use thiserror::Error;

pub use priority::PriorityCache;

pub type CacheResult<T> = Result<T, CacheError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    #[error("id not found: {0}")]
    NotFound(String),

    #[error("id already exists: {0}")]
    AlreadyExists(String),

    /// Peek or evict on a cache with no entries.
    #[error("cache is empty")]
    Empty,

    #[error("unknown default priority policy: {0}")]
    InvalidDefaultPriority(String),
}

impl CacheError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound(_) | Self::Empty => ErrorKind::NotFound,
            Self::AlreadyExists(_) => ErrorKind::AlreadyExists,
            Self::InvalidDefaultPriority(_) => ErrorKind::Validation,
        }
    }

    /// True for an absent id and for an empty queue.
    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Self::Empty)
    }
}

/// Priority given by `add_default` and `update_default`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DefaultPriority {
    /// Unix time in milliseconds; recently used models are evicted last.
    #[default]
    CurrentTime,
    /// Zero; defaulted entries are evicted before any positive priority.
    Zero,
    /// One above the highest priority in the cache.
    AboveMax,
}

impl DefaultPriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CurrentTime => "current_time",
            Self::Zero => "zero",
            Self::AboveMax => "above_max",
        }
    }

    /// Resolve the policy given the highest priority currently held.
    pub fn resolve(&self, max_priority: Option<i64>) -> i64 {
        match self {
            Self::CurrentTime => Utc::now().timestamp_millis(),
            Self::Zero => 0,
            Self::AboveMax => max_priority.map_or(0, |max| max.saturating_add(1)),
        }
    }
}

impl FromStr for DefaultPriority {
    type Err = CacheError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "current_time" => Ok(Self::CurrentTime),
            "zero" => Ok(Self::Zero),
            "above_max" => Ok(Self::AboveMax),
            other => Err(CacheError::InvalidDefaultPriority(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CacheConfig {
    pub default_priority: DefaultPriority,
}

/// Priority-ordered set of ids.
pub trait CacheManager: Send + Sync {
    /// Insert `id`. Fails if it is already present.
    fn add(&self, id: &str, priority: i64) -> CacheResult<()>;

    /// Insert `id` with the configured default priority.
    fn add_default(&self, id: &str) -> CacheResult<()>;

    /// Change the priority of `id`. Fails if it is absent.
    fn update(&self, id: &str, priority: i64) -> CacheResult<()>;

    fn update_default(&self, id: &str) -> CacheResult<()>;

    fn exists(&self, id: &str) -> bool;

    fn get(&self, id: &str) -> CacheResult<i64>;

    /// Remove `id`. Fails if it is absent.
    fn delete(&self, id: &str) -> CacheResult<()>;

    /// Snapshot of all entries in eviction order.
    fn get_items(&self) -> (Vec<String>, Vec<i64>);

    /// The entry `evict` would remove next, without removing it.
    fn peek(&self) -> CacheResult<(String, i64)>;

    /// Remove and return the lowest priority entry.
    fn evict(&self) -> CacheResult<(String, i64)>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
