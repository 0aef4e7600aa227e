//! Capacity-aware local model cache.
//!
//! Tracks which models are resident on this server and how much memory they
//! hold. Loading a model that does not fit evicts resident models in cache
//! priority order until it does; models larger than the whole budget are
//! rejected outright.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use mlsched_events::{ErrorKind, EvictionDecision};
use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::cache::{CacheConfig, CacheError, CacheManager, PriorityCache};

/// Configuration for the local model cache.
#[derive(Debug, Clone, Copy)]
pub struct LocalCacheConfig {
    /// Memory available to resident models.
    pub capacity_bytes: u64,
    pub cache: CacheConfig,
}

impl Default for LocalCacheConfig {
    fn default() -> Self {
        Self {
            capacity_bytes: 8 * 1024 * 1024 * 1024, // 8 GiB
            cache: CacheConfig::default(),
        }
    }
}

pub type LocalCacheResult<T> = Result<T, LocalCacheError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LocalCacheError {
    #[error("model {model} needs {memory_bytes} bytes but the cache holds {capacity_bytes}")]
    TooLarge {
        model: String,
        memory_bytes: u64,
        capacity_bytes: u64,
    },

    #[error(transparent)]
    Cache(#[from] CacheError),
}

impl LocalCacheError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::TooLarge { .. } => ErrorKind::CapacityExhausted,
            Self::Cache(err) => err.kind(),
        }
    }
}

/// Result of [`LocalModelCache::ensure_loaded`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadOutcome {
    /// The model was resident before the call.
    pub already_loaded: bool,
    /// Models evicted to make room, in eviction order.
    pub evicted: Vec<EvictionDecision>,
}

#[derive(Debug, Default)]
struct LocalCacheCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    used_bytes: AtomicU64,
}

/// Point-in-time copy of the cache counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LocalCacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub used_bytes: u64,
    pub resident_models: usize,
}

/// Resident models of one server, bounded by a memory budget.
pub struct LocalModelCache<C: CacheManager = PriorityCache> {
    config: LocalCacheConfig,
    cache: C,
    /// Resident model name to memory held.
    resident: Mutex<HashMap<String, u64>>,
    counters: LocalCacheCounters,
}

impl LocalModelCache<PriorityCache> {
    pub fn new(config: LocalCacheConfig) -> Self {
        Self::with_cache(config, PriorityCache::new(config.cache))
    }
}

impl Default for LocalModelCache<PriorityCache> {
    fn default() -> Self {
        Self::new(LocalCacheConfig::default())
    }
}

impl<C: CacheManager> LocalModelCache<C> {
    /// Wrap an existing cache manager. `cache` must start empty.
    pub fn with_cache(config: LocalCacheConfig, cache: C) -> Self {
        Self {
            config,
            cache,
            resident: Mutex::new(HashMap::new()),
            counters: LocalCacheCounters::default(),
        }
    }

    pub fn config(&self) -> &LocalCacheConfig {
        &self.config
    }

    /// Resident models and their priorities, next eviction first.
    pub fn eviction_order(&self) -> (Vec<String>, Vec<i64>) {
        let _resident = self.resident.lock();
        self.cache.get_items()
    }

    /// Make `model` resident, evicting others if it does not fit.
    ///
    /// A resident model is only touched. Nothing is evicted when the model
    /// can never fit.
    pub fn ensure_loaded(&self, model: &str, memory_bytes: u64) -> LocalCacheResult<LoadOutcome> {
        let mut resident = self.resident.lock();

        if resident.contains_key(model) {
            self.cache.update_default(model)?;
            self.counters.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(LoadOutcome {
                already_loaded: true,
                evicted: Vec::new(),
            });
        }
        self.counters.misses.fetch_add(1, Ordering::Relaxed);

        if memory_bytes > self.config.capacity_bytes {
            warn!(
                model = %model,
                memory_bytes,
                capacity_bytes = self.config.capacity_bytes,
                "Model larger than local cache"
            );
            return Err(LocalCacheError::TooLarge {
                model: model.to_string(),
                memory_bytes,
                capacity_bytes: self.config.capacity_bytes,
            });
        }

        let mut used: u64 = resident.values().sum();
        let mut evicted = Vec::new();
        while used.saturating_add(memory_bytes) > self.config.capacity_bytes {
            let (victim, priority) = self.cache.evict()?;
            let freed_bytes = resident.remove(&victim).unwrap_or_default();
            used = used.saturating_sub(freed_bytes);
            self.counters.evictions.fetch_add(1, Ordering::Relaxed);
            debug!(model = %victim, priority, freed_bytes, "Evicted model");
            evicted.push(EvictionDecision {
                model: victim,
                priority,
                freed_bytes,
            });
        }

        self.cache.add_default(model)?;
        resident.insert(model.to_string(), memory_bytes);
        self.counters
            .used_bytes
            .store(used + memory_bytes, Ordering::Relaxed);

        if !evicted.is_empty() {
            info!(
                model = %model,
                evicted = evicted.len(),
                "Evicted models to make room"
            );
        }

        Ok(LoadOutcome {
            already_loaded: false,
            evicted,
        })
    }

    /// Record an access to a resident model.
    pub fn touch(&self, model: &str) -> LocalCacheResult<()> {
        let _resident = self.resident.lock();
        self.cache.update_default(model)?;
        Ok(())
    }

    /// Pin a resident model's priority to an explicit value.
    pub fn set_priority(&self, model: &str, priority: i64) -> LocalCacheResult<()> {
        let _resident = self.resident.lock();
        self.cache.update(model, priority)?;
        Ok(())
    }

    /// Drop a resident model. Returns the memory it held.
    pub fn unload(&self, model: &str) -> LocalCacheResult<u64> {
        let mut resident = self.resident.lock();
        let freed = resident
            .remove(model)
            .ok_or_else(|| CacheError::NotFound(model.to_string()))?;
        self.cache.delete(model)?;
        self.counters
            .used_bytes
            .fetch_sub(freed, Ordering::Relaxed);
        debug!(model = %model, freed_bytes = freed, "Unloaded model");
        Ok(freed)
    }

    pub fn is_loaded(&self, model: &str) -> bool {
        self.resident.lock().contains_key(model)
    }

    pub fn used_bytes(&self) -> u64 {
        self.counters.used_bytes.load(Ordering::Relaxed)
    }

    pub fn available_bytes(&self) -> u64 {
        self.config.capacity_bytes.saturating_sub(self.used_bytes())
    }

    pub fn stats(&self) -> LocalCacheStats {
        let resident_models = self.resident.lock().len();
        LocalCacheStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
            used_bytes: self.used_bytes(),
            resident_models,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::DefaultPriority;

    fn local(capacity_bytes: u64) -> LocalModelCache {
        LocalModelCache::new(LocalCacheConfig {
            capacity_bytes,
            cache: CacheConfig {
                default_priority: DefaultPriority::AboveMax,
            },
        })
    }

    #[test]
    fn test_loads_without_eviction_when_it_fits() {
        let cache = local(1_000);
        let outcome = cache.ensure_loaded("iris", 400).unwrap();
        assert_eq!(outcome, LoadOutcome::default());

        cache.ensure_loaded("mnist", 600).unwrap();
        assert_eq!(cache.used_bytes(), 1_000);
        assert_eq!(cache.available_bytes(), 0);
    }

    #[test]
    fn test_evicts_least_recently_used_until_fit() {
        let cache = local(1_000);
        cache.ensure_loaded("a", 300).unwrap();
        cache.ensure_loaded("b", 300).unwrap();
        cache.ensure_loaded("c", 300).unwrap();
        cache.touch("a").unwrap();

        let outcome = cache.ensure_loaded("d", 600).unwrap();
        let evicted: Vec<&str> = outcome.evicted.iter().map(|e| e.model.as_str()).collect();
        assert_eq!(evicted, vec!["b", "c"]);
        assert_eq!(outcome.evicted[0].freed_bytes, 300);

        assert!(cache.is_loaded("a"));
        assert!(cache.is_loaded("d"));
        assert!(!cache.is_loaded("b"));
        assert_eq!(cache.used_bytes(), 900);
        assert_eq!(cache.cache.len(), 2);
    }

    #[test]
    fn test_resident_model_is_a_hit() {
        let cache = local(1_000);
        cache.ensure_loaded("iris", 400).unwrap();
        let outcome = cache.ensure_loaded("iris", 400).unwrap();
        assert!(outcome.already_loaded);

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.resident_models, 1);
    }

    #[test]
    fn test_oversized_model_evicts_nothing() {
        let cache = local(1_000);
        cache.ensure_loaded("iris", 400).unwrap();

        let err = cache.ensure_loaded("llm", 2_000).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CapacityExhausted);
        assert!(cache.is_loaded("iris"));
        assert_eq!(cache.stats().evictions, 0);
    }

    #[test]
    fn test_unload_frees_memory() {
        let cache = local(1_000);
        cache.ensure_loaded("iris", 400).unwrap();
        assert_eq!(cache.unload("iris").unwrap(), 400);
        assert_eq!(cache.used_bytes(), 0);
        assert!(!cache.cache.exists("iris"));

        let err = cache.unload("iris").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert!(cache.touch("iris").is_err());
    }

    #[test]
    fn test_explicit_priority_protects_model() {
        let cache = local(1_000);
        cache.ensure_loaded("a", 500).unwrap();
        cache.ensure_loaded("b", 500).unwrap();
        cache.set_priority("a", i64::MAX).unwrap();

        let outcome = cache.ensure_loaded("c", 500).unwrap();
        assert_eq!(outcome.evicted[0].model, "b");
        assert!(cache.is_loaded("a"));
    }
}
