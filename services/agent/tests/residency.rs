//! Integration tests for agent-side model residency.
//!
//! An agent serving requests:
//! 1. Loads models into its local cache, evicting cold ones when full
//! 2. Records lag and last-used for every request
//! 3. Stops tracking scaling signals of evicted models

use std::sync::Arc;
use std::thread;

use mlsched_agent::{
    CacheConfig, DataPlaneStatsCollector, DefaultPriority, LocalCacheConfig, LocalModelCache,
    PriorityCache,
};

fn serve(cache: &LocalModelCache, stats: &DataPlaneStatsCollector, model: &str, bytes: u64) {
    let outcome = cache.ensure_loaded(model, bytes).unwrap();
    for evicted in &outcome.evicted {
        stats.remove_model(&evicted.model);
    }
    stats.scaling_metrics_setup(model);
    stats.scaling_metrics_tear_down(model).unwrap();
}

#[test]
fn test_cold_models_are_evicted_and_untracked() {
    let cache = LocalModelCache::new(LocalCacheConfig {
        capacity_bytes: 1_000,
        cache: CacheConfig {
            default_priority: DefaultPriority::AboveMax,
        },
    });
    let stats = DataPlaneStatsCollector::default();

    serve(&cache, &stats, "iris", 400);
    serve(&cache, &stats, "mnist", 400);
    serve(&cache, &stats, "iris", 400);
    serve(&cache, &stats, "cifar", 400);

    assert!(cache.is_loaded("iris"));
    assert!(cache.is_loaded("cifar"));
    assert!(!cache.is_loaded("mnist"));

    let tracked: Vec<String> = stats.snapshot().into_iter().map(|s| s.model).collect();
    assert_eq!(tracked, vec!["cifar", "iris"]);

    let (ids, _) = cache.eviction_order();
    assert_eq!(ids, vec!["iris", "cifar"]);

    let counters = cache.stats();
    assert_eq!(counters.hits, 1);
    assert_eq!(counters.misses, 3);
    assert_eq!(counters.evictions, 1);
    assert_eq!(counters.used_bytes, 800);
}

#[test]
fn test_custom_cache_manager() {
    let inner = PriorityCache::new(CacheConfig {
        default_priority: DefaultPriority::Zero,
    });
    let cache = LocalModelCache::with_cache(
        LocalCacheConfig {
            capacity_bytes: 200,
            ..Default::default()
        },
        inner,
    );

    cache.ensure_loaded("a", 100).unwrap();
    cache.ensure_loaded("b", 100).unwrap();
    // Zero priority for all; ties evict the oldest add or update first.
    cache.touch("a").unwrap();
    let outcome = cache.ensure_loaded("c", 100).unwrap();
    assert_eq!(outcome.evicted[0].model, "b");
    assert_eq!(outcome.evicted[0].priority, 0);
}

#[test]
fn test_concurrent_loads_stay_within_capacity() {
    let cache = Arc::new(LocalModelCache::new(LocalCacheConfig {
        capacity_bytes: 1_000,
        cache: CacheConfig {
            default_priority: DefaultPriority::AboveMax,
        },
    }));

    let handles: Vec<_> = (0..8)
        .map(|i| {
            let cache = Arc::clone(&cache);
            thread::spawn(move || {
                for j in 0..50 {
                    cache.ensure_loaded(&format!("model-{}", (i * 7 + j) % 12), 300).unwrap();
                    assert!(cache.used_bytes() <= 1_000);
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let stats = cache.stats();
    assert_eq!(stats.resident_models, 3);
    assert_eq!(stats.used_bytes, 900);
    assert_eq!(cache.eviction_order().0.len(), 3);
    assert_eq!(stats.hits + stats.misses, 400);
}
