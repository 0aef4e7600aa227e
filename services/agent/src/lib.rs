//! Agent-side model residency: the cache eviction manager, the
//! capacity-aware local model cache built on it, and the scaling stats
//! collector fed by request-handling paths.

pub mod cache;
pub mod config;
pub mod local;
pub mod modelscaling;

pub use cache::{CacheConfig, CacheError, CacheManager, DefaultPriority, PriorityCache};
pub use config::AgentConfig;
pub use local::{LoadOutcome, LocalCacheConfig, LocalCacheError, LocalModelCache};
pub use modelscaling::{DataPlaneStatsCollector, ModelScalingSignal, StatsError};
