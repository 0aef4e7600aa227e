//! Convergence primitives for the scheduler.
//!
//! The scheduler converges placement toward desired state while reports and
//! desired-state changes arrive out of order from many sources. Key concepts:
//!
//! - **Generation**: a monotonic counter attached to every change. Anything
//!   older than the last applied generation is stale and is dropped.
//! - **Retry budget**: how many failures a resource may accumulate inside a
//!   window before it is considered failed.
//! - **Spec hash**: a stable digest of a desired spec, used to detect no-op
//!   updates.
//!
//! # Invariants
//!
//! - All operations are idempotent
//! - Decisions are deterministic given the same inputs
//! - Applied generations never go backwards

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Reconciliation errors.
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// A spec could not be serialized for hashing.
    #[error("failed to hash spec: {0}")]
    Hash(#[from] serde_json::Error),
}

/// A stable digest of a desired spec.
///
/// Two specs hash equal iff their JSON forms are equal. Object keys are
/// ordered by `serde_json`'s default map, so field order never matters.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SpecHash(String);

impl SpecHash {
    /// Hash any serializable spec.
    pub fn of<T: Serialize>(spec: &T) -> Result<Self, ReconcileError> {
        let value = serde_json::to_value(spec)?;
        let bytes = serde_json::to_vec(&value)?;
        let digest = Sha256::digest(&bytes);
        Ok(Self(format!("sha256:{}", hex::encode(&digest[..16]))))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SpecHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Last applied generation of one resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GenerationCheckpoint {
    last_applied: i64,
}

impl GenerationCheckpoint {
    pub fn new(last_applied: i64) -> Self {
        Self { last_applied }
    }

    pub fn last_applied(&self) -> i64 {
        self.last_applied
    }

    /// A generation older than the last applied one is stale. Equal is not:
    /// re-delivery of the current generation is allowed and must be idempotent.
    pub fn is_stale(&self, generation: i64) -> bool {
        generation < self.last_applied
    }

    /// Returns true if `generation` is strictly newer than the last applied one.
    pub fn is_newer(&self, generation: i64) -> bool {
        generation > self.last_applied
    }

    /// Record `generation` as applied. Never moves backwards.
    pub fn advance(&mut self, generation: i64) {
        if generation > self.last_applied {
            self.last_applied = generation;
        }
    }
}

/// Failure counter with a maximum per key inside a sliding window.
#[derive(Debug, Clone)]
pub struct RetryBudget<K: Ord> {
    max_retries: u32,
    window: Duration,
    /// key -> (failures, first failure in the current window)
    failures: BTreeMap<K, (u32, Instant)>,
}

impl<K: Ord> RetryBudget<K> {
    pub fn new(max_retries: u32, window: Duration) -> Self {
        Self {
            max_retries,
            window,
            failures: BTreeMap::new(),
        }
    }

    /// Record a failure for `key`.
    ///
    /// Returns true once the key has failed more than `max_retries` times in
    /// the current window.
    pub fn record_failure(&mut self, key: K) -> bool {
        let now = Instant::now();
        let (count, first) = self.failures.entry(key).or_insert((0, now));

        if now.duration_since(*first) > self.window {
            *count = 0;
            *first = now;
        }

        *count += 1;
        *count > self.max_retries
    }

    pub fn failures(&self, key: &K) -> u32 {
        match self.failures.get(key) {
            Some((count, first)) if first.elapsed() <= self.window => *count,
            _ => 0,
        }
    }

    pub fn is_exhausted(&self, key: &K) -> bool {
        self.failures(key) > self.max_retries
    }

    /// Forget failures for `key` (on success).
    pub fn clear(&mut self, key: &K) {
        self.failures.remove(key);
    }
}

/// Default retry budget for a replica that fails to load.
pub const DEFAULT_MAX_LOAD_RETRIES: u32 = 3;

/// Default window over which load failures are counted.
pub const DEFAULT_RETRY_WINDOW: Duration = Duration::from_secs(10 * 60);

/// Default interval between attempts to place unschedulable models.
pub const DEFAULT_RESCHEDULE_INTERVAL: Duration = Duration::from_secs(30);

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde::Serialize;

    #[derive(Serialize)]
    struct Spec {
        name: &'static str,
        replicas: u32,
        tags: Vec<&'static str>,
    }

    #[test]
    fn test_spec_hash_deterministic() {
        let json1 = serde_json::json!({"b": 2, "a": 1});
        let json2 = serde_json::json!({"a": 1, "b": 2});

        assert_eq!(SpecHash::of(&json1).unwrap(), SpecHash::of(&json2).unwrap());
    }

    #[test]
    fn test_spec_hash_changes_with_spec() {
        let a = Spec {
            name: "iris",
            replicas: 1,
            tags: vec!["sklearn"],
        };
        let b = Spec {
            name: "iris",
            replicas: 2,
            tags: vec!["sklearn"],
        };

        let hash = SpecHash::of(&a).unwrap();
        assert!(hash.as_str().starts_with("sha256:"));
        assert_ne!(hash, SpecHash::of(&b).unwrap());
    }

    #[test]
    fn test_generation_checkpoint() {
        let mut cp = GenerationCheckpoint::new(5);

        assert!(cp.is_stale(4));
        assert!(!cp.is_stale(5));
        assert!(!cp.is_newer(5));
        assert!(cp.is_newer(6));

        cp.advance(3);
        assert_eq!(cp.last_applied(), 5);
        cp.advance(8);
        assert_eq!(cp.last_applied(), 8);
        assert!(cp.is_stale(7));
    }

    #[test]
    fn test_retry_budget() {
        let mut budget = RetryBudget::new(3, Duration::from_secs(60));

        assert!(!budget.record_failure(1u32)); // 1st
        assert!(!budget.record_failure(1u32)); // 2nd
        assert!(!budget.record_failure(1u32)); // 3rd
        assert!(budget.record_failure(1u32)); // 4th - exhausted

        assert!(budget.is_exhausted(&1));
        assert!(!budget.is_exhausted(&2));
        assert_eq!(budget.failures(&1), 4);

        budget.clear(&1);
        assert!(!budget.is_exhausted(&1));
    }

    #[test]
    fn test_retry_budget_zero_retries_fails_first_time() {
        let mut budget = RetryBudget::new(0, Duration::from_secs(60));
        assert!(budget.record_failure("replica-0"));
    }

    proptest! {
        #[test]
        fn prop_checkpoint_never_regresses(gens in proptest::collection::vec(-100i64..100, 0..50)) {
            let mut cp = GenerationCheckpoint::default();
            let mut max = 0i64;
            for g in gens {
                cp.advance(g);
                max = max.max(g);
                prop_assert_eq!(cp.last_applied(), max);
            }
        }
    }
}
