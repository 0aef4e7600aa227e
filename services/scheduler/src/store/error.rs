//! Model/server store error types.

use mlsched_events::ErrorKind;
use mlsched_reconcile::ReconcileError;
use thiserror::Error;

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors from model/server store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("model not found: {0}")]
    ModelNotFound(String),

    #[error("server not found: {0}")]
    ServerNotFound(String),

    /// Replica bounds out of range (min > target or target > max).
    #[error("invalid replica bounds for model {model}: {message}")]
    InvalidReplicaBounds { model: String, message: String },

    #[error("invalid {resource}: {message}")]
    Invalid {
        resource: &'static str,
        message: String,
    },

    /// The model is draining after a delete and cannot be updated.
    #[error("model {0} is terminating")]
    ModelTerminating(String),

    /// No server passed the placement filters.
    #[error("no eligible server for model {model}: {reason}")]
    CapacityExhausted { model: String, reason: String },

    /// The update was superseded by a newer one.
    #[error("stale update for {resource}: {reason}")]
    StaleUpdate { resource: String, reason: String },

    #[error(transparent)]
    SpecHash(#[from] ReconcileError),
}

impl StoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::ModelNotFound(_) | Self::ServerNotFound(_) => ErrorKind::NotFound,
            Self::InvalidReplicaBounds { .. }
            | Self::Invalid { .. }
            | Self::ModelTerminating(_)
            | Self::SpecHash(_) => ErrorKind::Validation,
            Self::CapacityExhausted { .. } => ErrorKind::CapacityExhausted,
            Self::StaleUpdate { .. } => ErrorKind::StaleUpdate,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }

    pub fn is_stale(&self) -> bool {
        matches!(self, Self::StaleUpdate { .. })
    }

    pub fn is_validation(&self) -> bool {
        self.kind() == ErrorKind::Validation
    }

    pub(crate) fn stale(resource: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::StaleUpdate {
            resource: resource.into(),
            reason: reason.into(),
        }
    }
}
