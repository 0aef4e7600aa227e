//! Error types shared across the workspace.

use thiserror::Error;

/// Coarse classification every component error maps onto.
///
/// Callers decide whether to retry, skip or surface an error by its kind,
/// not by the concrete component error type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The model, server, experiment or cache entry does not exist.
    NotFound,
    /// Duplicate add to a cache or a duplicate baseline claim.
    AlreadyExists,
    /// Referential-integrity or range violation; nothing was applied.
    Validation,
    /// No eligible server remained after filtering.
    CapacityExhausted,
    /// The update was superseded by a newer one and was dropped.
    StaleUpdate,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::NotFound => "not_found",
            ErrorKind::AlreadyExists => "already_exists",
            ErrorKind::Validation => "validation_error",
            ErrorKind::CapacityExhausted => "capacity_exhausted",
            ErrorKind::StaleUpdate => "stale_update",
        };
        write!(f, "{}", s)
    }
}

/// Errors that can occur when decoding events.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EventError {
    /// The replica state string is not one of the known states.
    #[error("unknown replica state: {0}")]
    UnknownReplicaState(String),

    /// The event payload is invalid.
    #[error("invalid event payload: {0}")]
    InvalidPayload(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for EventError {
    fn from(err: serde_json::Error) -> Self {
        EventError::Serialization(err.to_string())
    }
}
