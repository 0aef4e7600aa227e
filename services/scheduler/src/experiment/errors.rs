//! Experiment store errors.
//!
//! Messages are part of the external API and are returned to callers as-is.

use mlsched_events::ErrorKind;
use thiserror::Error;

pub type ExperimentResult<T> = Result<T, ExperimentError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExperimentError {
    #[error("Experiment not found {0}")]
    NotFound(String),

    /// `experiment` claims `resource` as its baseline, but `owner` already does.
    #[error("Resource {resource} already in experiment {experiment} as a baseline. A model or pipeline can only appear in one experiment as a baseline")]
    BaselineExists {
        experiment: String,
        resource: String,
        owner: String,
    },

    #[error("experiment {0} has no candidates or mirror")]
    NoCandidatesOrMirrors(String),

    #[error("default model/pipeline {default} not found in experiment {experiment} candidates")]
    DefaultNotFound { experiment: String, default: String },

    #[error("each candidate and mirror must be unique but found resource {resource} duplicated in experiment {experiment}")]
    NoDuplicates { experiment: String, resource: String },

    #[error("invalid experiment: {0}")]
    Invalid(String),
}

impl ExperimentError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::BaselineExists { .. } => ErrorKind::AlreadyExists,
            Self::NoCandidatesOrMirrors(_)
            | Self::DefaultNotFound { .. }
            | Self::NoDuplicates { .. }
            | Self::Invalid(_) => ErrorKind::Validation,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages_are_verbatim() {
        assert_eq!(
            ExperimentError::NotFound("a".to_string()).to_string(),
            "Experiment not found a"
        );
        assert_eq!(
            ExperimentError::NoDuplicates {
                experiment: "a".to_string(),
                resource: "model2".to_string(),
            }
            .to_string(),
            "each candidate and mirror must be unique but found resource model2 duplicated in experiment a"
        );
        assert_eq!(
            ExperimentError::BaselineExists {
                experiment: "a".to_string(),
                resource: "model1".to_string(),
                owner: "b".to_string(),
            }
            .to_string(),
            "Resource model1 already in experiment a as a baseline. A model or pipeline can only appear in one experiment as a baseline"
        );
    }

    #[test]
    fn test_kinds() {
        assert_eq!(
            ExperimentError::NotFound("a".to_string()).kind(),
            ErrorKind::NotFound
        );
        assert_eq!(
            ExperimentError::NoCandidatesOrMirrors("a".to_string()).kind(),
            ErrorKind::Validation
        );
        assert_eq!(
            ExperimentError::BaselineExists {
                experiment: "a".to_string(),
                resource: "m".to_string(),
                owner: "b".to_string(),
            }
            .kind(),
            ErrorKind::AlreadyExists
        );
    }
}
