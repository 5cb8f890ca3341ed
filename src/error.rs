//! Error taxonomy for the coordination engine
//!
//! Configuration errors indicate a setup mistake and are never retried.
//! Data errors are rejected at the boundary before anything is stored.
//! Handler failures never surface here; they become failed activation records.

use thiserror::Error;

/// Convenience alias used throughout the library
pub type Result<T> = std::result::Result<T, CoordinatorError>;

/// Cycle stage names reported by [`CoordinatorError::Cancelled`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleStage {
    Evaluate,
    Check,
    Dispatch,
}

impl std::fmt::Display for CycleStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CycleStage::Evaluate => write!(f, "evaluate"),
            CycleStage::Check => write!(f, "check"),
            CycleStage::Dispatch => write!(f, "dispatch"),
        }
    }
}

#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("invalid value for metric '{metric}': {reason}")]
    InvalidValue { metric: String, reason: String },

    #[error("invalid weights for dimension '{dimension}': {reason}")]
    InvalidWeight { dimension: String, reason: String },

    #[error("invalid threshold for trigger '{trigger}': {reason}")]
    InvalidThreshold { trigger: String, reason: String },

    #[error("invalid time range: {0}")]
    InvalidTimeRange(String),

    #[error("unknown dimension '{0}'")]
    UnknownDimension(String),

    #[error("unknown trigger '{0}'")]
    UnknownTrigger(String),

    #[error("trigger '{0}' is already registered")]
    DuplicateTrigger(String),

    #[error("dimension '{dimension}' is referenced by triggers: {}", triggers.join(", "))]
    DimensionInUse {
        dimension: String,
        triggers: Vec<String>,
    },

    #[error("no handler registered for action '{0}'")]
    UnknownAction(String),

    #[error("cycle cancelled before {stage} stage")]
    Cancelled { stage: CycleStage },
}

impl CoordinatorError {
    /// True for errors caused by how the engine was configured
    pub fn is_configuration_error(&self) -> bool {
        matches!(
            self,
            CoordinatorError::InvalidWeight { .. }
                | CoordinatorError::InvalidThreshold { .. }
                | CoordinatorError::UnknownDimension(_)
                | CoordinatorError::UnknownTrigger(_)
                | CoordinatorError::DuplicateTrigger(_)
                | CoordinatorError::DimensionInUse { .. }
                | CoordinatorError::UnknownAction(_)
        )
    }

    /// True for errors raised while validating producer data
    pub fn is_data_error(&self) -> bool {
        matches!(
            self,
            CoordinatorError::InvalidValue { .. } | CoordinatorError::InvalidTimeRange(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert!(CoordinatorError::UnknownDimension("load".into()).is_configuration_error());
        assert!(CoordinatorError::DuplicateTrigger("t".into()).is_configuration_error());
        assert!(!CoordinatorError::UnknownDimension("load".into()).is_data_error());

        let err = CoordinatorError::InvalidValue {
            metric: "cpu".into(),
            reason: "not a number".into(),
        };
        assert!(err.is_data_error());
        assert!(!err.is_configuration_error());

        let cancelled = CoordinatorError::Cancelled { stage: CycleStage::Check };
        assert!(!cancelled.is_configuration_error());
        assert_eq!(cancelled.to_string(), "cycle cancelled before check stage");
    }

    #[test]
    fn test_dimension_in_use_message() {
        let err = CoordinatorError::DimensionInUse {
            dimension: "load".into(),
            triggers: vec!["overload".into(), "idle".into()],
        };
        assert_eq!(
            err.to_string(),
            "dimension 'load' is referenced by triggers: overload, idle"
        );
    }
}
