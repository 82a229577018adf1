//! Error types for growth plans and stage orchestration.

use std::path::PathBuf;

use stack_engine::StackError;
use thiserror::Error;

use crate::train::StageStatus;

/// Problems found while reading or validating a growth plan.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read plan {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid plan file: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("plan has no stages")]
    Empty,

    #[error("stage {stage}: {message}")]
    Stage { stage: String, message: String },

    #[error("unknown preset '{0}'")]
    UnknownPreset(String),

    #[error("invalid device list '{0}' (expected 'cpu' or comma separated ids)")]
    Devices(String),
}

impl ConfigError {
    pub fn stage(stage: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Stage {
            stage: stage.into(),
            message: message.into(),
        }
    }
}

/// Failure reported by the training engine. Opaque to the orchestrator.
#[derive(Debug, Error)]
#[error("training failed: {message}")]
pub struct TrainingFailure {
    pub message: String,
    pub exit_code: Option<i32>,
}

impl TrainingFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            exit_code: None,
        }
    }

    pub fn with_exit_code(mut self, code: Option<i32>) -> Self {
        self.exit_code = code;
        self
    }

    pub fn interrupted() -> Self {
        Self::new("interrupted by operator")
    }
}

impl From<StackError> for TrainingFailure {
    fn from(e: StackError) -> Self {
        Self::new(format!("engine checkpoint hand-off: {}", e))
    }
}

/// Status change the stage state machine does not allow.
#[derive(Debug, Error)]
#[error("illegal stage transition {from:?} -> {to:?}")]
pub struct InvalidTransition {
    pub from: StageStatus,
    pub to: StageStatus,
}

/// What went wrong inside a single stage.
#[derive(Debug, Error)]
pub enum StageFailure {
    #[error(transparent)]
    Checkpoint(#[from] StackError),

    #[error(transparent)]
    Training(#[from] TrainingFailure),

    #[error("stage log: {0}")]
    Log(#[from] std::io::Error),

    #[error(transparent)]
    Transition(#[from] InvalidTransition),
}

/// A stage failure tagged with the stage it happened in.
#[derive(Debug, Error)]
#[error("stage {} ({name}) failed: {source}", index + 1)]
pub struct StageError {
    pub index: usize,
    pub name: String,
    #[source]
    pub source: StageFailure,
}

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Stage(#[from] StageError),

    #[error(
        "run directory is inconsistent: stage {} ({completed}) is completed but earlier stage {} ({missing}) is not",
        completed_index + 1,
        missing_index + 1
    )]
    InconsistentRun {
        completed_index: usize,
        completed: String,
        missing_index: usize,
        missing: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn test_stage_error_keeps_source_unchanged() {
        let err = StageError {
            index: 1,
            name: "grow-12".to_string(),
            source: StageFailure::from(StackError::invalid_depth("growth increment -6 is negative")),
        };
        assert_eq!(
            err.to_string(),
            "stage 2 (grow-12) failed: invalid depth: growth increment -6 is negative"
        );
        let source = err.source().expect("source");
        assert_eq!(
            source.to_string(),
            "invalid depth: growth increment -6 is negative"
        );
        assert!(matches!(
            err.source,
            StageFailure::Checkpoint(StackError::InvalidDepth(_))
        ));
    }

    #[test]
    fn test_training_failure_display() {
        let failure = TrainingFailure::new("engine exited with status 1").with_exit_code(Some(1));
        assert_eq!(failure.to_string(), "training failed: engine exited with status 1");
        assert_eq!(failure.exit_code, Some(1));
        assert_eq!(
            TrainingFailure::interrupted().message,
            "interrupted by operator"
        );
    }

    #[test]
    fn test_inconsistent_run_message() {
        let err = OrchestratorError::InconsistentRun {
            completed_index: 2,
            completed: "stage3".into(),
            missing_index: 1,
            missing: "stage2".into(),
        };
        assert!(err.to_string().contains("stage 3 (stage3) is completed"));
        assert!(err.to_string().contains("stage 2 (stage2) is not"));
    }
}
