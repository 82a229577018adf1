//! Error types for checkpoint handling and layer stacking.

use std::path::PathBuf;

use thiserror::Error;

/// Result type for stack engine operations.
pub type StackResult<T> = Result<T, StackError>;

/// Errors raised while reading, writing or growing a checkpoint.
///
/// `InvalidDepth`, `CorruptState` and `NotFound` are never retryable: they
/// point at a configuration mistake or a broken earlier stage.
#[derive(Debug, Error)]
pub enum StackError {
    /// Requested growth or declared depth is not usable
    #[error("invalid depth: {0}")]
    InvalidDepth(String),

    /// Layer blocks are missing, duplicated or disagree with the metadata
    #[error("corrupt checkpoint state: {0}")]
    CorruptState(String),

    /// No completed checkpoint at the expected location
    #[error("no completed checkpoint found at {}", .0.display())]
    NotFound(PathBuf),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Tensor (de)serialization failed
    #[error("candle error: {0}")]
    Candle(#[from] candle_core::Error),

    /// Manifest or sidecar could not be parsed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl StackError {
    pub fn invalid_depth(msg: impl Into<String>) -> Self {
        Self::InvalidDepth(msg.into())
    }

    pub fn corrupt(msg: impl Into<String>) -> Self {
        Self::CorruptState(msg.into())
    }

    pub fn not_found(path: impl Into<PathBuf>) -> Self {
        Self::NotFound(path.into())
    }

    /// Whether a caller may reasonably try the same operation again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Io(_))
    }
}
