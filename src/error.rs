//! Error taxonomy for the inference core
//!
//! Every failure is classified into one of four kinds. Input errors are
//! rejected requests, initialization and invariant errors are fatal, and
//! numeric errors come from the tensor engine itself.

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias for inference operations
pub type Result<T> = std::result::Result<T, BoneAgeError>;

/// Broad classification used by callers to decide how to respond
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad request data; reported to the caller, never retried
    Input,
    /// Checkpoint or architecture problem; nothing may be served
    Initialization,
    /// Programming-contract violation
    Invariant,
    /// Failure inside the tensor engine
    Numeric,
}

#[derive(Error, Debug)]
pub enum BoneAgeError {
    /// Image bytes could not be decoded or the image is empty
    #[error("Invalid image: {0}")]
    InvalidImage(String),

    /// A caller-supplied argument is out of range
    #[error("Invalid argument {name}: {reason}")]
    InvalidArgument { name: String, reason: String },

    /// Configuration the pipeline cannot run with
    #[error("Invalid configuration {name}: {reason}")]
    InvalidConfig { name: String, reason: String },

    /// No checkpoint file exists for any gender
    #[error("No usable checkpoint: {0}")]
    CheckpointMissing(String),

    /// The checkpoint is not in the supported versioned format
    #[error("Unsupported checkpoint format in {path:?}: {reason}")]
    CheckpointFormat { path: PathBuf, reason: String },

    /// Weights could not be read or bound to the architecture
    #[error("Failed to load model from {path:?}: {reason}")]
    ModelLoad { path: PathBuf, reason: String },

    /// A tensor had a shape the architecture does not produce
    #[error("Shape mismatch in {operation}: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        operation: String,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    /// Explainability contract broken (e.g. no captured gradient)
    #[error("Invariant violated: {0}")]
    Invariant(String),

    #[error("Tensor operation failed: {0}")]
    Tensor(#[from] candle_core::Error),
}

impl BoneAgeError {
    pub fn invalid_argument(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            name: name.into(),
            reason: reason.into(),
        }
    }

    pub fn invalid_config(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            name: name.into(),
            reason: reason.into(),
        }
    }

    pub fn shape_mismatch(
        operation: impl Into<String>,
        expected: Vec<usize>,
        actual: Vec<usize>,
    ) -> Self {
        Self::ShapeMismatch {
            operation: operation.into(),
            expected,
            actual,
        }
    }

    pub fn model_load(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        Self::ModelLoad {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    pub fn checkpoint_format(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::CheckpointFormat {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidImage(_) | Self::InvalidArgument { .. } => ErrorKind::Input,
            Self::InvalidConfig { .. }
            | Self::CheckpointMissing(_)
            | Self::CheckpointFormat { .. }
            | Self::ModelLoad { .. }
            | Self::ShapeMismatch { .. } => ErrorKind::Initialization,
            Self::Invariant(_) => ErrorKind::Invariant,
            Self::Tensor(_) => ErrorKind::Numeric,
        }
    }

    /// Fatal errors must stop serving until the cause is fixed
    pub fn is_fatal(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Initialization | ErrorKind::Invariant
        )
    }
}

impl From<image::ImageError> for BoneAgeError {
    fn from(e: image::ImageError) -> Self {
        Self::InvalidImage(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        assert_eq!(
            BoneAgeError::InvalidImage("bad".into()).kind(),
            ErrorKind::Input
        );
        assert_eq!(
            BoneAgeError::shape_mismatch("forward", vec![1, 4], vec![1, 3]).kind(),
            ErrorKind::Initialization
        );
        assert!(BoneAgeError::Invariant("no capture".into()).is_fatal());
        assert!(BoneAgeError::invalid_config("architecture.num_groups", "5 != 4").is_fatal());
        assert!(!BoneAgeError::invalid_argument("alpha", "out of range").is_fatal());
    }

    #[test]
    fn test_shape_mismatch_message() {
        let err = BoneAgeError::shape_mismatch("grp head", vec![1, 4], vec![1, 5]);
        assert_eq!(
            err.to_string(),
            "Shape mismatch in grp head: expected [1, 4], got [1, 5]"
        );
    }
}
