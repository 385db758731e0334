use std::path::PathBuf;

use thiserror::Error;

/// Errors raised by preprocessing, training and model persistence.
#[derive(Debug, Error)]
pub enum LearningError {
    /// No labeled samples were found where training data was expected.
    #[error("no labeled images found under {0}")]
    EmptyDataset(PathBuf),
    /// Feature or weight dimensions disagree.
    #[error("shape mismatch: expected {expected}, found {found}")]
    ShapeMismatch {
        /// Expected dimension.
        expected: usize,
        /// Dimension actually seen.
        found: usize,
    },
    /// Operation requires trained weights.
    #[error("model has no trained head")]
    NotTrained,
    /// Image could not be decoded.
    #[error("image decode error: {0}")]
    Image(#[from] image::ImageError),
    /// Filesystem failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// JSON encode/decode failure.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    /// Configuration values out of range.
    #[error("invalid training configuration: {0}")]
    InvalidConfig(String),
}

/// Result alias for learning operations.
pub type LearningResult<T> = Result<T, LearningError>;
