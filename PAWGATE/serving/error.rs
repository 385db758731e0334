use pawgate_learning::LearningError;
use thiserror::Error;

/// Errors surfaced by the serving components.
#[derive(Debug, Error)]
pub enum ServingError {
    /// No active model is loaded.
    #[error("model not loaded")]
    ModelNotLoaded,
    /// Request payload is unusable.
    #[error("invalid input: {0}")]
    InvalidInput(String),
    /// A retrain job is already running.
    #[error("retraining already in progress")]
    RetrainConflict,
    /// Background retraining failed; recorded, never returned to the trigger caller.
    #[error("retraining failed: {0}")]
    RetrainFailure(String),
    /// A persisted artefact does not exist.
    #[error("{0} not found")]
    NotFound(String),
    /// Upload could not be decoded as an image.
    #[error("invalid image: {0}")]
    Image(#[from] image::ImageError),
    /// Filesystem failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// JSON encode/decode failure.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    /// Model or training failure.
    #[error(transparent)]
    Learning(LearningError),
    /// Telemetry or storage plumbing failure.
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl From<LearningError> for ServingError {
    fn from(err: LearningError) -> Self {
        match err {
            LearningError::Image(err) => Self::Image(err),
            other => Self::Learning(other),
        }
    }
}

impl ServingError {
    /// HTTP status code the error maps to.
    #[must_use]
    pub const fn status_code(&self) -> u16 {
        match self {
            Self::ModelNotLoaded => 503,
            Self::InvalidInput(_) | Self::Image(_) => 400,
            Self::RetrainConflict => 409,
            Self::NotFound(_) => 404,
            Self::RetrainFailure(_)
            | Self::Io(_)
            | Self::Json(_)
            | Self::Learning(_)
            | Self::Internal(_) => 500,
        }
    }
}

/// Result alias for serving operations.
pub type ServingResult<T> = Result<T, ServingError>;
