use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{classifier::model::ClassifierModel, errors::LearningResult, persist};

/// Description of the active model written next to it as `model_config.json`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelConfig {
    /// Architecture tag.
    pub architecture: String,
    /// `[height, width, channels]`.
    pub input_shape: [u32; 3],
    /// Learning rate the weights were last trained with.
    pub learning_rate: f32,
    /// Number of classes.
    pub num_classes: usize,
    /// When this configuration was written.
    pub created_at: DateTime<Utc>,
}

impl ModelConfig {
    /// Describes `model` as trained with `learning_rate`.
    #[must_use]
    pub fn describe(model: &ClassifierModel, learning_rate: f32) -> Self {
        Self {
            architecture: model.architecture.clone(),
            input_shape: [model.input.height, model.input.width, 3],
            learning_rate,
            num_classes: 2,
            created_at: Utc::now(),
        }
    }

    /// Writes pretty JSON atomically.
    pub fn save(&self, path: impl AsRef<Path>) -> LearningResult<()> {
        let bytes = serde_json::to_vec_pretty(self)?;
        persist::write_atomic(path.as_ref(), &bytes)
    }

    /// Reads a saved configuration.
    pub fn load(path: impl AsRef<Path>) -> LearningResult<Self> {
        let bytes = std::fs::read(path.as_ref())?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}
