use std::{
    path::PathBuf,
    sync::Arc,
    time::{Duration, Instant},
};

use chrono::{DateTime, Utc};
use pawgate_learning::{
    dataset_statistics, DatasetStats, EvaluationMetrics, ModelConfig, ModelPaths, Preprocessor,
};
use serde::Serialize;

use crate::{
    error::{ServingError, ServingResult},
    gatekeeper::{Gatekeeper, GatekeeperDecision},
    inference::{InferenceService, Prediction},
    retrain::RetrainOrchestrator,
};

/// Body of a classification request.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum ClassifyResponse {
    /// The domain model ran.
    Classified {
        /// Model output.
        #[serde(flatten)]
        prediction: Prediction,
        /// Seconds spent decoding, gating and scoring.
        prediction_time: f64,
        /// Always true.
        is_valid: bool,
        /// Gate decision that let the image through.
        gatekeeper: GatekeeperDecision,
    },
    /// The gate rejected the image.
    Rejected {
        /// Always `unknown`.
        predicted_class: String,
        /// Always `unknown`.
        class: String,
        /// Always 0.
        confidence: f32,
        /// Seconds spent decoding and gating.
        prediction_time: f64,
        /// Always false.
        is_valid: bool,
        /// Display label of what the detector saw.
        detected_object: String,
        /// `This appears to be: <object>`.
        message: String,
    },
}

/// Body of `/status`.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ServiceStatus {
    /// Always `running`.
    pub status: &'static str,
    /// True when a model is installed.
    pub model_loaded: bool,
    /// Installed model version.
    pub model_version: u64,
    /// `Hh Mm Ss`.
    pub uptime: String,
    /// Predictions since start-up.
    pub total_predictions: u64,
    /// Successful retrains since start-up.
    pub total_retrains: u64,
    /// True while a retrain runs.
    pub is_retraining: bool,
}

/// Body of `/dataset-stats`.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct DatasetOverview {
    /// Initial training corpus.
    pub training: DatasetStats,
    /// Held-out test corpus.
    pub testing: DatasetStats,
    /// Accumulated uploads.
    pub retraining: DatasetStats,
}

/// Process-scoped state shared by every request handler.
#[derive(Debug)]
pub struct AppState {
    /// Active-model scoring.
    pub inference: Arc<InferenceService>,
    /// Pre-classification gate.
    pub gatekeeper: Gatekeeper,
    /// Background retraining and the upload corpus.
    pub retrain: Arc<RetrainOrchestrator>,
    /// Model directory layout.
    pub paths: ModelPaths,
    /// Initial training corpus.
    pub train_dir: PathBuf,
    /// Held-out test corpus.
    pub test_dir: PathBuf,
    started: Instant,
    started_at: DateTime<Utc>,
}

impl AppState {
    /// Bundles the components and starts the uptime clock.
    #[must_use]
    pub fn new(
        inference: Arc<InferenceService>,
        gatekeeper: Gatekeeper,
        retrain: Arc<RetrainOrchestrator>,
        paths: ModelPaths,
        train_dir: PathBuf,
        test_dir: PathBuf,
    ) -> Self {
        Self {
            inference,
            gatekeeper,
            retrain,
            paths,
            train_dir,
            test_dir,
            started: Instant::now(),
            started_at: Utc::now(),
        }
    }

    /// Wall-clock start time.
    #[must_use]
    pub const fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Decodes an upload, runs the gate and, if admitted, the classifier.
    pub fn classify(&self, bytes: &[u8]) -> ServingResult<ClassifyResponse> {
        let begin = Instant::now();
        if !self.inference.handle().is_loaded() {
            return Err(ServingError::ModelNotLoaded);
        }
        let image = Preprocessor::decode(bytes)?;
        let decision = self.gatekeeper.inspect(&image)?;
        if let GatekeeperDecision::Rejected {
            detected_object, ..
        } = &decision
        {
            return Ok(ClassifyResponse::Rejected {
                predicted_class: "unknown".into(),
                class: "unknown".into(),
                confidence: 0.0,
                prediction_time: begin.elapsed().as_secs_f64(),
                is_valid: false,
                message: format!("This appears to be: {detected_object}"),
                detected_object: detected_object.clone(),
            });
        }
        let prediction = self.inference.predict(&image)?;
        Ok(ClassifyResponse::Classified {
            prediction,
            prediction_time: begin.elapsed().as_secs_f64(),
            is_valid: true,
            gatekeeper: decision,
        })
    }

    /// Process status summary.
    #[must_use]
    pub fn status(&self) -> ServiceStatus {
        let retrain = self.retrain.status();
        ServiceStatus {
            status: "running",
            model_loaded: self.inference.handle().is_loaded(),
            model_version: self.inference.handle().version(),
            uptime: format_uptime(self.started.elapsed()),
            total_predictions: self.inference.total_predictions(),
            total_retrains: retrain.total_retrains,
            is_retraining: retrain.is_retraining,
        }
    }

    /// Image counts of the three corpora.
    #[must_use]
    pub fn dataset_overview(&self) -> DatasetOverview {
        DatasetOverview {
            training: dataset_statistics(&self.train_dir),
            testing: dataset_statistics(&self.test_dir),
            retraining: self.retrain.dataset().stats(),
        }
    }

    /// Persisted evaluation metrics.
    pub fn metrics(&self) -> ServingResult<EvaluationMetrics> {
        let path = self.paths.metrics();
        if !path.exists() {
            return Err(ServingError::NotFound("metrics".into()));
        }
        Ok(EvaluationMetrics::load(path)?)
    }

    /// Persisted model configuration.
    pub fn model_config(&self) -> ServingResult<ModelConfig> {
        let path = self.paths.config();
        if !path.exists() {
            return Err(ServingError::NotFound("model configuration".into()));
        }
        Ok(ModelConfig::load(path)?)
    }
}

/// `Hh Mm Ss` rendering of an uptime.
#[must_use]
pub fn format_uptime(elapsed: Duration) -> String {
    let total = elapsed.as_secs();
    let (hours, rest) = (total / 3600, total % 3600);
    format!("{hours}h {}m {}s", rest / 60, rest % 60)
}
