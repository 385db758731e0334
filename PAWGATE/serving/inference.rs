use std::{
    path::Path,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use chrono::{DateTime, Utc};
use image::RgbImage;
use pawgate_learning::{BinaryClassifier, ClassifierModel, CLASS_NAMES};
use serde::{Deserialize, Serialize};
use serde_json::json;
use shared_logging::{LogLevel, RecordLog};

use crate::{
    error::{ServingError, ServingResult},
    model_handle::{LoadedModel, ModelHandle},
    telemetry::ServingTelemetry,
};

/// Single-image classification result.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Prediction {
    /// Predicted class name.
    pub class: String,
    /// Same as `class`.
    pub predicted_class: String,
    /// 0 = cats, 1 = dogs.
    pub class_index: u8,
    /// Raw `P(dog)`.
    pub probability: f32,
    /// Probability of the predicted class.
    pub confidence: f32,
    /// `confidence` as a percentage with two decimals.
    pub confidence_percentage: String,
    /// Human-readable confidence band.
    pub explanation: String,
    /// Prediction time.
    pub timestamp: DateTime<Utc>,
}

impl Prediction {
    /// Interprets a `P(dog)` output; anything strictly above 0.5 is a dog.
    #[must_use]
    pub fn from_probability(probability: f32) -> Self {
        let class_index = u8::from(probability > 0.5);
        let class = CLASS_NAMES[usize::from(class_index)].to_string();
        let confidence = if class_index == 1 {
            probability
        } else {
            1.0 - probability
        };
        Self {
            explanation: explain(&class, confidence),
            predicted_class: class.clone(),
            class,
            class_index,
            probability,
            confidence,
            confidence_percentage: percentage(confidence),
            timestamp: Utc::now(),
        }
    }
}

fn percentage(value: f32) -> String {
    format!("{:.2}%", value * 100.0)
}

fn explain(class: &str, confidence: f32) -> String {
    if confidence >= 0.9 {
        format!("Very confident that this is a {class}")
    } else if confidence >= 0.7 {
        format!("Confident that this is a {class}")
    } else if confidence >= 0.5 {
        format!("Likely a {class}")
    } else {
        "Uncertain prediction".to_string()
    }
}

/// Line of the prediction log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PredictionRecord {
    /// Predicted class.
    pub class: String,
    /// Raw `P(dog)`.
    pub probability: f32,
    /// Probability of the predicted class.
    pub confidence: f32,
    /// Prediction time.
    pub timestamp: DateTime<Utc>,
    /// Model version that served the prediction.
    #[serde(default)]
    pub model_version: u64,
}

/// Class with its probability, as returned by `top_predictions`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RankedClass {
    /// Class name.
    pub class: String,
    /// Probability of the class.
    pub probability: f32,
    /// Probability as a percentage string.
    pub percentage: String,
}

/// Aggregates over the prediction log.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PredictionStatistics {
    /// Logged predictions.
    pub total_predictions: usize,
    /// Predictions of `cats`.
    pub cats_predicted: usize,
    /// Predictions of `dogs`.
    pub dogs_predicted: usize,
    /// Mean confidence, zero for an empty log.
    pub average_confidence: f64,
}

/// Scores images against the active model.
#[derive(Debug)]
pub struct InferenceService {
    handle: Arc<ModelHandle>,
    predictions: AtomicU64,
    log: Option<RecordLog<PredictionRecord>>,
    telemetry: ServingTelemetry,
}

impl InferenceService {
    /// Service over `handle`, logging predictions to `log` when given.
    #[must_use]
    pub fn new(
        handle: Arc<ModelHandle>,
        log: Option<RecordLog<PredictionRecord>>,
        telemetry: ServingTelemetry,
    ) -> Self {
        Self {
            handle,
            predictions: AtomicU64::new(0),
            log,
            telemetry,
        }
    }

    /// Model slot shared with the retrain orchestrator.
    #[must_use]
    pub fn handle(&self) -> &Arc<ModelHandle> {
        &self.handle
    }

    /// Predictions served since start-up.
    #[must_use]
    pub fn total_predictions(&self) -> u64 {
        self.predictions.load(Ordering::Relaxed)
    }

    fn active(&self) -> ServingResult<Arc<LoadedModel>> {
        self.handle.snapshot().ok_or(ServingError::ModelNotLoaded)
    }

    fn score(&self, model: &LoadedModel, image: &RgbImage) -> ServingResult<Prediction> {
        let probability = model.classifier.predict_proba(image)?;
        let prediction = Prediction::from_probability(probability);
        self.predictions.fetch_add(1, Ordering::Relaxed);
        if let Some(log) = &self.log {
            let record = PredictionRecord {
                class: prediction.class.clone(),
                probability,
                confidence: prediction.confidence,
                timestamp: prediction.timestamp,
                model_version: model.version,
            };
            if let Err(err) = log.append(&record) {
                tracing::warn!(error = %err, "failed to append prediction record");
            }
        }
        Ok(prediction)
    }

    /// Classifies one image.
    pub fn predict(&self, image: &RgbImage) -> ServingResult<Prediction> {
        let model = self.active()?;
        self.score(&model, image)
    }

    /// Classifies several images against one model snapshot.
    pub fn predict_batch(&self, images: &[RgbImage]) -> ServingResult<Vec<Prediction>> {
        let model = self.active()?;
        images.iter().map(|image| self.score(&model, image)).collect()
    }

    /// Both classes ranked by probability, truncated to `k`.
    pub fn top_predictions(&self, image: &RgbImage, k: usize) -> ServingResult<Vec<RankedClass>> {
        let model = self.active()?;
        let dog = model.classifier.predict_proba(image)?;
        let mut ranked: Vec<RankedClass> = [(CLASS_NAMES[0], 1.0 - dog), (CLASS_NAMES[1], dog)]
            .into_iter()
            .map(|(class, probability)| RankedClass {
                class: class.to_string(),
                probability,
                percentage: percentage(probability),
            })
            .collect();
        ranked.sort_by(|a, b| b.probability.total_cmp(&a.probability));
        ranked.truncate(k);
        Ok(ranked)
    }

    /// Aggregates the prediction log.
    #[allow(clippy::cast_precision_loss)]
    pub fn prediction_statistics(&self) -> ServingResult<PredictionStatistics> {
        let Some(log) = &self.log else {
            return Ok(PredictionStatistics::default());
        };
        let records = log.read_all()?;
        if records.is_empty() {
            return Ok(PredictionStatistics::default());
        }
        let count = |name: &str| records.iter().filter(|r| r.class == name).count();
        let confidence: f64 = records.iter().map(|r| f64::from(r.confidence)).sum();
        Ok(PredictionStatistics {
            total_predictions: records.len(),
            cats_predicted: count(CLASS_NAMES[0]),
            dogs_predicted: count(CLASS_NAMES[1]),
            average_confidence: confidence / records.len() as f64,
        })
    }

    /// Installs `classifier` as the active model and returns its version.
    pub fn activate(&self, classifier: Box<dyn BinaryClassifier>, source: Option<&Path>) -> u64 {
        let version = self.handle.install(classifier, source);
        let path = source.map(|p| p.display().to_string());
        tracing::info!(path = ?path, version, "active model reloaded");
        self.telemetry.record(
            LogLevel::Info,
            "model.reloaded",
            json!({ "path": path, "version": version }),
        );
        version
    }

    /// Loads the checkpoint at `path` and makes it the active model. A failed
    /// load leaves the current model in place.
    pub fn reload(&self, path: &Path) -> ServingResult<u64> {
        let model = ClassifierModel::load(path)?;
        Ok(self.activate(Box::new(model), Some(path)))
    }
}
