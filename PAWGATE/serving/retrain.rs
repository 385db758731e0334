//! Single-flight background retraining with atomic promotion.
//!
//! `Idle -> Running -> {Succeeded, Failed} -> Idle`. Entering `Running` is a
//! compare-and-set under the state mutex that hands out a [`RetrainTicket`];
//! dropping the ticket records the outcome and always returns to `Idle`.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use pawgate_learning::{ClassifierPipeline, ModelPaths};
use serde::{Deserialize, Serialize};
use serde_json::json;
use shared_logging::LogLevel;
use tokio::task::JoinHandle;

use crate::{
    dataset::DatasetAccumulator,
    error::{ServingError, ServingResult},
    inference::InferenceService,
    telemetry::ServingTelemetry,
};

/// Coarse orchestrator state.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RetrainPhase {
    /// No job.
    Idle,
    /// A job holds the ticket.
    Running,
}

/// How a finished job ended.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RetrainOutcome {
    /// Candidate trained and promoted.
    Succeeded {
        /// Handle version of the promoted model.
        model_version: u64,
        /// Epochs run.
        epochs: usize,
        /// Best validation accuracy seen.
        best_val_accuracy: f32,
        /// Labeled samples used.
        samples: usize,
    },
    /// Nothing was promoted.
    Failed {
        /// Why.
        reason: String,
    },
}

impl RetrainOutcome {
    fn failed(reason: impl Into<String>) -> Self {
        Self::Failed {
            reason: reason.into(),
        }
    }

    /// True for [`RetrainOutcome::Succeeded`].
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded { .. })
    }
}

/// Snapshot served by `/retrain-status`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetrainStatus {
    /// True while a job is running.
    pub is_retraining: bool,
    /// Successful retrains since start-up.
    pub total_retrains: u64,
    /// Completion time of the last successful retrain.
    pub last_retrain: Option<DateTime<Utc>>,
    /// Start of the current or most recent job.
    pub started_at: Option<DateTime<Utc>>,
    /// End of the most recent job.
    pub completed_at: Option<DateTime<Utc>>,
    /// Outcome of the most recent job.
    pub last_outcome: Option<RetrainOutcome>,
}

#[derive(Debug)]
struct RetrainState {
    phase: RetrainPhase,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    last_outcome: Option<RetrainOutcome>,
    total_retrains: u64,
    last_retrain: Option<DateTime<Utc>>,
}

/// Owns the retrain state machine and the job body.
#[derive(Debug)]
pub struct RetrainOrchestrator {
    state: Mutex<RetrainState>,
    dataset: DatasetAccumulator,
    pipeline: ClassifierPipeline,
    paths: ModelPaths,
    inference: Arc<InferenceService>,
    telemetry: ServingTelemetry,
}

impl RetrainOrchestrator {
    /// Creates an idle orchestrator.
    #[must_use]
    pub fn new(
        dataset: DatasetAccumulator,
        pipeline: ClassifierPipeline,
        paths: ModelPaths,
        inference: Arc<InferenceService>,
        telemetry: ServingTelemetry,
    ) -> Self {
        Self {
            state: Mutex::new(RetrainState {
                phase: RetrainPhase::Idle,
                started_at: None,
                completed_at: None,
                last_outcome: None,
                total_retrains: 0,
                last_retrain: None,
            }),
            dataset,
            pipeline,
            paths,
            inference,
            telemetry,
        }
    }

    /// Moves `Idle -> Running`, or fails with [`ServingError::RetrainConflict`].
    pub fn try_begin(self: &Arc<Self>) -> ServingResult<RetrainTicket> {
        let started_at = {
            let mut state = self.state.lock();
            if state.phase == RetrainPhase::Running {
                return Err(ServingError::RetrainConflict);
            }
            let now = Utc::now();
            state.phase = RetrainPhase::Running;
            state.started_at = Some(now);
            state.completed_at = None;
            now
        };
        tracing::info!(%started_at, "retrain started");
        self.telemetry.record(
            LogLevel::Info,
            "retrain.started",
            json!({ "corpus": self.dataset.root().display().to_string() }),
        );
        Ok(RetrainTicket {
            orchestrator: Arc::clone(self),
            outcome: None,
        })
    }

    /// Starts a job in the background. The returned handle resolves to the
    /// outcome; callers may drop it.
    pub fn spawn(self: &Arc<Self>) -> ServingResult<JoinHandle<RetrainOutcome>> {
        let mut ticket = self.try_begin()?;
        let orchestrator = Arc::clone(self);
        Ok(tokio::spawn(async move {
            let outcome = match tokio::task::spawn_blocking(move || orchestrator.execute()).await {
                Ok(outcome) => outcome,
                Err(err) => RetrainOutcome::failed(format!("training task aborted: {err}")),
            };
            ticket.set_outcome(outcome.clone());
            drop(ticket);
            outcome
        }))
    }

    /// Runs a job on the calling thread.
    pub fn run_blocking(self: &Arc<Self>) -> ServingResult<RetrainOutcome> {
        let mut ticket = self.try_begin()?;
        let outcome = self.execute();
        ticket.set_outcome(outcome.clone());
        Ok(outcome)
    }

    /// Current status.
    #[must_use]
    pub fn status(&self) -> RetrainStatus {
        let state = self.state.lock();
        RetrainStatus {
            is_retraining: state.phase == RetrainPhase::Running,
            total_retrains: state.total_retrains,
            last_retrain: state.last_retrain,
            started_at: state.started_at,
            completed_at: state.completed_at,
            last_outcome: state.last_outcome.clone(),
        }
    }

    /// Current phase.
    #[must_use]
    pub fn phase(&self) -> RetrainPhase {
        self.state.lock().phase
    }

    /// Successful retrains since start-up.
    #[must_use]
    pub fn total_retrains(&self) -> u64 {
        self.state.lock().total_retrains
    }

    /// Retraining corpus.
    #[must_use]
    pub const fn dataset(&self) -> &DatasetAccumulator {
        &self.dataset
    }

    fn execute(&self) -> RetrainOutcome {
        match self.train_and_promote() {
            Ok(outcome) => outcome,
            Err(ServingError::RetrainFailure(reason)) => RetrainOutcome::failed(reason),
            Err(err) => RetrainOutcome::failed(err.to_string()),
        }
    }

    fn train_and_promote(&self) -> ServingResult<RetrainOutcome> {
        let Some(samples) = self.dataset.load_samples()? else {
            return Err(ServingError::RetrainFailure(
                "no retraining data available".into(),
            ));
        };
        let active = self.paths.active();
        let mut model = self.pipeline.load_or_fresh(&active)?;
        let report = self
            .pipeline
            .train(&mut model, self.dataset.root(), &self.paths.candidate())?;
        let promoted = self.pipeline.promote(&self.paths)?;
        let model_version = self.inference.activate(Box::new(promoted), Some(&active));
        Ok(RetrainOutcome::Succeeded {
            model_version,
            epochs: report.epochs.len(),
            best_val_accuracy: report.best().map_or(0.0, |b| b.val_accuracy),
            samples: samples.len(),
        })
    }

    fn finish(&self, outcome: RetrainOutcome) {
        let now = Utc::now();
        {
            let mut state = self.state.lock();
            if outcome.is_success() {
                state.total_retrains += 1;
                state.last_retrain = Some(now);
            }
            state.completed_at = Some(now);
            state.last_outcome = Some(outcome.clone());
            state.phase = RetrainPhase::Idle;
        }
        match &outcome {
            RetrainOutcome::Succeeded { model_version, .. } => {
                tracing::info!(model_version, "retrain succeeded");
                self.telemetry.record(
                    LogLevel::Info,
                    "retrain.succeeded",
                    serde_json::to_value(&outcome).unwrap_or_default(),
                );
            }
            RetrainOutcome::Failed { reason } => {
                tracing::error!(%reason, "retrain failed");
                self.telemetry.record(
                    LogLevel::Error,
                    "retrain.failed",
                    json!({ "reason": reason }),
                );
            }
        }
    }
}

/// Proof of holding the `Running` state. Dropping it records the outcome
/// (a failure if none was set) and returns the orchestrator to `Idle`.
#[derive(Debug)]
pub struct RetrainTicket {
    orchestrator: Arc<RetrainOrchestrator>,
    outcome: Option<RetrainOutcome>,
}

impl RetrainTicket {
    /// Sets the outcome recorded on drop.
    pub fn set_outcome(&mut self, outcome: RetrainOutcome) {
        self.outcome = Some(outcome);
    }
}

impl Drop for RetrainTicket {
    fn drop(&mut self) {
        let outcome = self
            .outcome
            .take()
            .unwrap_or_else(|| RetrainOutcome::failed("retrain job ended without an outcome"));
        self.orchestrator.finish(outcome);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        dataset::{ClassLabel, UploadedFile},
        model_handle::ModelHandle,
    };
    use image::{ImageFormat, Rgb, RgbImage};
    use pawgate_learning::{Preprocessor, TrainingConfig};
    use std::{fs, io::Cursor};
    use tempfile::{tempdir, TempDir};

    struct Fixture {
        _tmp: TempDir,
        paths: ModelPaths,
        log: std::path::PathBuf,
        orchestrator: Arc<RetrainOrchestrator>,
    }

    fn png(rgb: [u8; 3]) -> Vec<u8> {
        let mut bytes = Cursor::new(Vec::new());
        RgbImage::from_pixel(12, 12, Rgb(rgb))
            .write_to(&mut bytes, ImageFormat::Png)
            .unwrap();
        bytes.into_inner()
    }

    fn fixture() -> Fixture {
        let tmp = tempdir().unwrap();
        let paths = ModelPaths::new(tmp.path().join("models"));
        let log = tmp.path().join("logs/serving.log.jsonl");
        let telemetry = ServingTelemetry::builder("retrain")
            .log_path(&log)
            .build()
            .unwrap();
        let inference = Arc::new(InferenceService::new(
            Arc::new(ModelHandle::empty()),
            None,
            telemetry.clone(),
        ));
        let pipeline = ClassifierPipeline::new(
            TrainingConfig {
                epochs: 3,
                batch_size: 4,
                learning_rate: 0.01,
                hidden_units: 8,
                ..TrainingConfig::default()
            },
            Preprocessor::square(12),
        );
        let orchestrator = Arc::new(RetrainOrchestrator::new(
            DatasetAccumulator::new(tmp.path().join("data/retrain")),
            pipeline,
            paths.clone(),
            inference,
            telemetry,
        ));
        Fixture {
            _tmp: tmp,
            paths,
            log,
            orchestrator,
        }
    }

    fn seed_corpus(acc: &DatasetAccumulator, per_class: usize) {
        for (label, rgb) in [(ClassLabel::Cats, [220, 60, 20]), (ClassLabel::Dogs, [20, 60, 220])] {
            let files: Vec<UploadedFile> = (0..per_class)
                .map(|i| UploadedFile {
                    filename: Some(format!("{i}.png")),
                    content_type: Some("image/png".into()),
                    bytes: png(rgb),
                })
                .collect();
            assert_eq!(acc.store_batch(&files, label).uploaded_count, per_class);
        }
    }

    #[test]
    fn second_begin_conflicts_until_ticket_dropped() {
        let f = fixture();
        let ticket = f.orchestrator.try_begin().unwrap();
        assert!(matches!(
            f.orchestrator.try_begin(),
            Err(ServingError::RetrainConflict)
        ));
        assert!(f.orchestrator.status().is_retraining);
        drop(ticket);
        assert_eq!(f.orchestrator.phase(), RetrainPhase::Idle);
        let status = f.orchestrator.status();
        assert!(matches!(
            status.last_outcome,
            Some(RetrainOutcome::Failed { .. })
        ));
        assert_eq!(status.total_retrains, 0);
        assert!(f.orchestrator.try_begin().is_ok());
    }

    #[tokio::test]
    async fn empty_corpus_fails_without_touching_model() {
        let f = fixture();
        let outcome = f.orchestrator.spawn().unwrap().await.unwrap();
        assert_eq!(
            outcome,
            RetrainOutcome::Failed {
                reason: "no retraining data available".into()
            }
        );
        let status = f.orchestrator.status();
        assert!(!status.is_retraining);
        assert_eq!(status.total_retrains, 0);
        assert!(status.last_retrain.is_none());
        assert!(status.completed_at.is_some());
        assert!(!f.paths.active().exists());
        assert!(!f.orchestrator.inference.handle().is_loaded());
        let log = fs::read_to_string(&f.log).unwrap();
        assert!(log.contains("retrain.started"));
        assert!(log.contains("retrain.failed"));
    }

    #[tokio::test]
    async fn successful_retrain_promotes_and_reloads() {
        let f = fixture();
        seed_corpus(f.orchestrator.dataset(), 4);
        let job = f.orchestrator.spawn().unwrap();
        assert!(matches!(
            f.orchestrator.spawn(),
            Err(ServingError::RetrainConflict)
        ));
        let outcome = job.await.unwrap();
        assert!(outcome.is_success(), "{outcome:?}");
        assert!(f.paths.active().exists());
        assert!(f.paths.config().exists());
        let status = f.orchestrator.status();
        assert_eq!(status.total_retrains, 1);
        assert!(status.last_retrain.is_some());
        let handle = f.orchestrator.inference.handle();
        assert_eq!(handle.version(), 1);
        let prediction = f
            .orchestrator
            .inference
            .predict(&RgbImage::from_pixel(12, 12, Rgb([220, 60, 20])))
            .unwrap();
        assert!(prediction.class == "cats" || prediction.class == "dogs");
        let log = fs::read_to_string(&f.log).unwrap();
        assert!(log.contains("retrain.succeeded"));
        assert!(log.contains("model.reloaded"));

        // a second run fine-tunes the promoted checkpoint
        let outcome = f.orchestrator.spawn().unwrap().await.unwrap();
        assert!(outcome.is_success());
        assert_eq!(f.orchestrator.total_retrains(), 2);
        assert_eq!(handle.version(), 2);
    }

    #[test]
    fn broken_active_checkpoint_fails_and_is_left_in_place() {
        let f = fixture();
        seed_corpus(f.orchestrator.dataset(), 2);
        fs::create_dir_all(f.paths.dir()).unwrap();
        fs::write(f.paths.active(), b"corrupt").unwrap();
        let outcome = f.orchestrator.run_blocking().unwrap();
        assert!(!outcome.is_success());
        assert_eq!(fs::read(f.paths.active()).unwrap(), b"corrupt");
        assert_eq!(f.orchestrator.total_retrains(), 0);
        assert!(!f.paths.candidate().exists());
    }
}
