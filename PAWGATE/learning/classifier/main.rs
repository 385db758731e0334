//! Cat/dog classifier: model, training loop, callbacks and the pipeline that
//! ties them to on-disk corpora and checkpoints.

/// Frozen feature extractor.
pub mod backbone;
/// Model, head and optimiser.
pub mod model;
/// Training history.
pub mod reporter;
/// Epoch callbacks.
pub mod savor;
/// Training loop.
pub mod trainer;

use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};

use backbone::PooledColourBackbone;
use model::ClassifierModel;
use reporter::TrainingReport;
use trainer::{predict_set, FeatureSet, Trainer, TrainingConfig};

use crate::{
    dataloader::load_labeled_dir,
    errors::LearningResult,
    metrics::EvaluationMetrics,
    model_config::ModelConfig,
    persist,
    preprocess::Preprocessor,
};

/// File locations inside the model directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelPaths {
    dir: PathBuf,
}

impl ModelPaths {
    /// Active model file name.
    pub const ACTIVE: &'static str = "cats_dogs_model.json";
    /// Retrain candidate file name.
    pub const CANDIDATE: &'static str = "retrained_model.json";
    /// Model configuration file name.
    pub const CONFIG: &'static str = "model_config.json";
    /// Evaluation metrics file name.
    pub const METRICS: &'static str = "metrics.json";

    /// Paths rooted at `dir`.
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Model directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Currently served checkpoint.
    #[must_use]
    pub fn active(&self) -> PathBuf {
        self.dir.join(Self::ACTIVE)
    }

    /// Best checkpoint of the latest training run.
    #[must_use]
    pub fn candidate(&self) -> PathBuf {
        self.dir.join(Self::CANDIDATE)
    }

    /// Model configuration.
    #[must_use]
    pub fn config(&self) -> PathBuf {
        self.dir.join(Self::CONFIG)
    }

    /// Evaluation metrics.
    #[must_use]
    pub fn metrics(&self) -> PathBuf {
        self.dir.join(Self::METRICS)
    }
}

/// Summary of a full `train` run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineReport {
    /// Training history.
    pub training: TrainingReport,
    /// Held-out metrics, when a test directory was given.
    pub metrics: Option<EvaluationMetrics>,
    /// Location of the promoted model.
    pub model_path: PathBuf,
}

/// Builds, trains, promotes and evaluates classifiers.
#[derive(Debug, Clone, Default)]
pub struct ClassifierPipeline {
    trainer: Trainer,
    input: Preprocessor,
    backbone: PooledColourBackbone,
}

impl ClassifierPipeline {
    /// Pipeline with the given hyperparameters and input geometry.
    #[must_use]
    pub fn new(config: TrainingConfig, input: Preprocessor) -> Self {
        Self {
            trainer: Trainer::new(config),
            input,
            backbone: PooledColourBackbone::default(),
        }
    }

    /// Hyperparameters in use.
    #[must_use]
    pub const fn config(&self) -> &TrainingConfig {
        self.trainer.config()
    }

    /// Untrained model with this pipeline's geometry.
    #[must_use]
    pub fn fresh_model(&self) -> ClassifierModel {
        let config = self.trainer.config();
        ClassifierModel::new(self.input, self.backbone, config.hidden_units, config.seed)
    }

    /// Loads the checkpoint at `path` for fine-tuning, or starts fresh when
    /// there is none.
    pub fn load_or_fresh(&self, path: &Path) -> LearningResult<ClassifierModel> {
        if path.exists() {
            tracing::info!(path = %path.display(), "fine-tuning existing model");
            ClassifierModel::load(path)
        } else {
            tracing::info!("no active checkpoint, training a fresh model");
            Ok(self.fresh_model())
        }
    }

    /// Trains `model` on `data_dir` and leaves the best-accuracy epoch at
    /// `candidate`.
    pub fn train(
        &self,
        model: &mut ClassifierModel,
        data_dir: &Path,
        candidate: &Path,
    ) -> LearningResult<TrainingReport> {
        let report = self.trainer.fit_directory(model, data_dir, Some(candidate))?;
        if report.checkpoint_epoch.is_none() {
            model.save(candidate)?;
        }
        Ok(report)
    }

    /// Replaces the active checkpoint with the candidate, rewrites the model
    /// configuration and returns the promoted model as loaded from disk.
    pub fn promote(&self, paths: &ModelPaths) -> LearningResult<ClassifierModel> {
        let candidate = ClassifierModel::load(paths.candidate())?;
        persist::replace_file(&paths.candidate(), &paths.active())?;
        ModelConfig::describe(&candidate, self.trainer.config().learning_rate)
            .save(paths.config())?;
        tracing::info!(path = %paths.active().display(), "promoted candidate model");
        ClassifierModel::load(paths.active())
    }

    /// Scores every image under `test_dir/{cats,dogs}`.
    pub fn evaluate(
        &self,
        model: &ClassifierModel,
        test_dir: &Path,
    ) -> LearningResult<EvaluationMetrics> {
        let samples = load_labeled_dir(test_dir)?;
        let set = FeatureSet::from_paths(model, &samples, false)?;
        let probabilities = predict_set(model, &set)?;
        let labels: Vec<u8> = set.labels.iter().map(|&l| u8::from(l > 0.5)).collect();
        let probabilities: Vec<f32> = probabilities.to_vec();
        Ok(EvaluationMetrics::compute(&labels, &probabilities))
    }

    /// Trains a fresh model on `data_dir`, promotes it into `paths` and, when
    /// `test_dir` is given, writes held-out metrics.
    pub fn run(
        &self,
        data_dir: &Path,
        paths: &ModelPaths,
        test_dir: Option<&Path>,
    ) -> anyhow::Result<PipelineReport> {
        let mut model = self.fresh_model();
        let training = self
            .train(&mut model, data_dir, &paths.candidate())
            .with_context(|| format!("training on {}", data_dir.display()))?;
        let promoted = self.promote(paths).context("promoting trained model")?;
        let metrics = match test_dir {
            Some(dir) => {
                let metrics = self
                    .evaluate(&promoted, dir)
                    .with_context(|| format!("evaluating on {}", dir.display()))?;
                metrics.save(paths.metrics()).context("writing metrics")?;
                Some(metrics)
            }
            None => None,
        };
        Ok(PipelineReport {
            training,
            metrics,
            model_path: paths.active(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::preprocess::tests::solid_png;
    use std::fs;
    use tempfile::tempdir;

    fn corpus(root: &Path, per_class: usize) {
        for (class, colour) in [("cats", [230, 40, 40]), ("dogs", [40, 40, 230])] {
            let dir = root.join(class);
            fs::create_dir_all(&dir).unwrap();
            for i in 0..per_class {
                let shade = u8::try_from(i * 5).unwrap();
                let rgb = [colour[0] - shade, colour[1] + shade, colour[2] - shade];
                fs::write(dir.join(format!("{i}.png")), solid_png(24, 24, rgb)).unwrap();
            }
        }
    }

    fn pipeline() -> ClassifierPipeline {
        ClassifierPipeline::new(
            TrainingConfig {
                epochs: 20,
                batch_size: 4,
                learning_rate: 0.01,
                hidden_units: 8,
                ..TrainingConfig::default()
            },
            Preprocessor::square(16),
        )
    }

    #[test]
    fn run_trains_promotes_and_evaluates() {
        let tmp = tempdir().unwrap();
        let data = tmp.path().join("train");
        corpus(&data, 6);
        let paths = ModelPaths::new(tmp.path().join("models"));
        let report = pipeline().run(&data, &paths, Some(&data)).unwrap();
        assert!(paths.active().exists());
        assert!(paths.config().exists());
        assert!(paths.metrics().exists());
        let metrics = report.metrics.unwrap();
        assert_eq!(metrics.samples, 12);
        let counted: usize = metrics.confusion_matrix.iter().flatten().sum();
        assert_eq!(counted, 12);
        assert!(metrics.roc_auc.is_some());
        assert!(!report.training.epochs.is_empty());
        let config = ModelConfig::load(paths.config()).unwrap();
        assert_eq!(config.input_shape, [16, 16, 3]);
    }

    #[test]
    fn load_or_fresh_without_checkpoint_is_untrained() {
        let tmp = tempdir().unwrap();
        let model = pipeline()
            .load_or_fresh(&tmp.path().join("missing.json"))
            .unwrap();
        assert!(model.scaler.is_none());
    }

    #[test]
    fn promote_without_candidate_leaves_active_untouched() {
        let tmp = tempdir().unwrap();
        let paths = ModelPaths::new(tmp.path());
        fs::write(paths.active(), b"previous").unwrap();
        assert!(pipeline().promote(&paths).is_err());
        assert_eq!(fs::read(paths.active()).unwrap(), b"previous");
    }
}
