use std::path::{Path, PathBuf};

use chrono::Utc;
use ndarray::{Array1, Array2};
use rand::{rngs::SmallRng, seq::SliceRandom, Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use super::{
    model::{binary_cross_entropy, Adam, ClassifierModel, DenseHead, FeatureScaler},
    reporter::{EpochSnapshot, TrainingReport},
    savor::{CheckpointSavor, EarlyStopping, ReduceLrOnPlateau},
};
use crate::{
    dataloader::{load_labeled_dir, split_validation, LabeledPath},
    errors::{LearningError, LearningResult},
};

/// Training hyperparameters.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TrainingConfig {
    /// Maximum epochs.
    pub epochs: usize,
    /// Mini-batch size.
    pub batch_size: usize,
    /// Initial Adam learning rate.
    pub learning_rate: f32,
    /// Fraction of each class held out for validation.
    pub validation_split: f32,
    /// Epochs without val-loss improvement before stopping.
    pub early_stopping_patience: usize,
    /// Epochs without val-loss improvement before decaying the learning rate.
    pub lr_patience: usize,
    /// Learning-rate decay factor.
    pub lr_factor: f32,
    /// Learning-rate floor.
    pub min_lr: f32,
    /// Width of the hidden dense layer for fresh models.
    pub hidden_units: usize,
    /// Seed for initialisation, shuffling and augmentation.
    pub seed: u64,
    /// Randomly mirror training images.
    pub augment: bool,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            epochs: 15,
            batch_size: 32,
            learning_rate: 1e-4,
            validation_split: 0.2,
            early_stopping_patience: 5,
            lr_patience: 3,
            lr_factor: 0.5,
            min_lr: 1e-7,
            hidden_units: 64,
            seed: 42,
            augment: true,
        }
    }
}

impl TrainingConfig {
    /// Rejects values the training loop cannot run with.
    pub fn validate(&self) -> LearningResult<()> {
        if self.epochs == 0 || self.batch_size == 0 || self.hidden_units == 0 {
            return Err(LearningError::InvalidConfig(
                "epochs, batch_size and hidden_units must be positive".into(),
            ));
        }
        if !(self.learning_rate > 0.0 && self.learning_rate.is_finite()) {
            return Err(LearningError::InvalidConfig(format!(
                "learning_rate {} must be positive",
                self.learning_rate
            )));
        }
        if !(0.0..1.0).contains(&self.validation_split) {
            return Err(LearningError::InvalidConfig(format!(
                "validation_split {} outside [0, 1)",
                self.validation_split
            )));
        }
        if !(self.lr_factor > 0.0 && self.lr_factor < 1.0) {
            return Err(LearningError::InvalidConfig(format!(
                "lr_factor {} outside (0, 1)",
                self.lr_factor
            )));
        }
        Ok(())
    }
}

/// Backbone features for a set of labeled images.
#[derive(Debug, Clone)]
pub struct FeatureSet {
    /// Raw feature rows.
    pub features: Array2<f32>,
    /// Features of the mirrored images, present when augmentation was requested.
    pub flipped: Option<Array2<f32>>,
    /// Labels as 0.0 / 1.0.
    pub labels: Array1<f32>,
}

impl FeatureSet {
    /// Builds a set from precomputed rows.
    #[must_use]
    pub fn from_rows(features: Array2<f32>, labels: Array1<f32>) -> Self {
        Self {
            features,
            flipped: None,
            labels,
        }
    }

    /// Decodes every image and runs the model's backbone over it.
    /// Undecodable files are skipped with a warning.
    pub fn from_paths(
        model: &ClassifierModel,
        samples: &[LabeledPath],
        augment: bool,
    ) -> LearningResult<Self> {
        let dim = model.backbone.dim();
        let mut rows = Vec::with_capacity(samples.len() * dim);
        let mut flipped_rows = Vec::new();
        let mut labels = Vec::with_capacity(samples.len());
        for sample in samples {
            let tensor = match model.input.preprocess_path(&sample.path) {
                Ok(tensor) => tensor,
                Err(err) => {
                    tracing::warn!(path = %sample.path.display(), error = %err, "skipping unreadable training image");
                    continue;
                }
            };
            rows.extend(model.features(&tensor).iter().copied());
            if augment {
                flipped_rows.extend(model.features(&tensor.flipped_horizontally()).iter().copied());
            }
            labels.push(f32::from(sample.label));
        }
        if labels.is_empty() {
            let origin = samples
                .first()
                .and_then(|s| s.path.parent())
                .map_or_else(PathBuf::new, Path::to_path_buf);
            return Err(LearningError::EmptyDataset(origin));
        }
        let n = labels.len();
        let to_matrix = |values: Vec<f32>| {
            Array2::from_shape_vec((n, dim), values).map_err(|_| LearningError::ShapeMismatch {
                expected: n * dim,
                found: 0,
            })
        };
        Ok(Self {
            features: to_matrix(rows)?,
            flipped: if augment {
                Some(to_matrix(flipped_rows)?)
            } else {
                None
            },
            labels: Array1::from(labels),
        })
    }

    /// Number of samples.
    #[must_use]
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    /// True when there are no samples.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

/// Runs the epoch loop with early stopping, plateau LR decay and
/// best-accuracy checkpointing.
#[derive(Debug, Clone, Default)]
pub struct Trainer {
    config: TrainingConfig,
}

impl Trainer {
    /// Creates a new trainer.
    #[must_use]
    pub const fn new(config: TrainingConfig) -> Self {
        Self { config }
    }

    /// Hyperparameters in use.
    #[must_use]
    pub const fn config(&self) -> &TrainingConfig {
        &self.config
    }

    /// Loads `data_dir/{cats,dogs}`, splits it and trains `model` on it.
    pub fn fit_directory(
        &self,
        model: &mut ClassifierModel,
        data_dir: &Path,
        checkpoint: Option<&Path>,
    ) -> LearningResult<TrainingReport> {
        self.config.validate()?;
        let samples = load_labeled_dir(data_dir)?;
        let (train, validation) =
            split_validation(&samples, self.config.validation_split, self.config.seed)?;
        tracing::info!(
            dir = %data_dir.display(),
            train = train.len(),
            validation = validation.len(),
            "loaded training corpus"
        );
        let train = FeatureSet::from_paths(model, &train, self.config.augment)?;
        let validation = FeatureSet::from_paths(model, &validation, false)?;
        self.fit(model, &train, &validation, checkpoint)
    }

    /// Trains `model` in place. The head ends up with the weights of the
    /// lowest validation-loss epoch.
    pub fn fit(
        &self,
        model: &mut ClassifierModel,
        train: &FeatureSet,
        validation: &FeatureSet,
        checkpoint: Option<&Path>,
    ) -> LearningResult<TrainingReport> {
        self.config.validate()?;
        if train.is_empty() || validation.is_empty() {
            return Err(LearningError::EmptyDataset(PathBuf::new()));
        }
        if train.features.ncols() != model.head.inputs() {
            return Err(LearningError::ShapeMismatch {
                expected: model.head.inputs(),
                found: train.features.ncols(),
            });
        }
        if model.scaler.is_none() {
            model.scaler = Some(FeatureScaler::fit(&train.features));
        }
        let train_x = model.scale(&train.features);
        let flipped_x = train
            .flipped
            .as_ref()
            .filter(|_| self.config.augment)
            .map(|f| model.scale(f));
        let val_x = model.scale(&validation.features);

        let mut rng = SmallRng::seed_from_u64(self.config.seed);
        let mut adam = Adam::new(&model.head);
        let mut lr = self.config.learning_rate;
        let mut early = EarlyStopping::new(self.config.early_stopping_patience);
        let mut plateau = ReduceLrOnPlateau::new(
            self.config.lr_factor,
            self.config.lr_patience,
            self.config.min_lr,
        );
        let mut savor = checkpoint.map(CheckpointSavor::new);
        let mut report = TrainingReport {
            train_samples: train.len(),
            validation_samples: validation.len(),
            ..TrainingReport::default()
        };

        let mut order: Vec<usize> = (0..train.len()).collect();
        for epoch in 0..self.config.epochs {
            order.shuffle(&mut rng);
            for batch in order.chunks(self.config.batch_size) {
                let mirrored: Vec<bool> = batch
                    .iter()
                    .map(|_| flipped_x.is_some() && rng.gen_bool(0.5))
                    .collect();
                let xb = Array2::from_shape_fn((batch.len(), train_x.ncols()), |(i, j)| {
                    match (&flipped_x, mirrored[i]) {
                        (Some(flipped), true) => flipped[[batch[i], j]],
                        _ => train_x[[batch[i], j]],
                    }
                });
                let yb: Array1<f32> = batch.iter().map(|&i| train.labels[i]).collect();
                let (_, grads) = model.head.backward(&xb, &yb);
                adam.apply(&mut model.head, &grads, lr);
            }

            let (loss, accuracy) = score(&model.head, &train_x, &train.labels);
            let (val_loss, val_accuracy) = score(&model.head, &val_x, &validation.labels);
            tracing::info!(epoch, loss, accuracy, val_loss, val_accuracy, lr, "epoch finished");
            report.epochs.push(EpochSnapshot {
                epoch,
                loss,
                accuracy,
                val_loss,
                val_accuracy,
                learning_rate: lr,
            });
            model.updated_at = Utc::now();

            if let Some(savor) = savor.as_mut() {
                savor.observe(epoch, val_accuracy, model)?;
            }
            let stop = early.observe(val_loss, &model.head);
            lr = plateau.observe(val_loss, lr);
            if stop {
                tracing::info!(epoch, "early stopping");
                report.stopped_early = true;
                break;
            }
        }

        if let Some(best) = early.best_weights() {
            model.head = best.clone();
        }
        if let Some(savor) = savor {
            report.checkpoint_epoch = savor.saved_epoch();
            report.checkpoint = Some(savor.path().to_path_buf());
        }
        Ok(report)
    }
}

/// Probabilities for every row of a feature set.
pub fn predict_set(model: &ClassifierModel, set: &FeatureSet) -> LearningResult<Array1<f32>> {
    model.predict_features(&set.features)
}

#[allow(clippy::cast_precision_loss)]
fn score(head: &DenseHead, x: &Array2<f32>, y: &Array1<f32>) -> (f32, f32) {
    let p = head.forward(x);
    let loss = binary_cross_entropy(y, &p);
    let correct = p
        .iter()
        .zip(y.iter())
        .filter(|&(&prob, &label)| (prob > 0.5) == (label > 0.5))
        .count();
    (loss, correct as f32 / y.len().max(1) as f32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        classifier::backbone::PooledColourBackbone,
        preprocess::{tests::solid_png, Preprocessor},
    };
    use std::fs;
    use tempfile::tempdir;

    fn separable_rows(n: usize, dim: usize) -> FeatureSet {
        let features = Array2::from_shape_fn((n, dim), |(i, j)| {
            let sign = if i % 2 == 0 { 1.0 } else { -1.0 };
            sign * (1.0 + (j % 3) as f32 * 0.1) + (i as f32) * 0.01
        });
        let labels = (0..n).map(|i| if i % 2 == 0 { 1.0 } else { 0.0 }).collect();
        FeatureSet::from_rows(features, labels)
    }

    fn small_model() -> ClassifierModel {
        ClassifierModel::new(Preprocessor::square(16), PooledColourBackbone::default(), 8, 9)
    }

    fn config(epochs: usize) -> TrainingConfig {
        TrainingConfig {
            epochs,
            batch_size: 4,
            learning_rate: 0.01,
            augment: false,
            ..TrainingConfig::default()
        }
    }

    #[test]
    fn rejects_invalid_config() {
        let bad = TrainingConfig {
            validation_split: 1.0,
            ..TrainingConfig::default()
        };
        assert!(bad.validate().is_err());
        let bad = TrainingConfig {
            epochs: 0,
            ..TrainingConfig::default()
        };
        assert!(bad.validate().is_err());
        assert!(TrainingConfig::default().validate().is_ok());
    }

    #[test]
    fn fit_learns_separable_features_and_checkpoints() {
        let dir = tempdir().unwrap();
        let checkpoint = dir.path().join("retrained_model.json");
        let mut model = small_model();
        let data = separable_rows(16, model.backbone.dim());
        let report = Trainer::new(config(10))
            .fit(&mut model, &data, &data, Some(&checkpoint))
            .unwrap();
        assert!(!report.epochs.is_empty());
        assert!(report.epochs.len() <= 10);
        let first = &report.epochs[0];
        let best = report.best().unwrap();
        assert!(best.val_accuracy >= first.val_accuracy);
        assert!(report.epochs.last().unwrap().loss < first.loss);
        assert!(checkpoint.exists());
        assert_eq!(report.checkpoint.as_deref(), Some(checkpoint.as_path()));
        assert!(model.scaler.is_some());
    }

    #[test]
    fn fit_stops_early_when_validation_never_improves() {
        let mut model = small_model();
        let dim = model.backbone.dim();
        let train = separable_rows(8, dim);
        // validation labels inverted relative to the training signal
        let validation = FeatureSet::from_rows(
            train.features.clone(),
            train.labels.mapv(|l| 1.0 - l),
        );
        let cfg = TrainingConfig {
            early_stopping_patience: 2,
            ..config(15)
        };
        let report = Trainer::new(cfg).fit(&mut model, &train, &validation, None).unwrap();
        assert!(report.stopped_early);
        assert!(report.epochs.len() < 15);
        assert!(report.checkpoint.is_none());
    }

    #[test]
    fn fit_directory_reads_class_partitions() {
        let dir = tempdir().unwrap();
        for (class, colour) in [("cats", [220, 30, 30]), ("dogs", [30, 30, 220])] {
            let class_dir = dir.path().join(class);
            fs::create_dir_all(&class_dir).unwrap();
            for i in 0..3 {
                fs::write(class_dir.join(format!("{i}.png")), solid_png(20, 20, colour)).unwrap();
            }
        }
        fs::write(dir.path().join("cats/broken.png"), b"not a png").unwrap();
        let mut model = small_model();
        let report = Trainer::new(TrainingConfig {
            augment: true,
            ..config(3)
        })
        .fit_directory(&mut model, dir.path(), None)
        .unwrap();
        // three per class is too few to hold any out, so validation reuses train
        assert_eq!(report.train_samples, 6);
        assert_eq!(report.validation_samples, 6);
        assert_eq!(report.epochs.len(), 3);
    }

    #[test]
    fn fit_directory_on_empty_corpus_errors() {
        let dir = tempdir().unwrap();
        let mut model = small_model();
        let err = Trainer::default()
            .fit_directory(&mut model, dir.path(), None)
            .unwrap_err();
        assert!(matches!(err, LearningError::EmptyDataset(_)));
    }
}
