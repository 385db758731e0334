use std::path::Path;

use chrono::{DateTime, Utc};
use image::RgbImage;
use ndarray::{Array1, Array2, Axis, Dimension, Zip};
use rand::{rngs::SmallRng, Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use super::backbone::PooledColourBackbone;
use crate::{
    errors::{LearningError, LearningResult},
    persist,
    preprocess::{ImageTensor, Preprocessor},
};

/// Checkpoint format written by this crate.
pub const CHECKPOINT_FORMAT: u32 = 1;

const EPSILON: f32 = 1e-7;

/// Anything that scores an RGB image as P(dog).
pub trait BinaryClassifier: Send + Sync {
    /// Probability of class index 1 (`dogs`).
    fn predict_proba(&self, image: &RgbImage) -> LearningResult<f32>;

    /// Human-readable architecture tag.
    fn architecture(&self) -> &str;
}

/// Per-feature standardisation fitted on the training set.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FeatureScaler {
    mean: Array1<f32>,
    std: Array1<f32>,
}

impl FeatureScaler {
    /// Fits mean/std column-wise.
    #[must_use]
    pub fn fit(features: &Array2<f32>) -> Self {
        let mean = features
            .mean_axis(Axis(0))
            .unwrap_or_else(|| Array1::zeros(features.ncols()));
        let std = features
            .std_axis(Axis(0), 0.0)
            .mapv(|s| if s < 1e-6 { 1.0 } else { s });
        Self { mean, std }
    }

    fn check_width(&self, width: usize) -> LearningResult<()> {
        for found in [self.mean.len(), self.std.len()] {
            if found != width {
                return Err(LearningError::ShapeMismatch {
                    expected: width,
                    found,
                });
            }
        }
        Ok(())
    }

    /// Applies the fitted transform row-wise.
    #[must_use]
    pub fn transform(&self, features: &Array2<f32>) -> Array2<f32> {
        (features - &self.mean) / &self.std
    }
}

/// Trainable dense head: `features -> hidden (relu) -> sigmoid`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DenseHead {
    w1: Array2<f32>,
    b1: Array1<f32>,
    w2: Array1<f32>,
    b2: f32,
}

/// Gradients matching [`DenseHead`] parameters.
#[derive(Debug, Clone)]
pub struct HeadGradients {
    w1: Array2<f32>,
    b1: Array1<f32>,
    w2: Array1<f32>,
    b2: f32,
}

impl DenseHead {
    /// Glorot-uniform initialisation.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn new(inputs: usize, hidden: usize, seed: u64) -> Self {
        let mut rng = SmallRng::seed_from_u64(seed);
        let limit1 = (6.0 / (inputs + hidden) as f32).sqrt();
        let limit2 = (6.0 / (hidden + 1) as f32).sqrt();
        Self {
            w1: Array2::from_shape_fn((inputs, hidden), |_| rng.gen_range(-limit1..limit1)),
            b1: Array1::zeros(hidden),
            w2: Array1::from_shape_fn(hidden, |_| rng.gen_range(-limit2..limit2)),
            b2: 0.0,
        }
    }

    /// Expected input width.
    #[must_use]
    pub fn inputs(&self) -> usize {
        self.w1.nrows()
    }

    /// Hidden layer width.
    #[must_use]
    pub fn hidden_units(&self) -> usize {
        self.w1.ncols()
    }

    /// Bias and output weights must match the hidden width of `w1`.
    fn check_shape(&self) -> LearningResult<()> {
        let hidden = self.hidden_units();
        for found in [self.b1.len(), self.w2.len()] {
            if found != hidden {
                return Err(LearningError::ShapeMismatch {
                    expected: hidden,
                    found,
                });
            }
        }
        Ok(())
    }

    fn hidden(&self, x: &Array2<f32>) -> Array2<f32> {
        (x.dot(&self.w1) + &self.b1).mapv(|z| z.max(0.0))
    }

    /// Probabilities for a batch of scaled feature rows.
    #[must_use]
    pub fn forward(&self, x: &Array2<f32>) -> Array1<f32> {
        (self.hidden(x).dot(&self.w2) + self.b2).mapv(sigmoid)
    }

    /// Binary cross-entropy loss and its gradients for one batch.
    #[allow(clippy::cast_precision_loss)]
    pub fn backward(&self, x: &Array2<f32>, y: &Array1<f32>) -> (f32, HeadGradients) {
        let n = x.nrows().max(1) as f32;
        let a1 = self.hidden(x);
        let p = (a1.dot(&self.w2) + self.b2).mapv(sigmoid);
        let loss = binary_cross_entropy(y, &p);
        let dz2 = (&p - y) / n;
        let w2 = &self.w2;
        let dz1 = Array2::from_shape_fn(a1.dim(), |(i, j)| {
            if a1[[i, j]] > 0.0 {
                dz2[i] * w2[j]
            } else {
                0.0
            }
        });
        let grads = HeadGradients {
            w1: x.t().dot(&dz1),
            b1: dz1.sum_axis(Axis(0)),
            w2: a1.t().dot(&dz2),
            b2: dz2.sum(),
        };
        (loss, grads)
    }
}

/// Adam optimiser state for a [`DenseHead`].
#[derive(Debug, Clone)]
pub struct Adam {
    m: HeadGradients,
    v: HeadGradients,
    step: i32,
}

impl Adam {
    const BETA1: f32 = 0.9;
    const BETA2: f32 = 0.999;

    /// Zeroed moments shaped after `head`.
    #[must_use]
    pub fn new(head: &DenseHead) -> Self {
        let zeros = HeadGradients {
            w1: Array2::zeros(head.w1.dim()),
            b1: Array1::zeros(head.b1.len()),
            w2: Array1::zeros(head.w2.len()),
            b2: 0.0,
        };
        Self {
            m: zeros.clone(),
            v: zeros,
            step: 0,
        }
    }

    /// Applies one update with learning rate `lr`.
    pub fn apply(&mut self, head: &mut DenseHead, grads: &HeadGradients, lr: f32) {
        self.step = self.step.saturating_add(1);
        let lr_t = lr * (1.0 - Self::BETA2.powi(self.step)).sqrt()
            / (1.0 - Self::BETA1.powi(self.step));
        adam_update(&mut head.w1, &grads.w1, &mut self.m.w1, &mut self.v.w1, lr_t);
        adam_update(&mut head.b1, &grads.b1, &mut self.m.b1, &mut self.v.b1, lr_t);
        adam_update(&mut head.w2, &grads.w2, &mut self.m.w2, &mut self.v.w2, lr_t);
        self.m.b2 = Self::BETA1 * self.m.b2 + (1.0 - Self::BETA1) * grads.b2;
        self.v.b2 = Self::BETA2 * self.v.b2 + (1.0 - Self::BETA2) * grads.b2 * grads.b2;
        head.b2 -= lr_t * self.m.b2 / (self.v.b2.sqrt() + EPSILON);
    }
}

fn adam_update<D: Dimension>(
    param: &mut ndarray::Array<f32, D>,
    grad: &ndarray::Array<f32, D>,
    m: &mut ndarray::Array<f32, D>,
    v: &mut ndarray::Array<f32, D>,
    lr_t: f32,
) {
    Zip::from(param)
        .and(grad)
        .and(m)
        .and(v)
        .for_each(|p, &g, m, v| {
            *m = Adam::BETA1 * *m + (1.0 - Adam::BETA1) * g;
            *v = Adam::BETA2 * *v + (1.0 - Adam::BETA2) * g * g;
            *p -= lr_t * *m / (v.sqrt() + EPSILON);
        });
}

/// Logistic function.
#[must_use]
pub fn sigmoid(z: f32) -> f32 {
    if z >= 0.0 {
        1.0 / (1.0 + (-z).exp())
    } else {
        let e = z.exp();
        e / (1.0 + e)
    }
}

/// Mean binary cross-entropy with probabilities clipped to `[eps, 1 - eps]`.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn binary_cross_entropy(y: &Array1<f32>, p: &Array1<f32>) -> f32 {
    if y.is_empty() {
        return 0.0;
    }
    let total: f32 = y
        .iter()
        .zip(p.iter())
        .map(|(&t, &q)| {
            let q = q.clamp(EPSILON, 1.0 - EPSILON);
            -(t * q.ln() + (1.0 - t) * (1.0 - q).ln())
        })
        .sum();
    total / y.len() as f32
}

/// Cat/dog classifier: frozen backbone, feature scaler and dense head.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClassifierModel {
    /// Checkpoint format version.
    pub format_version: u32,
    /// Architecture tag.
    pub architecture: String,
    /// Input geometry.
    pub input: Preprocessor,
    /// Feature extractor.
    pub backbone: PooledColourBackbone,
    /// Standardisation fitted during the first training run.
    pub scaler: Option<FeatureScaler>,
    /// Trainable weights.
    pub head: DenseHead,
    /// Time the weights were last written.
    pub updated_at: DateTime<Utc>,
}

impl ClassifierModel {
    /// Architecture tag recorded in checkpoints and model config.
    pub const ARCHITECTURE: &'static str = "PooledColour backbone + dense head";

    /// Fresh model with random head weights.
    #[must_use]
    pub fn new(input: Preprocessor, backbone: PooledColourBackbone, hidden: usize, seed: u64) -> Self {
        Self {
            format_version: CHECKPOINT_FORMAT,
            architecture: Self::ARCHITECTURE.to_string(),
            input,
            head: DenseHead::new(backbone.dim(), hidden.max(1), seed),
            backbone,
            scaler: None,
            updated_at: Utc::now(),
        }
    }

    /// Raw backbone features for a normalised tensor.
    #[must_use]
    pub fn features(&self, image: &ImageTensor) -> Array1<f32> {
        self.backbone.extract(image)
    }

    /// Scales raw feature rows with the fitted scaler (identity if unfitted).
    #[must_use]
    pub fn scale(&self, features: &Array2<f32>) -> Array2<f32> {
        self.scaler
            .as_ref()
            .map_or_else(|| features.clone(), |scaler| scaler.transform(features))
    }

    /// Probabilities for raw (unscaled) feature rows.
    pub fn predict_features(&self, features: &Array2<f32>) -> LearningResult<Array1<f32>> {
        if features.ncols() != self.head.inputs() {
            return Err(LearningError::ShapeMismatch {
                expected: self.head.inputs(),
                found: features.ncols(),
            });
        }
        Ok(self.head.forward(&self.scale(features)))
    }

    /// Probability for a single preprocessed tensor.
    pub fn predict_tensor(&self, image: &ImageTensor) -> LearningResult<f32> {
        let row = self.features(image).insert_axis(Axis(0));
        Ok(self.predict_features(&row)?[0])
    }

    /// Writes the checkpoint atomically.
    pub fn save(&self, path: impl AsRef<Path>) -> LearningResult<()> {
        let bytes = serde_json::to_vec(self)?;
        persist::write_atomic(path.as_ref(), &bytes)
    }

    /// Loads and validates a checkpoint.
    pub fn load(path: impl AsRef<Path>) -> LearningResult<Self> {
        let bytes = std::fs::read(path.as_ref())?;
        let model: Self = serde_json::from_slice(&bytes)?;
        let width = model.backbone.dim();
        if model.head.inputs() != width {
            return Err(LearningError::ShapeMismatch {
                expected: width,
                found: model.head.inputs(),
            });
        }
        model.head.check_shape()?;
        if let Some(scaler) = &model.scaler {
            scaler.check_width(width)?;
        }
        Ok(model)
    }
}

impl BinaryClassifier for ClassifierModel {
    fn predict_proba(&self, image: &RgbImage) -> LearningResult<f32> {
        if self.scaler.is_none() {
            return Err(LearningError::NotTrained);
        }
        self.predict_tensor(&self.input.tensor_from_rgb(image))
    }

    fn architecture(&self) -> &str {
        &self.architecture
    }
}
