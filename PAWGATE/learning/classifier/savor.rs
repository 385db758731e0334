use std::path::{Path, PathBuf};

use super::model::{ClassifierModel, DenseHead};
use crate::errors::LearningResult;

/// Stops training once validation loss has not improved for `patience`
/// epochs and remembers the head weights of the best epoch.
#[derive(Debug, Clone)]
pub struct EarlyStopping {
    patience: usize,
    best_loss: f32,
    wait: usize,
    best_weights: Option<DenseHead>,
}

impl EarlyStopping {
    /// Creates the callback.
    #[must_use]
    pub const fn new(patience: usize) -> Self {
        Self {
            patience,
            best_loss: f32::INFINITY,
            wait: 0,
            best_weights: None,
        }
    }

    /// Records an epoch; returns `true` when training should stop.
    pub fn observe(&mut self, val_loss: f32, head: &DenseHead) -> bool {
        if val_loss < self.best_loss {
            self.best_loss = val_loss;
            self.wait = 0;
            self.best_weights = Some(head.clone());
            return false;
        }
        self.wait += 1;
        self.wait >= self.patience
    }

    /// Weights captured at the lowest validation loss.
    #[must_use]
    pub const fn best_weights(&self) -> Option<&DenseHead> {
        self.best_weights.as_ref()
    }
}

/// Multiplies the learning rate by `factor` after `patience` epochs without
/// validation-loss improvement, never going below `min_lr`.
#[derive(Debug, Clone)]
pub struct ReduceLrOnPlateau {
    factor: f32,
    patience: usize,
    min_lr: f32,
    min_delta: f32,
    best_loss: f32,
    wait: usize,
}

impl ReduceLrOnPlateau {
    /// Creates the callback.
    #[must_use]
    pub const fn new(factor: f32, patience: usize, min_lr: f32) -> Self {
        Self {
            factor,
            patience,
            min_lr,
            min_delta: 1e-4,
            best_loss: f32::INFINITY,
            wait: 0,
        }
    }

    /// Records an epoch and returns the learning rate for the next one.
    pub fn observe(&mut self, val_loss: f32, lr: f32) -> f32 {
        if val_loss < self.best_loss - self.min_delta {
            self.best_loss = val_loss;
            self.wait = 0;
            return lr;
        }
        self.wait += 1;
        if self.wait >= self.patience && lr > self.min_lr {
            self.wait = 0;
            let reduced = (lr * self.factor).max(self.min_lr);
            tracing::info!(from = lr, to = reduced, "reducing learning rate on plateau");
            return reduced;
        }
        lr
    }
}

/// Writes the model to disk whenever validation accuracy improves.
#[derive(Debug, Clone)]
pub struct CheckpointSavor {
    path: PathBuf,
    best_accuracy: f32,
    saved_epoch: Option<usize>,
}

impl CheckpointSavor {
    /// Targets `path` for best-epoch checkpoints.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            best_accuracy: f32::NEG_INFINITY,
            saved_epoch: None,
        }
    }

    /// Saves `model` if `val_accuracy` beats every earlier epoch.
    pub fn observe(
        &mut self,
        epoch: usize,
        val_accuracy: f32,
        model: &ClassifierModel,
    ) -> LearningResult<bool> {
        if val_accuracy <= self.best_accuracy {
            return Ok(false);
        }
        model.save(&self.path)?;
        self.best_accuracy = val_accuracy;
        self.saved_epoch = Some(epoch);
        Ok(true)
    }

    /// Epoch of the last checkpoint written.
    #[must_use]
    pub const fn saved_epoch(&self) -> Option<usize> {
        self.saved_epoch
    }

    /// Checkpoint location.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{classifier::backbone::PooledColourBackbone, preprocess::Preprocessor};
    use tempfile::tempdir;

    fn head(seed: u64) -> DenseHead {
        DenseHead::new(3, 2, seed)
    }

    #[test]
    fn early_stopping_waits_for_patience() {
        let mut stop = EarlyStopping::new(2);
        assert!(!stop.observe(0.9, &head(1)));
        assert!(!stop.observe(0.5, &head(2)));
        assert!(!stop.observe(0.6, &head(3)));
        assert!(stop.observe(0.7, &head(4)));
        assert_eq!(stop.best_weights(), Some(&head(2)));
    }

    #[test]
    fn early_stopping_resets_on_improvement() {
        let mut stop = EarlyStopping::new(2);
        stop.observe(0.9, &head(1));
        stop.observe(1.0, &head(1));
        assert!(!stop.observe(0.8, &head(1)));
        assert!(!stop.observe(0.85, &head(1)));
        assert!(stop.observe(0.85, &head(1)));
    }

    #[test]
    fn plateau_halves_learning_rate_with_floor() {
        let mut plateau = ReduceLrOnPlateau::new(0.5, 2, 0.3);
        let mut lr = plateau.observe(1.0, 1.0);
        assert!((lr - 1.0).abs() < f32::EPSILON);
        lr = plateau.observe(1.0, lr);
        lr = plateau.observe(1.0, lr);
        assert!((lr - 0.5).abs() < f32::EPSILON);
        lr = plateau.observe(1.0, lr);
        lr = plateau.observe(1.0, lr);
        assert!((lr - 0.3).abs() < f32::EPSILON);
        lr = plateau.observe(1.0, lr);
        lr = plateau.observe(1.0, lr);
        assert!((lr - 0.3).abs() < f32::EPSILON);
    }

    #[test]
    fn checkpoint_only_on_better_accuracy() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("retrained_model.json");
        let model = ClassifierModel::new(
            Preprocessor::square(8),
            PooledColourBackbone::default(),
            2,
            5,
        );
        let mut savor = CheckpointSavor::new(&path);
        assert!(savor.observe(0, 0.6, &model).unwrap());
        assert!(!savor.observe(1, 0.6, &model).unwrap());
        assert!(!savor.observe(2, 0.4, &model).unwrap());
        assert!(savor.observe(3, 0.8, &model).unwrap());
        assert_eq!(savor.saved_epoch(), Some(3));
        assert!(path.exists());
    }
}
