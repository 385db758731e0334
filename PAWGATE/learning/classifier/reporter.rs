use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Metrics recorded at the end of one epoch.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EpochSnapshot {
    /// Zero-based epoch index.
    pub epoch: usize,
    /// Training loss (unaugmented pass).
    pub loss: f32,
    /// Training accuracy.
    pub accuracy: f32,
    /// Validation loss.
    pub val_loss: f32,
    /// Validation accuracy.
    pub val_accuracy: f32,
    /// Learning rate used during the epoch.
    pub learning_rate: f32,
}

/// Training history.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TrainingReport {
    /// Per-epoch history.
    pub epochs: Vec<EpochSnapshot>,
    /// True if early stopping ended the run.
    pub stopped_early: bool,
    /// Best-accuracy checkpoint written during the run.
    pub checkpoint: Option<PathBuf>,
    /// Epoch the checkpoint was taken from.
    pub checkpoint_epoch: Option<usize>,
    /// Training sample count.
    pub train_samples: usize,
    /// Validation sample count.
    pub validation_samples: usize,
}

impl TrainingReport {
    /// Epoch with the highest validation accuracy (earliest on ties).
    #[must_use]
    pub fn best(&self) -> Option<&EpochSnapshot> {
        self.epochs.iter().fold(None, |best, snap| match best {
            Some(b) if b.val_accuracy >= snap.val_accuracy => Some(b),
            _ => Some(snap),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snap(epoch: usize, val_accuracy: f32) -> EpochSnapshot {
        EpochSnapshot {
            epoch,
            loss: 0.5,
            accuracy: 0.5,
            val_loss: 0.5,
            val_accuracy,
            learning_rate: 1e-4,
        }
    }

    #[test]
    fn best_prefers_earliest_top_accuracy() {
        let report = TrainingReport {
            epochs: vec![snap(0, 0.5), snap(1, 0.9), snap(2, 0.9)],
            ..TrainingReport::default()
        };
        assert_eq!(report.best().unwrap().epoch, 1);
        assert!(TrainingReport::default().best().is_none());
    }
}
