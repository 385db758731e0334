use std::{
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use pawgate_learning::{BinaryClassifier, ClassifierModel};

/// Active classifier together with where it came from.
pub struct LoadedModel {
    /// Scoring implementation.
    pub classifier: Box<dyn BinaryClassifier>,
    /// Checkpoint the classifier was read from, if any.
    pub source: Option<PathBuf>,
    /// Load time.
    pub loaded_at: DateTime<Utc>,
    /// Handle version this model was installed as.
    pub version: u64,
}

impl std::fmt::Debug for LoadedModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadedModel")
            .field("architecture", &self.classifier.architecture())
            .field("source", &self.source)
            .field("version", &self.version)
            .finish_non_exhaustive()
    }
}

/// Versioned slot holding the active model.
///
/// Readers clone the inner `Arc` and score against that snapshot; a swap only
/// replaces the pointer, so in-flight requests finish on the model they took.
#[derive(Debug, Default)]
pub struct ModelHandle {
    slot: RwLock<Option<Arc<LoadedModel>>>,
    version: AtomicU64,
}

impl ModelHandle {
    /// Empty handle.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Current model, if any.
    #[must_use]
    pub fn snapshot(&self) -> Option<Arc<LoadedModel>> {
        self.slot.read().clone()
    }

    /// True when a model is installed.
    #[must_use]
    pub fn is_loaded(&self) -> bool {
        self.slot.read().is_some()
    }

    /// Version of the installed model; 0 before the first install.
    #[must_use]
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    /// Installs `classifier` and returns its version.
    pub fn install(&self, classifier: Box<dyn BinaryClassifier>, source: Option<&Path>) -> u64 {
        let mut slot = self.slot.write();
        let version = self.version.fetch_add(1, Ordering::AcqRel) + 1;
        *slot = Some(Arc::new(LoadedModel {
            classifier,
            source: source.map(Path::to_path_buf),
            loaded_at: Utc::now(),
            version,
        }));
        version
    }

    /// Loads a checkpoint from disk and installs it.
    pub fn load_checkpoint(&self, path: &Path) -> pawgate_learning::LearningResult<u64> {
        let model = ClassifierModel::load(path)?;
        Ok(self.install(Box::new(model), Some(path)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::RgbImage;
    use pawgate_learning::LearningResult;

    struct Constant(f32);

    impl BinaryClassifier for Constant {
        fn predict_proba(&self, _image: &RgbImage) -> LearningResult<f32> {
            Ok(self.0)
        }

        fn architecture(&self) -> &str {
            "constant"
        }
    }

    #[test]
    fn swap_keeps_old_snapshot_alive() {
        let handle = ModelHandle::empty();
        assert!(handle.snapshot().is_none());
        assert_eq!(handle.version(), 0);
        assert_eq!(handle.install(Box::new(Constant(0.2)), None), 1);
        let before = handle.snapshot().unwrap();
        assert_eq!(handle.install(Box::new(Constant(0.9)), None), 2);
        let image = RgbImage::new(1, 1);
        assert!((before.classifier.predict_proba(&image).unwrap() - 0.2).abs() < f32::EPSILON);
        let after = handle.snapshot().unwrap();
        assert!((after.classifier.predict_proba(&image).unwrap() - 0.9).abs() < f32::EPSILON);
        assert_eq!(after.version, 2);
    }

    #[test]
    fn failed_checkpoint_load_keeps_current_model() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.json");
        std::fs::write(&path, b"{ not json").unwrap();
        let handle = ModelHandle::empty();
        handle.install(Box::new(Constant(0.7)), None);
        assert!(handle.load_checkpoint(&path).is_err());
        assert_eq!(handle.version(), 1);
        assert!(handle.is_loaded());
    }
}
