use std::{
    fs,
    path::{Path, PathBuf},
};

use indexmap::IndexMap;
use rand::{rngs::SmallRng, seq::SliceRandom, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::{
    errors::{LearningError, LearningResult},
    preprocess::has_image_extension,
};

/// Directory names of the two classes, indexed by class id.
pub const CLASS_NAMES: [&str; 2] = ["cats", "dogs"];

/// Image file paired with its class index (0 = cats, 1 = dogs).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabeledPath {
    /// Image location.
    pub path: PathBuf,
    /// Class index.
    pub label: u8,
}

/// Key the grand total is reported under; never a class name.
pub const TOTAL_KEY: &str = "total";

/// Per-class image counts in directory order, plus the grand total.
///
/// Serialises flat as `{"cats": n, "dogs": m, "total": n + m}`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetStats {
    #[serde(flatten)]
    classes: IndexMap<String, usize>,
    total: usize,
}

impl DatasetStats {
    /// Count for a class directory, zero if absent.
    #[must_use]
    pub fn count(&self, class_name: &str) -> usize {
        self.classes.get(class_name).copied().unwrap_or(0)
    }

    /// Sum over every class.
    #[must_use]
    pub const fn total(&self) -> usize {
        self.total
    }

    /// Class names present.
    pub fn classes(&self) -> impl Iterator<Item = &str> {
        self.classes.keys().map(String::as_str)
    }
}

/// Counts image files by class subdirectory of `dir`.
///
/// A missing or unreadable directory yields `{ total: 0 }`. A subdirectory
/// named `total` would collide with the grand total and is skipped.
#[must_use]
pub fn dataset_statistics(dir: impl AsRef<Path>) -> DatasetStats {
    let mut classes = IndexMap::new();
    for class_dir in sorted_subdirs(dir.as_ref()) {
        let Some(name) = class_dir.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if name == TOTAL_KEY {
            tracing::warn!(path = %class_dir.display(), "skipping class directory with reserved name");
            continue;
        }
        classes.insert(name.to_string(), image_files(&class_dir).len());
    }
    let total = classes.values().sum();
    DatasetStats { classes, total }
}

/// Lists `(path, label)` pairs for the `cats`/`dogs` partitions of `dir`.
pub fn load_labeled_dir(dir: impl AsRef<Path>) -> LearningResult<Vec<LabeledPath>> {
    let dir = dir.as_ref();
    let mut samples = Vec::new();
    for (label, class_name) in CLASS_NAMES.iter().enumerate() {
        for path in image_files(&dir.join(class_name)) {
            samples.push(LabeledPath {
                path,
                label: u8::try_from(label).unwrap_or(u8::MAX),
            });
        }
    }
    if samples.is_empty() {
        return Err(LearningError::EmptyDataset(dir.to_path_buf()));
    }
    Ok(samples)
}

/// Stratified train/validation split.
///
/// Each class contributes `floor(n * fraction)` shuffled samples to
/// validation. When that leaves the validation side empty the training set
/// doubles as validation so plateau tracking still has a signal.
pub fn split_validation(
    samples: &[LabeledPath],
    fraction: f32,
    seed: u64,
) -> LearningResult<(Vec<LabeledPath>, Vec<LabeledPath>)> {
    if !(0.0..1.0).contains(&fraction) {
        return Err(LearningError::InvalidConfig(format!(
            "validation split {fraction} outside [0, 1)"
        )));
    }
    let mut rng = SmallRng::seed_from_u64(seed);
    let mut train = Vec::new();
    let mut validation = Vec::new();
    for label in 0..CLASS_NAMES.len() {
        let mut class: Vec<LabeledPath> = samples
            .iter()
            .filter(|s| usize::from(s.label) == label)
            .cloned()
            .collect();
        class.shuffle(&mut rng);
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
        let n_val = (class.len() as f32 * fraction).floor() as usize;
        validation.extend(class.drain(..n_val));
        train.extend(class);
    }
    if validation.is_empty() {
        validation = train.clone();
    }
    Ok((train, validation))
}

fn sorted_subdirs(dir: &Path) -> Vec<PathBuf> {
    let Ok(entries) = fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut dirs: Vec<PathBuf> = entries
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .filter(|path| path.is_dir())
        .collect();
    dirs.sort();
    dirs
}

fn image_files(dir: &Path) -> Vec<PathBuf> {
    let Ok(entries) = fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut files: Vec<PathBuf> = entries
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .filter(|path| path.is_file() && has_image_extension(path))
        .collect();
    files.sort();
    files
}
