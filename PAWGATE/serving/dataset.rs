use std::{
    fmt,
    path::{Path, PathBuf},
    str::FromStr,
};

use pawgate_learning::{
    dataset_statistics, load_labeled_dir, persist, preprocess::has_image_extension, DatasetStats,
    LabeledPath, LearningError,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ServingError, ServingResult};

/// Class partition an upload is stored under.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ClassLabel {
    /// `cats/`
    Cats,
    /// `dogs/`
    Dogs,
}

impl ClassLabel {
    /// Directory name of the partition.
    #[must_use]
    pub const fn dir_name(self) -> &'static str {
        match self {
            Self::Cats => "cats",
            Self::Dogs => "dogs",
        }
    }
}

impl fmt::Display for ClassLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.dir_name())
    }
}

impl FromStr for ClassLabel {
    type Err = ServingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cat" | "cats" => Ok(Self::Cats),
            "dog" | "dogs" => Ok(Self::Dogs),
            other => Err(ServingError::InvalidInput(format!(
                "class must be 'cats' or 'dogs', got '{other}'"
            ))),
        }
    }
}

/// One file from a multipart upload.
#[derive(Debug, Clone, Default)]
pub struct UploadedFile {
    /// Client-supplied file name.
    pub filename: Option<String>,
    /// Declared content type.
    pub content_type: Option<String>,
    /// Raw bytes.
    pub bytes: Vec<u8>,
}

impl UploadedFile {
    /// True when the declared content type is `image/*`.
    #[must_use]
    pub fn is_image(&self) -> bool {
        self.content_type
            .as_deref()
            .is_some_and(|ct| ct.trim().to_ascii_lowercase().starts_with("image/"))
    }

    fn display_name(&self) -> &str {
        self.filename.as_deref().unwrap_or("<unnamed>")
    }
}

/// Result of a batch upload; per-file failures never abort the batch.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct UploadReport {
    /// Files written.
    pub uploaded_count: usize,
    /// Stored file names.
    pub filenames: Vec<String>,
    /// `"<name>: <reason>"` for each rejected file.
    pub errors: Vec<String>,
    /// Target class.
    pub class: String,
}

const STORE_ATTEMPTS: usize = 8;

/// Class-partitioned store of labeled uploads used as the retraining corpus.
#[derive(Debug, Clone)]
pub struct DatasetAccumulator {
    root: PathBuf,
}

impl DatasetAccumulator {
    /// Accumulator rooted at `root` (`root/cats`, `root/dogs`).
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Corpus root.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Writes one upload under its class partition and returns the stored path.
    pub fn store(&self, file: &UploadedFile, label: ClassLabel) -> ServingResult<PathBuf> {
        if !file.is_image() {
            return Err(ServingError::InvalidInput("Not an image".into()));
        }
        if file.bytes.is_empty() {
            return Err(ServingError::InvalidInput("empty file".into()));
        }
        let dir = self.root.join(label.dir_name());
        let name = sanitize_filename(file.filename.as_deref(), file.content_type.as_deref());
        let mut path = dir.join(&name);
        for _ in 0..STORE_ATTEMPTS {
            if persist::write_new(&path, &file.bytes)? {
                tracing::debug!(path = %path.display(), class = %label, "stored training upload");
                return Ok(path);
            }
            path = dir.join(format!("{}-{name}", &Uuid::new_v4().simple().to_string()[..8]));
        }
        Err(std::io::Error::new(
            std::io::ErrorKind::AlreadyExists,
            format!("no free name for {name} in {}", dir.display()),
        )
        .into())
    }

    /// Stores every file, collecting per-file errors.
    #[must_use]
    pub fn store_batch(&self, files: &[UploadedFile], label: ClassLabel) -> UploadReport {
        let mut report = UploadReport {
            class: label.dir_name().to_string(),
            ..UploadReport::default()
        };
        for file in files {
            match self.store(file, label) {
                Ok(path) => {
                    let stored = path
                        .file_name()
                        .map(|n| n.to_string_lossy().into_owned())
                        .unwrap_or_default();
                    report.filenames.push(stored);
                }
                Err(ServingError::InvalidInput(reason)) => {
                    report.errors.push(format!("{}: {reason}", file.display_name()));
                }
                Err(err) => {
                    tracing::warn!(file = file.display_name(), error = %err, "failed to store upload");
                    report.errors.push(format!("{}: {err}", file.display_name()));
                }
            }
        }
        report.uploaded_count = report.filenames.len();
        report
    }

    /// Per-class image counts.
    #[must_use]
    pub fn stats(&self) -> DatasetStats {
        dataset_statistics(&self.root)
    }

    /// True when no class partition holds an image.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.stats().total() == 0
    }

    /// Labeled samples for training; `None` when the corpus is empty.
    pub fn load_samples(&self) -> ServingResult<Option<Vec<LabeledPath>>> {
        match load_labeled_dir(&self.root) {
            Ok(samples) => Ok(Some(samples)),
            Err(LearningError::EmptyDataset(_)) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }
}

/// Reduces a client file name to a safe final path component. Missing or
/// unusable names become `upload-<uuid>`; a recognised extension is added from
/// the content type when the name has none.
#[must_use]
pub fn sanitize_filename(filename: Option<&str>, content_type: Option<&str>) -> String {
    let base = filename
        .map(|name| name.rsplit(|c: char| c == '/' || c == '\\').next().unwrap_or_default().trim())
        .filter(|name| !name.is_empty() && *name != "." && *name != "..")
        .map_or_else(
            || format!("upload-{}", Uuid::new_v4().simple()),
            str::to_string,
        );
    if has_image_extension(Path::new(&base)) {
        return base;
    }
    let extension = match content_type.map(|ct| ct.trim().to_ascii_lowercase()).as_deref() {
        Some("image/png") => Some("png"),
        Some("image/jpeg" | "image/jpg" | "image/pjpeg") => Some("jpg"),
        _ => None,
    };
    extension.map_or_else(|| base.clone(), |ext| format!("{base}.{ext}"))
}
