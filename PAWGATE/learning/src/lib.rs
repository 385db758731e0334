#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    missing_docs,
    rust_2018_idioms
)]

//! Pawgate learning core: preprocessing, the cat/dog classifier, its training
//! loop and evaluation metrics.

/// Error types.
#[path = "../errors.rs"]
pub mod errors;

/// Image decoding and normalisation.
#[path = "../preprocess.rs"]
pub mod preprocess;

/// Class-partitioned dataset discovery and splitting.
#[path = "../dataloader.rs"]
pub mod dataloader;

/// Atomic file replacement.
#[path = "../persist.rs"]
pub mod persist;

/// Classifier model, trainer and pipeline.
#[path = "../classifier/main.rs"]
pub mod classifier;

/// Evaluation metrics.
#[path = "../metrics.rs"]
pub mod metrics;

/// Persisted model configuration.
#[path = "../model_config.rs"]
pub mod model_config;

pub use classifier::{
    model::{BinaryClassifier, ClassifierModel},
    reporter::{EpochSnapshot, TrainingReport},
    trainer::{Trainer, TrainingConfig},
    ClassifierPipeline, ModelPaths, PipelineReport,
};
pub use dataloader::{dataset_statistics, load_labeled_dir, DatasetStats, LabeledPath, CLASS_NAMES};
pub use errors::{LearningError, LearningResult};
pub use metrics::EvaluationMetrics;
pub use model_config::ModelConfig;
pub use preprocess::{ImageTensor, Preprocessor};
