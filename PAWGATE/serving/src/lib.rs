#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    missing_docs,
    rust_2018_idioms
)]

//! Pawgate serving layer: the detector gate, inference over a swappable
//! active model, single-flight retraining and the upload corpus.

/// Serving error taxonomy.
#[path = "../error.rs"]
pub mod error;

/// JSONL log and event bus sinks.
#[path = "../telemetry.rs"]
pub mod telemetry;

/// Versioned active-model slot.
#[path = "../model_handle.rs"]
pub mod model_handle;

/// Cat/dog gate over a general-purpose detector.
#[path = "../gatekeeper.rs"]
pub mod gatekeeper;

/// Prediction service and prediction log.
#[path = "../inference.rs"]
pub mod inference;

/// Labeled upload storage.
#[path = "../dataset.rs"]
pub mod dataset;

/// Retrain state machine.
#[path = "../retrain.rs"]
pub mod retrain;

/// Shared handler state.
#[path = "../state.rs"]
pub mod state;

pub use dataset::{ClassLabel, DatasetAccumulator, UploadReport, UploadedFile};
pub use error::{ServingError, ServingResult};
pub use gatekeeper::{
    Detection, Gatekeeper, GatekeeperDecision, GatekeeperPolicy, ObjectDetector, PrototypeDetector,
};
pub use inference::{InferenceService, Prediction, PredictionRecord, PredictionStatistics};
pub use model_handle::{LoadedModel, ModelHandle};
pub use retrain::{RetrainOrchestrator, RetrainOutcome, RetrainStatus};
pub use state::{AppState, ClassifyResponse, DatasetOverview, ServiceStatus};
pub use telemetry::{ServingTelemetry, ServingTelemetryBuilder};
