use std::{fs, sync::Arc};

use anyhow::{Context, Result};
use pawgate_learning::{ClassifierPipeline, ModelPaths};
use pawgate_serving::{
    AppState, DatasetAccumulator, Gatekeeper, InferenceService, ModelHandle, PrototypeDetector,
    RetrainOrchestrator, ServingTelemetry,
};
use shared_event_bus::{FanoutPublisher, FileEventPublisher, MemoryEventBus};
use shared_logging::RecordLog;

use crate::config::{GatekeeperConfig, PawgateConfig};

/// Training pipeline for the configured hyperparameters and geometry.
#[must_use]
pub fn pipeline(config: &PawgateConfig) -> ClassifierPipeline {
    ClassifierPipeline::new(
        config.training.clone(),
        config.preprocessing.preprocessor(),
    )
}

/// Model directory layout for the configuration.
#[must_use]
pub fn model_paths(config: &PawgateConfig) -> ModelPaths {
    ModelPaths::new(&config.paths.model_dir)
}

/// Events retained in memory for live subscribers.
pub const EVENT_BACKLOG: usize = 256;

/// Shared state plus the in-memory side of the event bus.
#[derive(Debug)]
pub struct Services {
    /// Handler state.
    pub state: AppState,
    /// Lifecycle events, also appended to `events.jsonl`.
    pub events: Arc<MemoryEventBus>,
}

/// [`build`] without the event bus handle.
pub fn build_state(config: &PawgateConfig) -> Result<AppState> {
    Ok(build(config)?.state)
}

/// Wires telemetry, the model slot, the gate and the retrain orchestrator.
/// A missing or unreadable active checkpoint leaves the service running
/// without a model.
pub fn build(config: &PawgateConfig) -> Result<Services> {
    let paths = model_paths(config);
    let log_dir = &config.paths.log_dir;
    fs::create_dir_all(paths.dir())
        .with_context(|| format!("creating {}", paths.dir().display()))?;
    fs::create_dir_all(log_dir).with_context(|| format!("creating {}", log_dir.display()))?;

    let events = Arc::new(MemoryEventBus::new(EVENT_BACKLOG));
    let fanout = FanoutPublisher::new()
        .with(Arc::new(FileEventPublisher::new(log_dir.join("events.jsonl"))?))
        .with(events.clone());
    let telemetry = ServingTelemetry::builder("serving")
        .log_path(log_dir.join("serving.log.jsonl"))
        .event_publisher(Arc::new(fanout))
        .build()
        .context("building serving telemetry")?;

    let handle = Arc::new(ModelHandle::empty());
    let active = paths.active();
    if active.exists() {
        match handle.load_checkpoint(&active) {
            Ok(version) => tracing::info!(path = %active.display(), version, "active model loaded"),
            Err(err) => {
                tracing::error!(path = %active.display(), error = %err, "failed to load active model");
            }
        }
    } else {
        tracing::warn!(path = %active.display(), "no active model, predictions unavailable until one is trained");
    }

    let predictions = RecordLog::open(log_dir.join("predictions.jsonl"))
        .context("opening prediction log")?;
    let inference = Arc::new(InferenceService::new(
        handle,
        Some(predictions),
        telemetry.clone(),
    ));
    let retrain = Arc::new(RetrainOrchestrator::new(
        DatasetAccumulator::new(config.paths.retrain_dir()),
        pipeline(config),
        paths.clone(),
        Arc::clone(&inference),
        telemetry,
    ));

    let state = AppState::new(
        inference,
        gatekeeper(&config.gatekeeper),
        retrain,
        paths,
        config.paths.train_dir(),
        config.paths.test_dir(),
    );
    Ok(Services { state, events })
}

fn gatekeeper(config: &GatekeeperConfig) -> Gatekeeper {
    if !config.enabled {
        tracing::info!("gatekeeper disabled by configuration");
        return Gatekeeper::disabled();
    }
    let path = &config.detector_path;
    if !path.exists() {
        tracing::warn!(path = %path.display(), "detector vocabulary missing, gatekeeper skipped");
        return Gatekeeper::disabled();
    }
    match PrototypeDetector::load(path) {
        Ok(detector) => {
            tracing::info!(path = %path.display(), labels = detector.len(), "gatekeeper detector loaded");
            Gatekeeper::new(Arc::new(detector), config.policy())
        }
        Err(err) => {
            tracing::error!(path = %path.display(), error = %err, "failed to load detector, gatekeeper skipped");
            Gatekeeper::disabled()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pawgate_learning::Preprocessor;
    use std::path::Path;
    use tempfile::tempdir;

    fn config(root: &Path, extra: &str) -> PawgateConfig {
        PawgateConfig::from_toml(&format!("[preprocessing]\nimage_size = 16\n{extra}"), root)
            .unwrap()
    }

    #[test]
    fn starts_without_model_or_detector() {
        let dir = tempdir().unwrap();
        let state = build_state(&config(dir.path(), "")).unwrap();
        assert!(!state.status().model_loaded);
        assert!(!state.gatekeeper.is_enabled());
        assert!(dir.path().join("models").is_dir());
        assert!(dir.path().join("logs").is_dir());
        assert_eq!(state.train_dir, dir.path().join("data/train"));
    }

    #[test]
    fn loads_active_model_and_detector() {
        let dir = tempdir().unwrap();
        let config = config(dir.path(), "");
        let paths = model_paths(&config);
        fs::create_dir_all(paths.dir()).unwrap();
        pipeline(&config).fresh_model().save(paths.active()).unwrap();

        let mut detector = PrototypeDetector::new(Preprocessor::square(16), 1.0);
        detector.add_label(
            "tabby",
            &[image::RgbImage::from_pixel(8, 8, image::Rgb([120, 90, 60]))],
        );
        detector.save(&config.gatekeeper.detector_path).unwrap();

        let state = build_state(&config).unwrap();
        assert!(state.status().model_loaded);
        assert_eq!(state.status().model_version, 1);
        assert!(state.gatekeeper.is_enabled());
    }

    #[test]
    fn lifecycle_events_reach_memory_and_file() {
        let dir = tempdir().unwrap();
        let services = build(&config(dir.path(), "")).unwrap();
        let outcome = services.state.retrain.run_blocking().unwrap();
        assert!(!outcome.is_success());
        assert_eq!(services.events.of_type("retrain.started").len(), 1);
        assert_eq!(services.events.of_type("retrain.failed").len(), 1);
        let written = fs::read_to_string(dir.path().join("logs/events.jsonl")).unwrap();
        assert_eq!(written.lines().count(), 2);
        assert!(dir.path().join("logs/serving.log.jsonl").is_file());
    }

    #[test]
    fn disabled_gate_ignores_detector_file() {
        let dir = tempdir().unwrap();
        let state = build_state(&config(dir.path(), "[gatekeeper]\nenabled = false\n")).unwrap();
        assert!(!state.gatekeeper.is_enabled());
    }
}
