use std::{
    fs,
    path::{Path, PathBuf},
};

use pawgate_learning::{preprocess::DEFAULT_IMAGE_SIZE, Preprocessor, TrainingConfig};
use pawgate_serving::GatekeeperPolicy;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration file looked up in the working directory when none is given.
pub const DEFAULT_CONFIG_FILE: &str = "pawgate.toml";

/// Configuration loading failures.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("reading {path}: {source}")]
    Read {
        /// Offending file.
        path: PathBuf,
        /// Underlying failure.
        source: std::io::Error,
    },
    /// The file is not valid TOML for this schema.
    #[error("parsing {path}: {source}")]
    Parse {
        /// Offending file.
        path: PathBuf,
        /// Underlying failure.
        source: toml::de::Error,
    },
    /// A value is out of range.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Complete service configuration. Every section is optional.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PawgateConfig {
    /// HTTP listener.
    #[serde(default)]
    pub server: ServerConfig,
    /// Storage locations.
    #[serde(default)]
    pub paths: PathsConfig,
    /// Detector gate.
    #[serde(default)]
    pub gatekeeper: GatekeeperConfig,
    /// Training hyperparameters shared by `train` and background retraining.
    #[serde(default)]
    pub training: TrainingConfig,
    /// Input geometry.
    #[serde(default)]
    pub preprocessing: PreprocessingConfig,
}

/// `[server]`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServerConfig {
    /// Listen address.
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    /// Prefix of every API route except `/health`.
    #[serde(default = "default_api_prefix")]
    pub api_prefix: String,
    /// Permissive CORS.
    #[serde(default = "default_true")]
    pub enable_cors: bool,
    /// Per-request tracing spans.
    #[serde(default = "default_true")]
    pub enable_tracing: bool,
    /// Request body cap for uploads.
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            api_prefix: default_api_prefix(),
            enable_cors: true,
            enable_tracing: true,
            max_upload_bytes: default_max_upload_bytes(),
        }
    }
}

/// `[paths]`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PathsConfig {
    /// Active/candidate checkpoints, model config and metrics.
    #[serde(default = "default_model_dir")]
    pub model_dir: PathBuf,
    /// Holds `train/`, `test/` and `retrain/`.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Prediction log, JSONL telemetry and events.
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            model_dir: default_model_dir(),
            data_dir: default_data_dir(),
            log_dir: default_log_dir(),
        }
    }
}

impl PathsConfig {
    /// Initial training corpus.
    #[must_use]
    pub fn train_dir(&self) -> PathBuf {
        self.data_dir.join("train")
    }

    /// Held-out test corpus.
    #[must_use]
    pub fn test_dir(&self) -> PathBuf {
        self.data_dir.join("test")
    }

    /// Accumulated uploads.
    #[must_use]
    pub fn retrain_dir(&self) -> PathBuf {
        self.data_dir.join("retrain")
    }
}

/// `[gatekeeper]`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GatekeeperConfig {
    /// Runs the gate when a detector file is present.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Prototype vocabulary written by `pawgate build-detector`.
    #[serde(default = "default_detector_path")]
    pub detector_path: PathBuf,
    /// Detections inspected for a cat/dog label.
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    /// Confidence above which a non-cat/dog image is rejected.
    #[serde(default = "default_reject_threshold")]
    pub reject_threshold: f32,
    /// Rejects low-confidence non-matches instead of passing them through.
    #[serde(default)]
    pub reject_ambiguous: bool,
}

impl Default for GatekeeperConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            detector_path: default_detector_path(),
            top_k: default_top_k(),
            reject_threshold: default_reject_threshold(),
            reject_ambiguous: false,
        }
    }
}

impl GatekeeperConfig {
    /// Gate policy derived from this section.
    #[must_use]
    pub const fn policy(&self) -> GatekeeperPolicy {
        GatekeeperPolicy {
            top_k: self.top_k,
            reject_threshold: self.reject_threshold,
            reject_ambiguous: self.reject_ambiguous,
        }
    }
}

/// `[preprocessing]`
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct PreprocessingConfig {
    /// Side of the square model input.
    #[serde(default = "default_image_size")]
    pub image_size: u32,
}

impl Default for PreprocessingConfig {
    fn default() -> Self {
        Self {
            image_size: default_image_size(),
        }
    }
}

impl PreprocessingConfig {
    /// Preprocessor for this geometry.
    #[must_use]
    pub const fn preprocessor(self) -> Preprocessor {
        Preprocessor::square(self.image_size)
    }
}

impl PawgateConfig {
    /// Loads and validates a TOML file. Relative paths resolve against the
    /// file's directory.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let base = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        Self::from_toml(&raw, &base).map_err(|err| match err {
            ConfigError::Parse { source, .. } => ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            },
            other => other,
        })
    }

    /// Parses a TOML document, resolving relative paths against `base`.
    pub fn from_toml(raw: &str, base: &Path) -> Result<Self, ConfigError> {
        let mut config: Self = toml::from_str(raw).map_err(|source| ConfigError::Parse {
            path: base.to_path_buf(),
            source,
        })?;
        config.resolve_paths(base);
        config.validate()?;
        Ok(config)
    }

    /// `path` when given, else `pawgate.toml` in the working directory when it
    /// exists, else defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => Self::load(path),
            None if Path::new(DEFAULT_CONFIG_FILE).exists() => Self::load(DEFAULT_CONFIG_FILE),
            None => {
                let config = Self::default();
                config.validate()?;
                Ok(config)
            }
        }
    }

    fn resolve_paths(&mut self, base: &Path) {
        for path in [
            &mut self.paths.model_dir,
            &mut self.paths.data_dir,
            &mut self.paths.log_dir,
            &mut self.gatekeeper.detector_path,
        ] {
            if path.is_relative() {
                *path = base.join(&*path);
            }
        }
    }

    /// Range checks across every section.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.training
            .validate()
            .map_err(|err| ConfigError::Invalid(err.to_string()))?;
        if self.gatekeeper.top_k == 0 {
            return Err(ConfigError::Invalid("gatekeeper.top_k must be at least 1".into()));
        }
        if !(0.0..=1.0).contains(&self.gatekeeper.reject_threshold) {
            return Err(ConfigError::Invalid(
                "gatekeeper.reject_threshold must lie in [0, 1]".into(),
            ));
        }
        if self.preprocessing.image_size == 0 {
            return Err(ConfigError::Invalid(
                "preprocessing.image_size must be positive".into(),
            ));
        }
        if !self.server.api_prefix.starts_with('/') {
            return Err(ConfigError::Invalid(
                "server.api_prefix must start with '/'".into(),
            ));
        }
        Ok(())
    }
}

fn default_bind_address() -> String {
    "0.0.0.0:8000".into()
}

fn default_api_prefix() -> String {
    "/api".into()
}

const fn default_true() -> bool {
    true
}

const fn default_max_upload_bytes() -> usize {
    32 * 1024 * 1024
}

fn default_model_dir() -> PathBuf {
    PathBuf::from("models")
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_detector_path() -> PathBuf {
    PathBuf::from("models/detector.json")
}

const fn default_top_k() -> usize {
    5
}

const fn default_reject_threshold() -> f32 {
    0.3
}

const fn default_image_size() -> u32 {
    DEFAULT_IMAGE_SIZE
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn empty_document_yields_defaults() {
        let config = PawgateConfig::from_toml("", Path::new("/srv/pawgate")).unwrap();
        assert_eq!(config.server.api_prefix, "/api");
        assert_eq!(config.server.bind_address, "0.0.0.0:8000");
        assert_eq!(config.gatekeeper.policy(), GatekeeperPolicy::default());
        assert_eq!(config.training, TrainingConfig::default());
        assert_eq!(config.paths.model_dir, PathBuf::from("/srv/pawgate/models"));
        assert_eq!(
            config.paths.retrain_dir(),
            PathBuf::from("/srv/pawgate/data/retrain")
        );
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let raw = r#"
            [server]
            api_prefix = "/v2"

            [paths]
            model_dir = "/var/lib/pawgate"

            [gatekeeper]
            reject_ambiguous = true

            [training]
            epochs = 3
        "#;
        let config = PawgateConfig::from_toml(raw, Path::new("conf")).unwrap();
        assert_eq!(config.server.api_prefix, "/v2");
        assert!(config.server.enable_cors);
        assert_eq!(config.paths.model_dir, PathBuf::from("/var/lib/pawgate"));
        assert_eq!(config.paths.log_dir, PathBuf::from("conf/logs"));
        assert!(config.gatekeeper.reject_ambiguous);
        assert_eq!(config.gatekeeper.top_k, 5);
        assert_eq!(config.training.epochs, 3);
        assert_eq!(config.training.batch_size, TrainingConfig::default().batch_size);
    }

    #[test]
    fn out_of_range_values_are_rejected() {
        for raw in [
            "[training]\nvalidation_split = 1.0",
            "[gatekeeper]\ntop_k = 0",
            "[gatekeeper]\nreject_threshold = 1.5",
            "[server]\napi_prefix = \"api\"",
        ] {
            assert!(
                matches!(
                    PawgateConfig::from_toml(raw, Path::new(".")),
                    Err(ConfigError::Invalid(_))
                ),
                "{raw}"
            );
        }
    }

    #[test]
    fn load_reports_the_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pawgate.toml");
        std::fs::write(&path, "[server\n").unwrap();
        match PawgateConfig::load(&path) {
            Err(ConfigError::Parse { path: reported, .. }) => assert_eq!(reported, path),
            other => panic!("expected parse error, got {other:?}"),
        }
        assert!(matches!(
            PawgateConfig::load(dir.path().join("missing.toml")),
            Err(ConfigError::Read { .. })
        ));

        std::fs::write(&path, "[preprocessing]\nimage_size = 64\n").unwrap();
        let config = PawgateConfig::load(&path).unwrap();
        assert_eq!(config.preprocessing.preprocessor(), Preprocessor::square(64));
        assert_eq!(config.paths.data_dir, dir.path().join("data"));
    }
}
