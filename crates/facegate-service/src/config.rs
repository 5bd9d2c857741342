use facegate_core::locator::LocatorConfig;
use facegate_core::policy::PolicyError;
use facegate_core::quality::WeightsError;
use facegate_core::{AssuranceLevel, DetectorSet, Policy, QualityWeights};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config file: {0}")]
    Toml(#[from] toml::de::Error),
    #[error(transparent)]
    Policy(#[from] PolicyError),
    #[error(transparent)]
    Weights(#[from] WeightsError),
    #[error("{0}")]
    Invalid(String),
}

/// Service configuration, loaded from environment variables or a TOML file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Path to the SQLite database file (`:memory:` for an ephemeral store).
    pub db_path: PathBuf,
    /// Directory containing the detector model files.
    pub model_dir: PathBuf,
    pub assurance: AssuranceLevel,
    /// Overrides the detector set of the assurance level.
    pub detectors: Option<DetectorSet>,
    /// Pipeline worker threads.
    pub workers: usize,
    /// Requests that may wait for a worker before callers get `EngineBusy`.
    pub queue_capacity: usize,
    /// Upper bound on a single verify or enroll call.
    pub call_timeout_secs: u64,
    /// Apply CLAHE to the detection copy of each capture.
    pub enhance_contrast: bool,
    pub default_threshold: Option<f32>,
    pub enroll_quality_floor: Option<f32>,
    pub verify_quality_floor: Option<f32>,
    pub liveness_floor: Option<f32>,
    pub quality_weights: QualityWeights,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: default_data_dir().join("profiles.db"),
            model_dir: default_model_dir(),
            assurance: AssuranceLevel::Standard,
            detectors: None,
            workers: default_workers(),
            queue_capacity: 32,
            call_timeout_secs: 10,
            enhance_contrast: true,
            default_threshold: None,
            enroll_quality_floor: None,
            verify_quality_floor: None,
            liveness_floor: None,
            quality_weights: QualityWeights::default(),
        }
    }
}

impl Config {
    /// Load configuration from `FACEGATE_*` environment variables with defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            db_path: std::env::var("FACEGATE_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.db_path),
            model_dir: std::env::var("FACEGATE_MODEL_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.model_dir),
            assurance: env_parse("FACEGATE_ASSURANCE").unwrap_or(defaults.assurance),
            detectors: env_parse("FACEGATE_DETECTORS"),
            workers: env_usize("FACEGATE_WORKERS", defaults.workers),
            queue_capacity: env_usize("FACEGATE_QUEUE_CAPACITY", defaults.queue_capacity),
            call_timeout_secs: env_u64("FACEGATE_CALL_TIMEOUT_SECS", defaults.call_timeout_secs),
            enhance_contrast: std::env::var("FACEGATE_ENHANCE_CONTRAST")
                .map(|v| v != "0")
                .unwrap_or(defaults.enhance_contrast),
            default_threshold: env_opt_f32("FACEGATE_DEFAULT_THRESHOLD"),
            enroll_quality_floor: env_opt_f32("FACEGATE_ENROLL_QUALITY_FLOOR"),
            verify_quality_floor: env_opt_f32("FACEGATE_VERIFY_QUALITY_FLOOR"),
            liveness_floor: env_opt_f32("FACEGATE_LIVENESS_FLOOR"),
            quality_weights: defaults.quality_weights,
        }
    }

    /// Load configuration from a TOML file. Missing keys take their defaults.
    pub fn from_toml_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Ok(toml::from_str(&text)?)
    }

    /// The assurance policy with every configured override applied.
    pub fn policy(&self) -> Policy {
        let mut policy = Policy::for_level(self.assurance);
        if let Some(detectors) = self.detectors {
            policy.detectors = detectors;
        }
        if let Some(t) = self.default_threshold {
            policy.default_threshold = t;
        }
        if let Some(f) = self.enroll_quality_floor {
            policy.enroll_quality_floor = f;
        }
        if let Some(f) = self.verify_quality_floor {
            policy.verify_quality_floor = f;
        }
        if let Some(f) = self.liveness_floor {
            policy.liveness_floor = f;
        }
        policy
    }

    pub fn locator(&self) -> LocatorConfig {
        LocatorConfig {
            enhance_contrast: self.enhance_contrast,
            ..LocatorConfig::default()
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.policy().validate()?;
        self.quality_weights.validate()?;
        if self.workers == 0 {
            return Err(ConfigError::Invalid("workers must be at least 1".into()));
        }
        if self.queue_capacity == 0 {
            return Err(ConfigError::Invalid("queue_capacity must be at least 1".into()));
        }
        if self.call_timeout_secs == 0 {
            return Err(ConfigError::Invalid("call_timeout_secs must be at least 1".into()));
        }
        Ok(())
    }
}

/// `$XDG_DATA_HOME/facegate`, falling back to `~/.local/share/facegate`.
pub fn default_data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("facegate")
}

pub fn default_model_dir() -> PathBuf {
    default_data_dir().join("models")
}

fn default_workers() -> usize {
    std::thread::available_parallelism().map(|n| n.get()).unwrap_or(2)
}

fn env_opt_f32(key: &str) -> Option<f32> {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<f32>().ok())
        .filter(|v| v.is_finite())
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_parse<T>(key: &str) -> Option<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let raw = std::env::var(key).ok()?;
    match raw.parse() {
        Ok(v) => Some(v),
        Err(err) => {
            tracing::warn!(key, value = %raw, error = %err, "ignoring invalid setting");
            None
        }
    }
}
