use std::path::{Path, PathBuf};
use std::time::Duration;
use turnstile_core::liveness::{DEFAULT_CONFIDENCE_DIVISOR, DEFAULT_MODEL_TIMEOUT};
use turnstile_core::matcher::DEFAULT_TOLERANCE;

/// Runtime configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory holding the detector and recognizer models (default: ./resources).
    pub model_dir: PathBuf,
    /// Anti-spoof model directory; `None` means `<model_dir>/anti_spoof_models`.
    pub spoof_model_dir: Option<PathBuf>,
    /// Explicit ensemble file names. `None` lists the directory once at startup.
    pub spoof_models: Option<Vec<String>>,
    pub db_path: PathBuf,
    /// Maximum Euclidean distance for a positive match.
    pub match_tolerance: f32,
    pub confidence_divisor: f32,
    /// Per-model inference budget when members run concurrently.
    pub model_timeout: Duration,
    pub parallel_models: bool,
    /// Reject frames that are not exactly 3:4.
    pub check_image: bool,
    /// Resize frame width to 3:4 before the aspect check.
    pub conform_aspect: bool,
}

impl Config {
    /// Load configuration from `TURNSTILE_*` environment variables with defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Self {
        let data_dir = var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                let home = var("HOME").unwrap_or_else(|| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("turnstile");

        let spoof_models = var("TURNSTILE_SPOOF_MODELS").map(|list| {
            list.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect()
        });

        Self {
            model_dir: var("TURNSTILE_MODEL_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./resources")),
            spoof_model_dir: var("TURNSTILE_SPOOF_MODEL_DIR").map(PathBuf::from),
            spoof_models,
            db_path: var("TURNSTILE_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| data_dir.join("access.db")),
            match_tolerance: parsed(&var, "TURNSTILE_MATCH_TOLERANCE", DEFAULT_TOLERANCE),
            confidence_divisor: parsed(
                &var,
                "TURNSTILE_CONFIDENCE_DIVISOR",
                DEFAULT_CONFIDENCE_DIVISOR,
            ),
            model_timeout: Duration::from_millis(parsed(
                &var,
                "TURNSTILE_MODEL_TIMEOUT_MS",
                DEFAULT_MODEL_TIMEOUT.as_millis() as u64,
            )),
            parallel_models: flag(&var, "TURNSTILE_PARALLEL_MODELS", false),
            check_image: flag(&var, "TURNSTILE_CHECK_IMAGE", true),
            conform_aspect: flag(&var, "TURNSTILE_CONFORM_ASPECT", true),
        }
    }

    /// Apply command-line overrides on top of the environment.
    pub fn with_overrides(mut self, model_dir: Option<PathBuf>, db_path: Option<PathBuf>) -> Self {
        if let Some(dir) = model_dir {
            self.model_dir = dir;
        }
        if let Some(db) = db_path {
            self.db_path = db;
        }
        self
    }

    pub fn spoof_model_dir(&self) -> PathBuf {
        self.spoof_model_dir
            .clone()
            .unwrap_or_else(|| self.model_dir.join("anti_spoof_models"))
    }

    /// Path to the SCRFD detection model.
    pub fn detector_model_path(&self) -> PathBuf {
        self.model_dir.join("det_10g.onnx")
    }

    /// Path to the ArcFace recognition model.
    pub fn recognizer_model_path(&self) -> PathBuf {
        self.model_dir.join("w600k_r50.onnx")
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }
}

fn parsed<T: std::str::FromStr>(var: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T {
    match var(key) {
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            tracing::warn!(key, value = %raw, "ignoring unparsable setting");
            default
        }),
        None => default,
    }
}

fn flag(var: &impl Fn(&str) -> Option<String>, key: &str, default: bool) -> bool {
    var(key).map(|v| v.trim() != "0").unwrap_or(default)
}
