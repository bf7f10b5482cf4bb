use facereg_core::recognizer::DEFAULT_CONFIDENCE_THRESHOLD;
use facereg_core::{DetectorParams, ExtensionFilter, MultiFacePolicy};
use std::path::PathBuf;

/// CLI configuration, loaded from environment variables.
pub struct Config {
    /// Directory of `<name>.<id>.<sequence>.<ext>` training images.
    pub corpus_dir: PathBuf,
    /// Trained LBPH model file.
    pub model_path: PathBuf,
    /// OpenCV Haar cascade file.
    pub cascade_path: PathBuf,
    /// LBPH distance below which a prediction is accepted.
    pub threshold: f64,
    pub scale_factor: f64,
    pub min_neighbors: u32,
    /// Image extensions considered part of the corpus.
    pub extensions: ExtensionFilter,
    pub multi_face: MultiFacePolicy,
}

impl Config {
    /// Load configuration from `FACEREG_*` environment variables with defaults.
    pub fn from_env() -> Self {
        let data_dir = std::env::var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("facereg");

        let defaults = DetectorParams::default();

        Self {
            corpus_dir: env_path("FACEREG_CORPUS_DIR", data_dir.join("faces")),
            model_path: env_path("FACEREG_MODEL_PATH", data_dir.join("trainer.json")),
            cascade_path: env_path(
                "FACEREG_CASCADE_PATH",
                data_dir.join("haarcascade_frontalface_default.xml"),
            ),
            threshold: env_f64("FACEREG_THRESHOLD", DEFAULT_CONFIDENCE_THRESHOLD),
            scale_factor: env_f64("FACEREG_SCALE_FACTOR", defaults.scale_factor),
            min_neighbors: env_u32("FACEREG_MIN_NEIGHBORS", defaults.min_neighbors),
            extensions: std::env::var("FACEREG_EXTENSIONS")
                .map(|v| ExtensionFilter::parse(&v))
                .unwrap_or_default(),
            multi_face: std::env::var("FACEREG_MULTI_FACE")
                .ok()
                .and_then(|v| match v.parse() {
                    Ok(policy) => Some(policy),
                    Err(e) => {
                        tracing::warn!(error = %e, "ignoring FACEREG_MULTI_FACE");
                        None
                    }
                })
                .unwrap_or_default(),
        }
    }

    pub fn detector_params(&self) -> DetectorParams {
        DetectorParams {
            scale_factor: self.scale_factor,
            min_neighbors: self.min_neighbors,
            ..DetectorParams::default()
        }
    }
}

fn env_path(key: &str, default: PathBuf) -> PathBuf {
    std::env::var(key).map(PathBuf::from).unwrap_or(default)
}

fn env_f64(key: &str, default: f64) -> f64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u32(key: &str, default: u32) -> u32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
