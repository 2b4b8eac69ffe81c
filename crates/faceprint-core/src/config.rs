use std::path::PathBuf;

use crate::models::ModelFile;

/// Default Euclidean distance below which two descriptors are the same person.
pub const DEFAULT_DISTANCE_THRESHOLD: f32 = 0.6;

/// Runtime configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory containing the ONNX weight files.
    pub model_dir: PathBuf,
    /// Euclidean distance threshold for a positive match.
    pub distance_threshold: f32,
    /// ONNX Runtime intra-op threads per session.
    pub intra_threads: usize,
    /// Timeout in seconds for fetching `http(s)://` image sources.
    pub http_timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            model_dir: crate::default_model_dir(),
            distance_threshold: DEFAULT_DISTANCE_THRESHOLD,
            intra_threads: 2,
            http_timeout_secs: 30,
        }
    }
}

impl Config {
    /// Load configuration from `FACEPRINT_*` environment variables with defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let model_dir = std::env::var("FACEPRINT_MODEL_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.model_dir);

        Self {
            model_dir,
            distance_threshold: env_f32("FACEPRINT_DISTANCE_THRESHOLD", defaults.distance_threshold),
            intra_threads: env_usize("FACEPRINT_INTRA_THREADS", defaults.intra_threads),
            http_timeout_secs: env_u64("FACEPRINT_HTTP_TIMEOUT_SECS", defaults.http_timeout_secs),
        }
    }

    /// Same as `self` but reading weights from `dir`.
    pub fn with_model_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.model_dir = dir.into();
        self
    }

    /// Full path of one weight file.
    pub fn model_path(&self, file: ModelFile) -> PathBuf {
        self.model_dir.join(file.file_name())
    }
}

fn env_f32(key: &str, default: f32) -> f32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_parse_falls_back_on_garbage() {
        std::env::set_var("FACEPRINT_TEST_GARBAGE_F32", "not-a-number");
        assert_eq!(env_f32("FACEPRINT_TEST_GARBAGE_F32", 0.6), 0.6);
        std::env::set_var("FACEPRINT_TEST_VALID_USIZE", "8");
        assert_eq!(env_usize("FACEPRINT_TEST_VALID_USIZE", 2), 8);
        assert_eq!(env_u64("FACEPRINT_TEST_UNSET_U64", 30), 30);
    }

    #[test]
    fn test_model_path() {
        let config = Config::default().with_model_dir("/opt/weights");
        assert_eq!(
            config.model_path(ModelFile::FaceRecognition),
            PathBuf::from("/opt/weights/face_recognition.onnx")
        );
    }
}
