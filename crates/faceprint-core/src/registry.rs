//! Process-wide model registry.
//!
//! All networks are loaded once, up front, and never change afterwards.

use crate::attributes::{AgeGenderNet, ExpressionNet};
use crate::config::Config;
use crate::describe::FaceAnalyzer;
use crate::detector::{Mtcnn, SsdMobilenet, TinyFaceDetector};
use crate::landmarks::LandmarkNet;
use crate::models::{ModelError, ModelFile};
use crate::options::DetectorOptions;
use crate::recognizer::FaceRecognizer;
use crate::types::{AgeGender, Descriptor, Detection, FaceExpressions, FaceLandmarks, LandmarkModel, Point};
use image::RgbImage;
use std::sync::{Arc, OnceLock};
use std::time::Instant;

static REGISTRY: OnceLock<Arc<ModelRegistry>> = OnceLock::new();

/// Every network the pipeline needs.
pub struct ModelRegistry {
    config: Config,
    ssd: SsdMobilenet,
    tiny: TinyFaceDetector,
    mtcnn: Mtcnn,
    landmarks: LandmarkNet,
    landmarks_tiny: LandmarkNet,
    age_gender: AgeGenderNet,
    expressions: ExpressionNet,
    recognizer: FaceRecognizer,
}

impl ModelRegistry {
    /// Load every weight file from `config.model_dir`. Fails on the first
    /// missing or malformed file.
    pub fn load(config: &Config) -> Result<Self, ModelError> {
        let started = Instant::now();
        let registry = Self {
            config: config.clone(),
            ssd: SsdMobilenet::load(config)?,
            tiny: TinyFaceDetector::load(config)?,
            mtcnn: Mtcnn::load(config)?,
            landmarks: LandmarkNet::load(LandmarkModel::Full, config)?,
            landmarks_tiny: LandmarkNet::load(LandmarkModel::Tiny, config)?,
            age_gender: AgeGenderNet::load(config)?,
            expressions: ExpressionNet::load(config)?,
            recognizer: FaceRecognizer::load(config)?,
        };

        tracing::info!(
            model_dir = %config.model_dir.display(),
            models = ModelFile::ALL.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "model registry ready"
        );
        Ok(registry)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }
}

impl FaceAnalyzer for ModelRegistry {
    fn detect_faces(&self, image: &RgbImage, options: &DetectorOptions) -> Result<Vec<Detection>, ModelError> {
        match options {
            DetectorOptions::Ssd(o) => self.ssd.detect(image, o),
            DetectorOptions::Tiny(o) => self.tiny.detect(image, o),
            DetectorOptions::Mtcnn(o) => self.mtcnn.detect(image, o),
        }
    }

    fn detect_landmarks(
        &self,
        face: &RgbImage,
        origin: Point,
        model: LandmarkModel,
    ) -> Result<FaceLandmarks, ModelError> {
        match model {
            LandmarkModel::Full => self.landmarks.detect(face, origin),
            LandmarkModel::Tiny => self.landmarks_tiny.detect(face, origin),
        }
    }

    fn estimate_age_gender(&self, aligned_face: &RgbImage) -> Result<AgeGender, ModelError> {
        self.age_gender.estimate(aligned_face)
    }

    fn recognize_expressions(&self, aligned_face: &RgbImage) -> Result<FaceExpressions, ModelError> {
        self.expressions.recognize(aligned_face)
    }

    fn compute_descriptor(&self, aligned_face: &RgbImage) -> Result<Descriptor, ModelError> {
        self.recognizer.describe(aligned_face)
    }
}

/// Weight files absent from `config.model_dir`.
pub fn missing_models(config: &Config) -> Vec<ModelFile> {
    ModelFile::ALL
        .into_iter()
        .filter(|file| !config.model_path(*file).exists())
        .collect()
}

/// Load the registry and install it process-wide. Later calls return the
/// registry installed first and ignore their `config`.
pub fn init(config: &Config) -> Result<Arc<ModelRegistry>, ModelError> {
    if let Some(registry) = REGISTRY.get() {
        return Ok(Arc::clone(registry));
    }
    let loaded = Arc::new(ModelRegistry::load(config)?);
    Ok(Arc::clone(REGISTRY.get_or_init(|| loaded)))
}

/// The registry installed by [`init`], if any.
pub fn global() -> Option<Arc<ModelRegistry>> {
    REGISTRY.get().cloned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn missing_dir() -> Config {
        Config::default().with_model_dir("/nonexistent/faceprint-registry-test")
    }

    #[test]
    fn test_missing_models_lists_everything() {
        assert_eq!(missing_models(&missing_dir()), ModelFile::ALL.to_vec());
    }

    #[test]
    fn test_load_fails_fast_on_first_missing_file() {
        match ModelRegistry::load(&missing_dir()) {
            Err(ModelError::ModelNotFound(path)) => assert!(path.ends_with("ssd_mobilenetv1.onnx"), "{path}"),
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("registry must not load without weights"),
        }
    }

    #[test]
    fn test_failed_init_installs_nothing() {
        assert!(init(&missing_dir()).is_err());
        assert!(global().is_none());
    }

    #[tokio::test]
    #[ignore] // Run manually: FACEPRINT_MODEL_DIR=... FACEPRINT_TEST_IMAGE=face.jpg cargo test -p faceprint-core real_weights -- --ignored --nocapture
    async fn test_real_weights_every_detector() {
        use crate::describe::{DescribeRequest, FaceApi};
        use crate::options::DetectorKind;

        let config = Config::from_env();
        let missing = missing_models(&config);
        if !missing.is_empty() {
            println!("weights missing from {}: {missing:?}, skipping", config.model_dir.display());
            return;
        }
        let Ok(image) = std::env::var("FACEPRINT_TEST_IMAGE") else {
            println!("FACEPRINT_TEST_IMAGE not set, skipping");
            return;
        };

        let registry = Arc::new(ModelRegistry::load(&config).expect("load registry"));
        let api = FaceApi::from_registry(registry).expect("build api");

        for kind in DetectorKind::ALL {
            let request = DescribeRequest::new(image.as_str()).single(true).model(kind);
            let first = api.compute_descriptor(request.clone()).await.expect("describe").into_vec();
            let second = api.compute_descriptor(request).await.expect("describe").into_vec();

            assert_eq!(first[0].descriptor.len(), crate::recognizer::DESCRIPTOR_DIM);
            assert_eq!(first[0].descriptor, second[0].descriptor, "{kind} is not deterministic");
            assert!((first[0].expressions.total() - 1.0).abs() < 1e-3);
            println!("{kind}: score {:.3}, age {:.1}", first[0].detection.score, first[0].age);
        }
    }
}
