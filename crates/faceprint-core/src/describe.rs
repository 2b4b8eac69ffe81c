//! Face description pipeline: detect, locate landmarks, align, then run the
//! attribute and recognition networks on every face.

use crate::alignment::align_face;
use crate::image_source::{decode_image, DecodeError, ImageLoader, ImageSource};
use crate::matcher::{FaceMatch, FaceMatcher, LabeledDescriptors, MatchError};
use crate::models::ModelError;
use crate::options::{DetectorKind, DetectorOptions, DetectorOverrides, OptionsError};
use crate::preprocess::crop;
use crate::registry::{self, ModelRegistry};
use crate::types::{
    AgeGender, Descriptor, Detection, FaceExpressions, FaceLandmarks, FaceResult, LandmarkModel,
    OneOrMany, Point,
};
use image::RgbImage;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Side of the aligned crop fed to the recognition network; the attribute
/// networks receive it resized.
const ALIGNED_FACE_SIZE: u32 = 150;

#[derive(Error, Debug)]
pub enum DescribeError {
    #[error("invalid detector options: {0}")]
    Options(#[from] OptionsError),
    #[error("failed to load image: {0}")]
    Decode(#[from] DecodeError),
    #[error("model error: {0}")]
    Model(#[from] ModelError),
    #[error("{}", no_face_message(.alternatives))]
    NoFaceFound {
        model: DetectorKind,
        /// Backends worth trying instead, judged against what the caller asked for.
        alternatives: Vec<DetectorKind>,
    },
    #[error("models are not loaded; call faceprint_core::init first")]
    NotInitialized,
    #[error("inference task failed: {0}")]
    TaskFailed(String),
}

fn no_face_message(alternatives: &[DetectorKind]) -> String {
    let others: Vec<&str> = alternatives.iter().map(|k| k.as_str()).collect();
    format!(
        "Unable to find any face in the picture. Try changing 'model' to either \"{}\" or use a different image.",
        others.join("\" or \"")
    )
}

/// The inference stages behind [`FaceApi`].
///
/// [`ModelRegistry`] is the real implementation; anything else (a remote
/// backend, a test double) can stand in.
pub trait FaceAnalyzer: Send + Sync + 'static {
    /// Faces sorted by descending score, in source-image pixels.
    fn detect_faces(&self, image: &RgbImage, options: &DetectorOptions) -> Result<Vec<Detection>, ModelError>;

    /// 68 landmarks for a face crop whose top-left corner is `origin`.
    fn detect_landmarks(
        &self,
        face: &RgbImage,
        origin: Point,
        model: LandmarkModel,
    ) -> Result<FaceLandmarks, ModelError>;

    fn estimate_age_gender(&self, aligned_face: &RgbImage) -> Result<AgeGender, ModelError>;

    fn recognize_expressions(&self, aligned_face: &RgbImage) -> Result<FaceExpressions, ModelError>;

    fn compute_descriptor(&self, aligned_face: &RgbImage) -> Result<Descriptor, ModelError>;
}

/// Parameters of one `compute_descriptor` call.
#[derive(Debug, Clone)]
pub struct DescribeRequest {
    pub source: ImageSource,
    /// Keep only the best-scoring face.
    pub single: bool,
    /// Use the tiny 68-point landmark network.
    pub tiny_landmarks: bool,
    pub model: DetectorKind,
    /// Free-form selector `model` was resolved from, when one was given.
    pub selector: Option<String>,
    pub model_options: Option<DetectorOverrides>,
}

impl DescribeRequest {
    pub fn new(source: impl Into<ImageSource>) -> Self {
        Self {
            source: source.into(),
            single: false,
            tiny_landmarks: false,
            model: DetectorKind::default(),
            selector: None,
            model_options: None,
        }
    }

    pub fn single(mut self, single: bool) -> Self {
        self.single = single;
        self
    }

    pub fn tiny_landmarks(mut self, tiny: bool) -> Self {
        self.tiny_landmarks = tiny;
        self
    }

    pub fn model(mut self, model: DetectorKind) -> Self {
        self.model = model;
        self.selector = None;
        self
    }

    /// Pick the detector by name; unknown names fall back to SSD.
    pub fn selector(mut self, selector: impl Into<String>) -> Self {
        let selector = selector.into();
        self.model = DetectorKind::from_selector(&selector);
        self.selector = Some(selector);
        self
    }

    fn alternatives(&self) -> Vec<DetectorKind> {
        match &self.selector {
            Some(selector) => DetectorKind::alternatives_to_selector(selector),
            None => self.model.alternatives(),
        }
    }

    pub fn model_options(mut self, overrides: DetectorOverrides) -> Self {
        self.model_options = Some(overrides);
        self
    }

    fn landmark_model(&self) -> LandmarkModel {
        if self.tiny_landmarks {
            LandmarkModel::Tiny
        } else {
            LandmarkModel::Full
        }
    }
}

/// Entry point for describing and matching faces.
pub struct FaceApi<A: FaceAnalyzer = ModelRegistry> {
    analyzer: Arc<A>,
    loader: ImageLoader,
    distance_threshold: f32,
}

impl FaceApi<ModelRegistry> {
    /// API over a loaded registry, configured from the registry's [`Config`](crate::Config).
    pub fn from_registry(registry: Arc<ModelRegistry>) -> Result<Self, DescribeError> {
        let config = registry.config();
        let loader = ImageLoader::new(Duration::from_secs(config.http_timeout_secs))?;
        let threshold = config.distance_threshold;
        Ok(Self::new(registry, loader).with_distance_threshold(threshold))
    }
}

impl<A: FaceAnalyzer> FaceApi<A> {
    pub fn new(analyzer: Arc<A>, loader: ImageLoader) -> Self {
        Self {
            analyzer,
            loader,
            distance_threshold: crate::config::DEFAULT_DISTANCE_THRESHOLD,
        }
    }

    pub fn with_distance_threshold(mut self, threshold: f32) -> Self {
        self.distance_threshold = threshold;
        self
    }

    /// Detect and fully describe the faces in `request.source`.
    ///
    /// Returns `One` in single mode and `Many` (best score first) otherwise.
    /// A picture without any face is an error.
    pub async fn compute_descriptor(&self, request: DescribeRequest) -> Result<OneOrMany<FaceResult>, DescribeError> {
        let options = DetectorOptions::build(request.model, request.model_options.as_ref())?;
        let landmark_model = request.landmark_model();
        let single = request.single;

        let started = Instant::now();
        let bytes = self.loader.fetch(&request.source).await?;
        tracing::debug!(
            source = %request.source.describe(),
            bytes = bytes.len(),
            model = %options.kind(),
            "image fetched"
        );

        let analyzer = Arc::clone(&self.analyzer);
        let faces = tokio::task::spawn_blocking(move || -> Result<Vec<FaceResult>, DescribeError> {
            let image = decode_image(&bytes)?;
            Ok(describe_faces(analyzer.as_ref(), &image, &options, single, landmark_model)?)
        })
        .await
        .map_err(|e| DescribeError::TaskFailed(e.to_string()))??;

        tracing::info!(
            faces = faces.len(),
            model = %request.model,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "faces described"
        );

        let mut faces = faces.into_iter();
        match (single, faces.next()) {
            (_, None) => Err(DescribeError::NoFaceFound {
                model: request.model,
                alternatives: request.alternatives(),
            }),
            (true, Some(best)) => Ok(OneOrMany::One(best)),
            (false, Some(first)) => Ok(OneOrMany::Many(std::iter::once(first).chain(faces).collect())),
        }
    }

    /// Match described faces against `gallery` with this API's distance threshold.
    pub fn match_face(
        &self,
        gallery: Vec<LabeledDescriptors>,
        query: Option<&OneOrMany<FaceResult>>,
    ) -> Result<Option<OneOrMany<FaceMatch>>, MatchError> {
        FaceMatcher::with_threshold(gallery, self.distance_threshold)?.match_faces(query)
    }

    pub fn label_faces(
        &self,
        label: impl Into<String>,
        descriptors: Vec<Descriptor>,
    ) -> Result<LabeledDescriptors, MatchError> {
        crate::matcher::label_faces(label, descriptors)
    }
}

/// Synchronous pipeline over a decoded image. Returns every described face
/// in detection order; in `single` mode at most one.
pub fn describe_faces<A: FaceAnalyzer + ?Sized>(
    analyzer: &A,
    image: &RgbImage,
    options: &DetectorOptions,
    single: bool,
    landmark_model: LandmarkModel,
) -> Result<Vec<FaceResult>, ModelError> {
    let mut detections = analyzer.detect_faces(image, options)?;
    tracing::debug!(
        detected = detections.len(),
        width = image.width(),
        height = image.height(),
        "detection done"
    );

    // Best score first, whatever order the analyzer used.
    detections.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    if single {
        detections.truncate(1);
    } else if let Some(cap) = options.max_results() {
        detections.truncate(cap);
    }

    let mut faces = Vec::with_capacity(detections.len());
    for detection in detections {
        let Some(face_crop) = crop(image, &detection.bbox) else {
            tracing::debug!(bbox = ?detection.bbox, "skipping face outside the image");
            continue;
        };
        let origin = Point::new(
            detection.bbox.x.max(0.0).floor(),
            detection.bbox.y.max(0.0).floor(),
        );
        let landmarks = analyzer.detect_landmarks(&face_crop, origin, landmark_model)?;

        let points = landmarks
            .alignment_points()
            .or_else(|| detection.landmarks.map(|pts| pts.map(|p| (p.x, p.y))))
            .ok_or_else(|| {
                ModelError::InferenceFailed(format!(
                    "landmark network returned {} points, expected {}",
                    landmarks.positions.len(),
                    FaceLandmarks::NUM_POINTS
                ))
            })?;
        let aligned = align_face(image, &points, ALIGNED_FACE_SIZE);

        let age_gender = analyzer.estimate_age_gender(&aligned)?;
        let expressions = analyzer.recognize_expressions(&aligned)?;
        let descriptor = analyzer.compute_descriptor(&aligned)?;

        faces.push(FaceResult {
            detection,
            landmarks,
            age: age_gender.age,
            gender: age_gender.gender,
            gender_probability: age_gender.gender_probability,
            expressions,
            descriptor,
        });
    }

    Ok(faces)
}

fn default_api() -> Result<&'static FaceApi<ModelRegistry>, DescribeError> {
    static API: OnceLock<FaceApi<ModelRegistry>> = OnceLock::new();
    if let Some(api) = API.get() {
        return Ok(api);
    }
    let registry = registry::global().ok_or(DescribeError::NotInitialized)?;
    let api = FaceApi::from_registry(registry)?;
    Ok(API.get_or_init(|| api))
}

/// [`FaceApi::compute_descriptor`] on the registry installed by [`init`](crate::init).
pub async fn compute_descriptor(request: DescribeRequest) -> Result<OneOrMany<FaceResult>, DescribeError> {
    default_api()?.compute_descriptor(request).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BoundingBox, Gender};
    use image::{ImageFormat, Rgb};
    use std::io::Cursor;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Stand-in analyzer: returns fixed detections and derives every other
    /// output from the pixels it is given.
    struct FakeAnalyzer {
        detections: Vec<Detection>,
        fail_expressions: bool,
        landmark_calls: AtomicUsize,
    }

    impl FakeAnalyzer {
        fn new(detections: Vec<Detection>) -> Self {
            Self {
                detections,
                fail_expressions: false,
                landmark_calls: AtomicUsize::new(0),
            }
        }
    }

    fn mean_red(image: &RgbImage) -> f32 {
        let sum: u64 = image.pixels().map(|p| p[0] as u64).sum();
        sum as f32 / (image.width() * image.height()).max(1) as f32
    }

    impl FaceAnalyzer for FakeAnalyzer {
        fn detect_faces(&self, _image: &RgbImage, _options: &DetectorOptions) -> Result<Vec<Detection>, ModelError> {
            Ok(self.detections.clone())
        }

        fn detect_landmarks(
            &self,
            face: &RgbImage,
            origin: Point,
            model: LandmarkModel,
        ) -> Result<FaceLandmarks, ModelError> {
            self.landmark_calls.fetch_add(1, Ordering::SeqCst);
            let (w, h) = (face.width() as f32, face.height() as f32);
            let at = |rx: f32, ry: f32| Point::new(origin.x + rx * w, origin.y + ry * h);
            let mut positions = vec![at(0.5, 0.5); FaceLandmarks::NUM_POINTS];
            for p in &mut positions[36..42] {
                *p = at(0.3, 0.4);
            }
            for p in &mut positions[42..48] {
                *p = at(0.7, 0.4);
            }
            positions[30] = at(0.5, 0.6);
            positions[48] = at(0.35, 0.8);
            positions[54] = at(0.65, 0.8);
            Ok(FaceLandmarks { positions, model })
        }

        fn estimate_age_gender(&self, aligned_face: &RgbImage) -> Result<AgeGender, ModelError> {
            Ok(AgeGender {
                age: mean_red(aligned_face) / 4.0,
                gender: Gender::Female,
                gender_probability: 0.8,
            })
        }

        fn recognize_expressions(&self, _aligned_face: &RgbImage) -> Result<FaceExpressions, ModelError> {
            if self.fail_expressions {
                return Err(ModelError::InferenceFailed("expression net exploded".into()));
            }
            Ok(FaceExpressions::from_probabilities([0.7, 0.1, 0.05, 0.05, 0.04, 0.03, 0.03]))
        }

        fn compute_descriptor(&self, aligned_face: &RgbImage) -> Result<Descriptor, ModelError> {
            assert_eq!(aligned_face.dimensions(), (ALIGNED_FACE_SIZE, ALIGNED_FACE_SIZE));
            Ok(Descriptor::new(vec![mean_red(aligned_face) / 255.0; 128]))
        }
    }

    fn detection(x: f32, y: f32, size: f32, score: f32) -> Detection {
        Detection {
            score,
            bbox: BoundingBox::new(x, y, size, size),
            landmarks: None,
        }
    }

    fn png(width: u32, height: u32, red: u8) -> Vec<u8> {
        let image = RgbImage::from_pixel(width, height, Rgb([red, 40, 40]));
        let mut buf = Cursor::new(Vec::new());
        image.write_to(&mut buf, ImageFormat::Png).unwrap();
        buf.into_inner()
    }

    fn api(analyzer: FakeAnalyzer) -> FaceApi<FakeAnalyzer> {
        FaceApi::new(Arc::new(analyzer), ImageLoader::new(Duration::from_secs(1)).unwrap())
    }

    fn two_faces() -> FakeAnalyzer {
        FakeAnalyzer::new(vec![
            detection(10.0, 10.0, 60.0, 0.7),
            detection(100.0, 20.0, 80.0, 0.95),
        ])
    }

    #[tokio::test]
    async fn test_single_keeps_best_face() {
        let api = api(two_faces());
        let result = api
            .compute_descriptor(DescribeRequest::new(png(200, 120, 200)).single(true))
            .await
            .unwrap();
        match result {
            OneOrMany::One(face) => {
                assert!((face.detection.score - 0.95).abs() < 1e-6);
                assert_eq!(face.landmarks.positions.len(), FaceLandmarks::NUM_POINTS);
                assert_eq!(face.descriptor.len(), 128);
            }
            OneOrMany::Many(_) => panic!("single mode must return one face"),
        }
        assert_eq!(api.analyzer.landmark_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_multi_returns_all_by_score() {
        let api = api(two_faces());
        let result = api
            .compute_descriptor(DescribeRequest::new(png(200, 120, 200)).tiny_landmarks(true))
            .await
            .unwrap();
        let faces = result.into_vec();
        assert_eq!(faces.len(), 2);
        assert!(faces[0].detection.score > faces[1].detection.score);
        assert!(faces.iter().all(|f| f.landmarks.model == LandmarkModel::Tiny));
    }

    #[tokio::test]
    async fn test_no_face_is_an_error() {
        let api = api(FakeAnalyzer::new(vec![]));
        let err = api
            .compute_descriptor(DescribeRequest::new(png(64, 64, 10)))
            .await
            .unwrap_err();
        assert!(matches!(err, DescribeError::NoFaceFound { model: DetectorKind::Ssd, .. }));
        assert_eq!(
            err.to_string(),
            "Unable to find any face in the picture. Try changing 'model' to either \"tiny\" or \"mtcnn\" or use a different image."
        );

        let err = api
            .compute_descriptor(DescribeRequest::new(png(64, 64, 10)).model(DetectorKind::Tiny).single(true))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("either \"ssd\" or \"mtcnn\""), "{err}");
    }

    #[tokio::test]
    async fn test_no_face_hint_follows_unknown_selector() {
        let api = api(FakeAnalyzer::new(vec![]));
        let request = DescribeRequest::new(png(64, 64, 10)).selector("yolo");
        assert_eq!(request.model, DetectorKind::Ssd);

        let err = api.compute_descriptor(request).await.unwrap_err();
        assert!(matches!(err, DescribeError::NoFaceFound { model: DetectorKind::Ssd, .. }));
        assert!(
            err.to_string().contains("either \"tiny\" or \"ssd\" or \"mtcnn\""),
            "{err}"
        );

        let err = api
            .compute_descriptor(DescribeRequest::new(png(64, 64, 10)).selector("mtcnn"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("either \"tiny\" or \"ssd\" or use"), "{err}");
    }

    #[tokio::test]
    async fn test_invalid_options_rejected_before_fetch() {
        let api = api(two_faces());
        let overrides = DetectorOverrides {
            input_size: Some(100),
            ..Default::default()
        };
        let request = DescribeRequest::new(ImageSource::Path("/nonexistent/face.png".into()))
            .model(DetectorKind::Tiny)
            .model_options(overrides);
        let err = api.compute_descriptor(request).await.unwrap_err();
        assert!(matches!(err, DescribeError::Options(OptionsError::InvalidValue { field: "input_size", .. })));
    }

    #[tokio::test]
    async fn test_decode_failure() {
        let api = api(two_faces());
        let err = api
            .compute_descriptor(DescribeRequest::new(b"definitely not a picture".to_vec()))
            .await
            .unwrap_err();
        assert!(matches!(err, DescribeError::Decode(DecodeError::Image(_))));
    }

    #[tokio::test]
    async fn test_stage_failure_aborts() {
        let mut analyzer = two_faces();
        analyzer.fail_expressions = true;
        let err = api(analyzer)
            .compute_descriptor(DescribeRequest::new(png(200, 120, 200)))
            .await
            .unwrap_err();
        assert!(matches!(err, DescribeError::Model(ModelError::InferenceFailed(_))));
    }

    #[tokio::test]
    async fn test_concurrent_calls_do_not_interfere() {
        let api = api(two_faces());
        let dark = DescribeRequest::new(png(200, 120, 20)).single(true);
        let bright = DescribeRequest::new(png(200, 120, 240)).single(true);

        let (a, b) = tokio::join!(
            api.compute_descriptor(dark.clone()),
            api.compute_descriptor(bright.clone())
        );
        let (a, b) = (a.unwrap().into_vec(), b.unwrap().into_vec());
        assert_ne!(a[0].descriptor, b[0].descriptor);

        let again = api.compute_descriptor(dark).await.unwrap().into_vec();
        assert_eq!(a[0].descriptor, again[0].descriptor);
    }

    #[tokio::test]
    async fn test_describe_then_match() {
        let api = api(two_faces());
        let reference = api
            .compute_descriptor(DescribeRequest::new(png(200, 120, 200)).single(true))
            .await
            .unwrap()
            .into_vec();
        let gallery = vec![api.label_faces("alice", vec![reference[0].descriptor.clone()]).unwrap()];

        let query = api
            .compute_descriptor(DescribeRequest::new(png(200, 120, 200)))
            .await
            .unwrap();
        let matches = api.match_face(gallery, Some(&query)).unwrap().unwrap();
        assert_eq!(matches.len(), 2);
        assert!(matches.iter().all(|m| m.label == "alice"));
    }

    #[test]
    fn test_describe_faces_uses_detector_landmarks_as_fallback() {
        struct NoLandmarks(FakeAnalyzer);
        impl FaceAnalyzer for NoLandmarks {
            fn detect_faces(&self, i: &RgbImage, o: &DetectorOptions) -> Result<Vec<Detection>, ModelError> {
                self.0.detect_faces(i, o)
            }
            fn detect_landmarks(&self, _: &RgbImage, _: Point, model: LandmarkModel) -> Result<FaceLandmarks, ModelError> {
                Ok(FaceLandmarks { positions: Vec::new(), model })
            }
            fn estimate_age_gender(&self, a: &RgbImage) -> Result<AgeGender, ModelError> {
                self.0.estimate_age_gender(a)
            }
            fn recognize_expressions(&self, a: &RgbImage) -> Result<FaceExpressions, ModelError> {
                self.0.recognize_expressions(a)
            }
            fn compute_descriptor(&self, a: &RgbImage) -> Result<Descriptor, ModelError> {
                self.0.compute_descriptor(a)
            }
        }

        let image = RgbImage::from_pixel(100, 100, Rgb([90, 0, 0]));
        let mut det = detection(20.0, 20.0, 60.0, 0.9);
        let options = DetectorOptions::build(DetectorKind::Mtcnn, None).unwrap();

        let analyzer = NoLandmarks(FakeAnalyzer::new(vec![det.clone()]));
        assert!(describe_faces(&analyzer, &image, &options, true, LandmarkModel::Full).is_err());

        det.landmarks = Some([
            Point::new(38.0, 45.0),
            Point::new(62.0, 45.0),
            Point::new(50.0, 56.0),
            Point::new(40.0, 68.0),
            Point::new(60.0, 68.0),
        ]);
        let analyzer = NoLandmarks(FakeAnalyzer::new(vec![det]));
        let faces = describe_faces(&analyzer, &image, &options, true, LandmarkModel::Full).unwrap();
        assert_eq!(faces.len(), 1);
    }

    #[tokio::test]
    async fn test_free_function_requires_init() {
        let err = compute_descriptor(DescribeRequest::new(png(8, 8, 0))).await.unwrap_err();
        assert!(matches!(err, DescribeError::NotInitialized));
    }
}
