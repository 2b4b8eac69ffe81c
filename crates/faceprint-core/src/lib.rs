//! faceprint-core: face description and matching.
//!
//! Detects faces with one of three interchangeable detectors (SSD MobileNet
//! v1, Tiny Face Detector, MTCNN), then computes 68-point landmarks, age,
//! gender, expressions and a 128-float descriptor per face. All networks run
//! on ONNX Runtime. Descriptors are matched against labelled galleries by
//! Euclidean distance.

pub mod alignment;
pub mod attributes;
pub mod config;
pub mod describe;
pub mod detector;
pub mod gallery;
pub mod image_source;
pub mod landmarks;
pub mod matcher;
pub mod models;
pub mod options;
pub mod preprocess;
pub mod recognizer;
pub mod registry;
pub mod types;

use std::path::PathBuf;

pub use config::Config;
pub use describe::{compute_descriptor, DescribeError, DescribeRequest, FaceAnalyzer, FaceApi};
pub use gallery::{load_gallery, merge_into_gallery, save_gallery, GalleryError};
pub use image_source::{DecodeError, ImageSource};
pub use matcher::{
    label_faces, match_face, EuclideanMatcher, FaceMatch, FaceMatcher, LabeledDescriptors,
    MatchError, Matcher, UNKNOWN_LABEL,
};
pub use models::{ModelError, ModelFile};
pub use options::{DetectorKind, DetectorOptions, DetectorOverrides, OptionsError};
pub use registry::{global, init, missing_models, ModelRegistry};
pub use types::{
    AgeGender, BoundingBox, Descriptor, Detection, Expression, FaceExpressions, FaceLandmarks,
    FaceResult, Gender, OneOrMany, Point,
};

/// `weights/` next to the running executable, or `./weights` when the
/// executable path is unknown.
pub fn default_model_dir() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join("weights")))
        .unwrap_or_else(|| PathBuf::from("weights"))
}
