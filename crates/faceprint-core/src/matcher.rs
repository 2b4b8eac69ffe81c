//! Labelled galleries and nearest-identity matching.

use crate::config::DEFAULT_DISTANCE_THRESHOLD;
use crate::types::{Descriptor, FaceResult, OneOrMany};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Label reported when no identity is close enough.
pub const UNKNOWN_LABEL: &str = "unknown";

#[derive(Error, Debug, PartialEq)]
pub enum MatchError {
    #[error("label must not be empty")]
    EmptyLabel,
    #[error("identity {0:?} has no descriptors")]
    NoDescriptors(String),
    #[error("descriptor length mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("descriptor model mismatch: expected {expected}, got {actual}")]
    ModelMismatch { expected: String, actual: String },
}

/// One identity: a label and its reference descriptors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabeledDescriptors {
    pub label: String,
    pub descriptors: Vec<Descriptor>,
}

impl LabeledDescriptors {
    /// Validate that the entry is usable: non-empty label, at least one
    /// descriptor, and all descriptors mutually comparable.
    pub fn validate(&self) -> Result<(), MatchError> {
        if self.label.trim().is_empty() {
            return Err(MatchError::EmptyLabel);
        }
        let first = self
            .descriptors
            .first()
            .ok_or_else(|| MatchError::NoDescriptors(self.label.clone()))?;
        for d in &self.descriptors[1..] {
            check_comparable(first, d)?;
        }
        Ok(())
    }
}

/// Build a gallery entry from a label and its reference descriptors.
pub fn label_faces(
    label: impl Into<String>,
    descriptors: Vec<Descriptor>,
) -> Result<LabeledDescriptors, MatchError> {
    let entry = LabeledDescriptors {
        label: label.into(),
        descriptors,
    };
    entry.validate()?;
    Ok(entry)
}

/// Result of matching one query descriptor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaceMatch {
    pub label: String,
    pub distance: f32,
}

impl FaceMatch {
    pub fn unknown(distance: f32) -> Self {
        Self {
            label: UNKNOWN_LABEL.to_string(),
            distance,
        }
    }

    pub fn is_unknown(&self) -> bool {
        self.label == UNKNOWN_LABEL
    }
}

impl fmt::Display for FaceMatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({:.2})", self.label, self.distance)
    }
}

/// Strategy for scoring a query against one identity's references.
/// Lower is closer.
pub trait Matcher: Send + Sync {
    fn distance(&self, query: &Descriptor, identity: &LabeledDescriptors) -> f32;
}

/// Mean Euclidean distance over the identity's descriptors.
#[derive(Debug, Clone, Copy, Default)]
pub struct EuclideanMatcher;

impl Matcher for EuclideanMatcher {
    fn distance(&self, query: &Descriptor, identity: &LabeledDescriptors) -> f32 {
        if identity.descriptors.is_empty() {
            return f32::INFINITY;
        }
        let sum: f32 = identity
            .descriptors
            .iter()
            .map(|d| query.euclidean_distance(d))
            .sum();
        sum / identity.descriptors.len() as f32
    }
}

/// Matches query descriptors against a labelled gallery.
pub struct FaceMatcher<M: Matcher = EuclideanMatcher> {
    gallery: Vec<LabeledDescriptors>,
    threshold: f32,
    matcher: M,
}

impl FaceMatcher<EuclideanMatcher> {
    pub fn new(gallery: Vec<LabeledDescriptors>) -> Result<Self, MatchError> {
        Self::with_threshold(gallery, DEFAULT_DISTANCE_THRESHOLD)
    }

    pub fn with_threshold(gallery: Vec<LabeledDescriptors>, threshold: f32) -> Result<Self, MatchError> {
        Self::with_matcher(gallery, threshold, EuclideanMatcher)
    }

    /// Gallery of anonymous references, labelled `person 1`, `person 2`, ...
    pub fn from_descriptors(descriptors: Vec<Descriptor>) -> Result<Self, MatchError> {
        let gallery = descriptors
            .into_iter()
            .enumerate()
            .map(|(i, d)| LabeledDescriptors {
                label: format!("person {}", i + 1),
                descriptors: vec![d],
            })
            .collect();
        Self::new(gallery)
    }
}

impl<M: Matcher> FaceMatcher<M> {
    /// Every entry must be valid and every descriptor comparable with every
    /// other one.
    pub fn with_matcher(gallery: Vec<LabeledDescriptors>, threshold: f32, matcher: M) -> Result<Self, MatchError> {
        let mut reference: Option<&Descriptor> = None;
        for entry in &gallery {
            entry.validate()?;
            for d in &entry.descriptors {
                match reference {
                    Some(r) => check_comparable(r, d)?,
                    None => reference = Some(d),
                }
            }
        }

        Ok(Self {
            gallery,
            threshold,
            matcher,
        })
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    pub fn gallery(&self) -> &[LabeledDescriptors] {
        &self.gallery
    }

    /// Nearest identity, or `unknown` unless its distance is strictly below
    /// the threshold. An empty gallery always answers `unknown` at infinite
    /// distance.
    pub fn find_best_match(&self, query: &Descriptor) -> Result<FaceMatch, MatchError> {
        let Some(reference) = self.gallery.first().and_then(|e| e.descriptors.first()) else {
            return Ok(FaceMatch::unknown(f32::INFINITY));
        };
        check_comparable(reference, query)?;

        let mut best = FaceMatch::unknown(f32::INFINITY);
        for entry in &self.gallery {
            let distance = self.matcher.distance(query, entry);
            if distance < best.distance {
                best = FaceMatch {
                    label: entry.label.clone(),
                    distance,
                };
            }
        }

        if best.distance < self.threshold {
            Ok(best)
        } else {
            Ok(FaceMatch::unknown(best.distance))
        }
    }

    /// Match every face in `query`, mirroring its shape. `None` and empty
    /// sequences produce `None`.
    pub fn match_faces(
        &self,
        query: Option<&OneOrMany<FaceResult>>,
    ) -> Result<Option<OneOrMany<FaceMatch>>, MatchError> {
        match query {
            None => Ok(None),
            Some(OneOrMany::One(face)) => Ok(Some(OneOrMany::One(self.find_best_match(&face.descriptor)?))),
            Some(OneOrMany::Many(faces)) if faces.is_empty() => Ok(None),
            Some(OneOrMany::Many(faces)) => {
                let matches = faces
                    .iter()
                    .map(|f| self.find_best_match(&f.descriptor))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Some(OneOrMany::Many(matches)))
            }
        }
    }
}

/// Match `query` against `gallery` with the default threshold.
pub fn match_face(
    gallery: Vec<LabeledDescriptors>,
    query: Option<&OneOrMany<FaceResult>>,
) -> Result<Option<OneOrMany<FaceMatch>>, MatchError> {
    FaceMatcher::new(gallery)?.match_faces(query)
}

fn check_comparable(reference: &Descriptor, other: &Descriptor) -> Result<(), MatchError> {
    if reference.len() != other.len() {
        return Err(MatchError::DimensionMismatch {
            expected: reference.len(),
            actual: other.len(),
        });
    }
    if !reference.is_comparable(other) {
        return Err(MatchError::ModelMismatch {
            expected: reference.model_version.clone().unwrap_or_default(),
            actual: other.model_version.clone().unwrap_or_default(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{
        BoundingBox, Detection, FaceExpressions, FaceLandmarks, Gender, LandmarkModel,
    };

    fn desc(values: &[f32]) -> Descriptor {
        Descriptor::new(values.to_vec())
    }

    fn face(values: &[f32]) -> FaceResult {
        FaceResult {
            detection: Detection {
                score: 0.9,
                bbox: BoundingBox::new(0.0, 0.0, 10.0, 10.0),
                landmarks: None,
            },
            landmarks: FaceLandmarks {
                positions: Vec::new(),
                model: LandmarkModel::Full,
            },
            age: 30.0,
            gender: Gender::Female,
            gender_probability: 0.9,
            expressions: FaceExpressions::default(),
            descriptor: desc(values),
        }
    }

    fn gallery() -> Vec<LabeledDescriptors> {
        vec![
            label_faces("alice", vec![desc(&[0.0, 0.0]), desc(&[0.2, 0.0])]).unwrap(),
            label_faces("bob", vec![desc(&[1.0, 1.0])]).unwrap(),
        ]
    }

    #[test]
    fn test_label_faces_validation() {
        assert_eq!(label_faces("  ", vec![desc(&[0.0])]), Err(MatchError::EmptyLabel));
        assert_eq!(
            label_faces("carol", vec![]),
            Err(MatchError::NoDescriptors("carol".into()))
        );
        assert_eq!(
            label_faces("carol", vec![desc(&[0.0]), desc(&[0.0, 1.0])]),
            Err(MatchError::DimensionMismatch { expected: 1, actual: 2 })
        );
    }

    #[test]
    fn test_mean_distance_per_identity() {
        let matcher = FaceMatcher::new(gallery()).unwrap();
        let m = matcher.find_best_match(&desc(&[0.1, 0.0])).unwrap();
        assert_eq!(m.label, "alice");
        // mean of 0.1 and 0.1
        assert!((m.distance - 0.1).abs() < 1e-6);
    }

    #[test]
    fn test_threshold_is_strict() {
        let gallery = vec![label_faces("alice", vec![desc(&[0.0, 0.0])]).unwrap()];
        let matcher = FaceMatcher::with_threshold(gallery, 0.5).unwrap();

        let at = matcher.find_best_match(&desc(&[0.5, 0.0])).unwrap();
        assert!(at.is_unknown());
        assert!((at.distance - 0.5).abs() < 1e-6);

        let below = matcher.find_best_match(&desc(&[0.25, 0.0])).unwrap();
        assert_eq!(below.label, "alice");
    }

    #[test]
    fn test_empty_gallery_is_unknown() {
        let matcher = FaceMatcher::new(vec![]).unwrap();
        let m = matcher.find_best_match(&desc(&[0.3; 128])).unwrap();
        assert_eq!(m.label, UNKNOWN_LABEL);
        assert!(m.distance.is_infinite());
    }

    #[test]
    fn test_query_dimension_mismatch() {
        let matcher = FaceMatcher::new(gallery()).unwrap();
        assert_eq!(
            matcher.find_best_match(&desc(&[0.0, 0.0, 0.0])),
            Err(MatchError::DimensionMismatch { expected: 2, actual: 3 })
        );
    }

    #[test]
    fn test_model_mismatch() {
        let mut a = desc(&[0.0, 0.0]);
        a.model_version = Some("face_recognition_128".into());
        let mut b = desc(&[0.0, 0.0]);
        b.model_version = Some("other".into());
        let matcher = FaceMatcher::new(vec![label_faces("x", vec![a]).unwrap()]).unwrap();
        assert!(matches!(
            matcher.find_best_match(&b),
            Err(MatchError::ModelMismatch { .. })
        ));
    }

    #[test]
    fn test_from_descriptors_labels() {
        let matcher = FaceMatcher::from_descriptors(vec![desc(&[0.0]), desc(&[5.0])]).unwrap();
        let labels: Vec<&str> = matcher.gallery().iter().map(|e| e.label.as_str()).collect();
        assert_eq!(labels, vec!["person 1", "person 2"]);
        assert_eq!(matcher.find_best_match(&desc(&[4.9])).unwrap().label, "person 2");
    }

    #[test]
    fn test_match_face_shapes() {
        let single = OneOrMany::One(face(&[1.0, 1.0]));
        match match_face(gallery(), Some(&single)).unwrap() {
            Some(OneOrMany::One(m)) => assert_eq!(m.label, "bob"),
            other => panic!("expected one match, got {other:?}"),
        }

        let many = OneOrMany::Many(vec![face(&[1.0, 1.0]), face(&[9.0, 9.0]), face(&[0.0, 0.0])]);
        match match_face(gallery(), Some(&many)).unwrap() {
            Some(OneOrMany::Many(ms)) => {
                let labels: Vec<&str> = ms.iter().map(|m| m.label.as_str()).collect();
                assert_eq!(labels, vec!["bob", "unknown", "alice"]);
            }
            other => panic!("expected many matches, got {other:?}"),
        }

        assert_eq!(match_face(gallery(), None).unwrap(), None);
        assert_eq!(match_face(gallery(), Some(&OneOrMany::Many(vec![]))).unwrap(), None);
    }

    #[test]
    fn test_empty_gallery_many_queries() {
        let many = OneOrMany::Many(vec![face(&[1.0]), face(&[2.0, 3.0])]);
        let result = match_face(vec![], Some(&many)).unwrap().unwrap();
        assert_eq!(result.len(), 2);
        assert!(result.iter().all(|m| m.is_unknown()));
    }

    #[test]
    fn test_display() {
        let m = FaceMatch { label: "alice".into(), distance: 0.4213 };
        assert_eq!(m.to_string(), "alice (0.42)");
    }
}
