use serde::{Deserialize, Serialize};

/// A point in source-image pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

impl Point {
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    /// Mean of a non-empty set of points. Returns the origin for an empty slice.
    pub fn centroid(points: &[Point]) -> Point {
        if points.is_empty() {
            return Point::default();
        }
        let n = points.len() as f32;
        let (sx, sy) = points
            .iter()
            .fold((0.0f32, 0.0f32), |(sx, sy), p| (sx + p.x, sy + p.y));
        Point::new(sx / n, sy / n)
    }
}

/// Axis-aligned face region in source-image pixels.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl BoundingBox {
    pub fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self { x, y, width, height }
    }

    /// Build from corner coordinates.
    pub fn from_corners(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self { x: x1, y: y1, width: x2 - x1, height: y2 - y1 }
    }

    pub fn right(&self) -> f32 {
        self.x + self.width
    }

    pub fn bottom(&self) -> f32 {
        self.y + self.height
    }

    pub fn area(&self) -> f32 {
        self.width.max(0.0) * self.height.max(0.0)
    }

    /// Area of the overlap with `other` (zero when disjoint).
    pub fn intersection(&self, other: &BoundingBox) -> f32 {
        let x1 = self.x.max(other.x);
        let y1 = self.y.max(other.y);
        let x2 = self.right().min(other.right());
        let y2 = self.bottom().min(other.bottom());
        (x2 - x1).max(0.0) * (y2 - y1).max(0.0)
    }

    /// Grow the shorter side around the centre so the box becomes square.
    pub fn to_square(&self) -> BoundingBox {
        let side = self.width.max(self.height);
        BoundingBox {
            x: self.x + (self.width - side) * 0.5,
            y: self.y + (self.height - side) * 0.5,
            width: side,
            height: side,
        }
    }

    /// Clip to `[0, width) x [0, height)`.
    pub fn clamp_to(&self, width: u32, height: u32) -> BoundingBox {
        let x1 = self.x.clamp(0.0, width as f32);
        let y1 = self.y.clamp(0.0, height as f32);
        let x2 = self.right().clamp(0.0, width as f32);
        let y2 = self.bottom().clamp(0.0, height as f32);
        BoundingBox::from_corners(x1, y1, x2, y2)
    }
}

/// Output of a detector backend, before any per-face network has run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub score: f32,
    pub bbox: BoundingBox,
    /// Five-point landmarks when the backend produces them (MTCNN):
    /// [left_eye, right_eye, nose, left_mouth, right_mouth].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub landmarks: Option<[Point; 5]>,
}

/// Which 68-point landmark network produced a landmark set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LandmarkModel {
    Full,
    Tiny,
}

/// 68-point facial landmarks (iBUG 300-W layout).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaceLandmarks {
    pub positions: Vec<Point>,
    pub model: LandmarkModel,
}

impl FaceLandmarks {
    pub const NUM_POINTS: usize = 68;

    fn region(&self, start: usize, end: usize) -> &[Point] {
        self.positions.get(start..end).unwrap_or(&[])
    }

    pub fn jaw_outline(&self) -> &[Point] {
        self.region(0, 17)
    }

    pub fn left_eye_brow(&self) -> &[Point] {
        self.region(17, 22)
    }

    pub fn right_eye_brow(&self) -> &[Point] {
        self.region(22, 27)
    }

    pub fn nose(&self) -> &[Point] {
        self.region(27, 36)
    }

    pub fn left_eye(&self) -> &[Point] {
        self.region(36, 42)
    }

    pub fn right_eye(&self) -> &[Point] {
        self.region(42, 48)
    }

    pub fn mouth(&self) -> &[Point] {
        self.region(48, 68)
    }

    /// Five alignment points derived from the 68-point set:
    /// eye centres, nose tip and the two mouth corners.
    ///
    /// Returns `None` unless all 68 points are present.
    pub fn alignment_points(&self) -> Option<[(f32, f32); 5]> {
        if self.positions.len() != Self::NUM_POINTS {
            return None;
        }
        let left_eye = Point::centroid(self.left_eye());
        let right_eye = Point::centroid(self.right_eye());
        let nose_tip = self.positions[30];
        let mouth_left = self.positions[48];
        let mouth_right = self.positions[54];
        Some([
            (left_eye.x, left_eye.y),
            (right_eye.x, right_eye.y),
            (nose_tip.x, nose_tip.y),
            (mouth_left.x, mouth_left.y),
            (mouth_right.x, mouth_right.y),
        ])
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Gender {
    Male,
    Female,
}

impl Gender {
    pub fn as_str(&self) -> &'static str {
        match self {
            Gender::Male => "male",
            Gender::Female => "female",
        }
    }
}

/// Estimated age and gender for one face.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AgeGender {
    pub age: f32,
    pub gender: Gender,
    pub gender_probability: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Expression {
    Neutral,
    Happy,
    Sad,
    Angry,
    Fearful,
    Disgusted,
    Surprised,
}

impl Expression {
    /// Network output order.
    pub const ALL: [Expression; 7] = [
        Expression::Neutral,
        Expression::Happy,
        Expression::Sad,
        Expression::Angry,
        Expression::Fearful,
        Expression::Disgusted,
        Expression::Surprised,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Expression::Neutral => "neutral",
            Expression::Happy => "happy",
            Expression::Sad => "sad",
            Expression::Angry => "angry",
            Expression::Fearful => "fearful",
            Expression::Disgusted => "disgusted",
            Expression::Surprised => "surprised",
        }
    }
}

/// Probability per expression; values sum to ~1.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct FaceExpressions {
    pub neutral: f32,
    pub happy: f32,
    pub sad: f32,
    pub angry: f32,
    pub fearful: f32,
    pub disgusted: f32,
    pub surprised: f32,
}

impl FaceExpressions {
    /// Build from probabilities in [`Expression::ALL`] order.
    pub fn from_probabilities(probs: [f32; 7]) -> Self {
        Self {
            neutral: probs[0],
            happy: probs[1],
            sad: probs[2],
            angry: probs[3],
            fearful: probs[4],
            disgusted: probs[5],
            surprised: probs[6],
        }
    }

    pub fn get(&self, expression: Expression) -> f32 {
        match expression {
            Expression::Neutral => self.neutral,
            Expression::Happy => self.happy,
            Expression::Sad => self.sad,
            Expression::Angry => self.angry,
            Expression::Fearful => self.fearful,
            Expression::Disgusted => self.disgusted,
            Expression::Surprised => self.surprised,
        }
    }

    /// All expressions, most probable first.
    pub fn sorted(&self) -> Vec<(Expression, f32)> {
        let mut all: Vec<(Expression, f32)> =
            Expression::ALL.iter().map(|&e| (e, self.get(e))).collect();
        all.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        all
    }

    pub fn dominant(&self) -> (Expression, f32) {
        self.sorted()
            .into_iter()
            .next()
            .unwrap_or((Expression::Neutral, 0.0))
    }

    pub fn total(&self) -> f32 {
        Expression::ALL.iter().map(|&e| self.get(e)).sum()
    }
}

/// Face descriptor vector (128-dimensional for the bundled recognition net).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Descriptor {
    pub values: Vec<f32>,
    /// Model version that produced this descriptor (e.g., "face_recognition_128").
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_version: Option<String>,
}

impl Descriptor {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values, model_version: None }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Compute Euclidean distance between two descriptors.
    pub fn euclidean_distance(&self, other: &Descriptor) -> f32 {
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }

    /// Whether two descriptors may be compared: same length and, when both
    /// record one, the same model version.
    pub fn is_comparable(&self, other: &Descriptor) -> bool {
        if self.values.len() != other.values.len() {
            return false;
        }
        match (&self.model_version, &other.model_version) {
            (Some(a), Some(b)) => a == b,
            _ => true,
        }
    }
}

/// One fully described face.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaceResult {
    pub detection: Detection,
    pub landmarks: FaceLandmarks,
    pub age: f32,
    pub gender: Gender,
    pub gender_probability: f32,
    pub expressions: FaceExpressions,
    pub descriptor: Descriptor,
}

/// Either a single value or an ordered sequence of values.
///
/// Single-face requests produce `One`, multi-face requests `Many`; the
/// matcher mirrors the shape of its query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OneOrMany<T> {
    One(T),
    Many(Vec<T>),
}

impl<T> OneOrMany<T> {
    pub fn len(&self) -> usize {
        match self {
            OneOrMany::One(_) => 1,
            OneOrMany::Many(items) => items.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        match self {
            OneOrMany::One(item) => std::slice::from_ref(item).iter(),
            OneOrMany::Many(items) => items.iter(),
        }
    }

    pub fn into_vec(self) -> Vec<T> {
        match self {
            OneOrMany::One(item) => vec![item],
            OneOrMany::Many(items) => items,
        }
    }
}
