//! 68-point facial landmark regression.
//!
//! The face crop is letterboxed into a 112x112 input; the network returns 136
//! values (x, y pairs) relative to that input, which are mapped back to
//! source-image pixels.

use crate::config::Config;
use crate::models::{ModelError, ModelFile, Network};
use crate::preprocess::{letterbox, to_nchw, LetterboxInfo, Normalization};
use crate::types::{FaceLandmarks, LandmarkModel, Point};
use image::RgbImage;

const LANDMARK_INPUT_SIZE: u32 = 112;
pub(crate) const LANDMARK_NORMALIZATION: Normalization =
    Normalization::new([122.782, 117.001, 104.298], 1.0 / 255.0);

pub struct LandmarkNet {
    network: Network,
    model: LandmarkModel,
}

impl LandmarkNet {
    pub fn load(model: LandmarkModel, config: &Config) -> Result<Self, ModelError> {
        let file = match model {
            LandmarkModel::Full => ModelFile::FaceLandmark68,
            LandmarkModel::Tiny => ModelFile::FaceLandmark68Tiny,
        };
        Ok(Self {
            network: Network::load(file, config)?,
            model,
        })
    }

    /// Landmarks for `face`, a crop whose top-left corner sits at `origin` in
    /// the source image. Returned points are in source-image pixels.
    pub fn detect(&self, face: &RgbImage, origin: Point) -> Result<FaceLandmarks, ModelError> {
        let (input, letterbox) = letterbox(face, LANDMARK_INPUT_SIZE);
        let outputs = self
            .network
            .run(&to_nchw(std::slice::from_ref(&input), LANDMARK_NORMALIZATION))?;

        let expected = FaceLandmarks::NUM_POINTS * 2;
        let raw = outputs
            .iter()
            .find(|t| t.data.len() == expected)
            .ok_or_else(|| {
                ModelError::InferenceFailed(format!(
                    "{}: expected {expected} landmark values",
                    self.network.file()
                ))
            })?;

        Ok(FaceLandmarks {
            positions: decode(&raw.data, &letterbox, origin),
            model: self.model,
        })
    }
}

fn decode(raw: &[f32], letterbox: &LetterboxInfo, origin: Point) -> Vec<Point> {
    raw.chunks_exact(2)
        .map(|xy| {
            let (x, y) = letterbox.relative_to_source(xy[0], xy[1]);
            Point::new(origin.x + x, origin.y + y)
        })
        .collect()
}
