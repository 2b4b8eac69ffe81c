//! Tiny Face Detector: a single-class YOLOv2-style grid detector.
//!
//! Output layout is `[1, ANCHORS * 5, G, G]` with `G = input_size / 32`;
//! channel `a * 5 + k` holds `(tx, ty, tw, th, score)[k]` for anchor `a`.

use super::{nms, OverlapMode};
use crate::config::Config;
use crate::models::{ModelError, ModelFile, Network};
use crate::options::TinyOptions;
use crate::preprocess::{letterbox, sigmoid, to_nchw, LetterboxInfo, Normalization};
use crate::types::{BoundingBox, Detection};
use image::RgbImage;

const TINY_NORMALIZATION: Normalization =
    Normalization::new([117.001, 114.697, 97.404], 1.0 / 256.0);
const TINY_IOU_THRESHOLD: f32 = 0.4;
const TINY_CELL_SIZE: u32 = 32;
const TINY_BOX_ENCODING: usize = 5;

/// Anchor sizes in grid cells.
const TINY_ANCHORS: [(f32, f32); 5] = [
    (1.603231, 2.094468),
    (6.041143, 7.080126),
    (2.882459, 3.518061),
    (4.266906, 5.178857),
    (9.041765, 10.66308),
];

pub struct TinyFaceDetector {
    network: Network,
}

impl TinyFaceDetector {
    pub fn load(config: &Config) -> Result<Self, ModelError> {
        Ok(Self {
            network: Network::load(ModelFile::TinyFaceDetector, config)?,
        })
    }

    pub fn detect(&self, image: &RgbImage, options: &TinyOptions) -> Result<Vec<Detection>, ModelError> {
        let (input, letterbox) = letterbox(image, options.input_size);
        let tensor = to_nchw(std::slice::from_ref(&input), TINY_NORMALIZATION);

        let outputs = self.network.run(&tensor)?;
        let grid = (options.input_size / TINY_CELL_SIZE) as usize;
        let expected = TINY_ANCHORS.len() * TINY_BOX_ENCODING * grid * grid;
        let output = outputs
            .iter()
            .find(|t| t.data.len() == expected)
            .ok_or_else(|| {
                ModelError::InferenceFailed(format!(
                    "tiny face detector: expected an output of {expected} values for a {grid}x{grid} grid, got shapes {:?}",
                    outputs.iter().map(|t| &t.shape).collect::<Vec<_>>()
                ))
            })?;

        let detections = decode(
            &output.data,
            grid,
            &letterbox,
            image.dimensions(),
            options.score_threshold,
        );
        tracing::debug!(faces = detections.len(), grid, "tiny detections");
        Ok(detections)
    }
}

fn decode(
    output: &[f32],
    grid: usize,
    letterbox: &LetterboxInfo,
    (width, height): (u32, u32),
    threshold: f32,
) -> Vec<Detection> {
    let at = |anchor: usize, k: usize, row: usize, col: usize| -> f32 {
        output[((anchor * TINY_BOX_ENCODING + k) * grid + row) * grid + col]
    };
    let cells = grid as f32;

    let mut detections = Vec::new();
    for row in 0..grid {
        for col in 0..grid {
            for (anchor, &(anchor_w, anchor_h)) in TINY_ANCHORS.iter().enumerate() {
                let score = sigmoid(at(anchor, 4, row, col));
                if score < threshold {
                    continue;
                }

                let cx = (col as f32 + sigmoid(at(anchor, 0, row, col))) / cells;
                let cy = (row as f32 + sigmoid(at(anchor, 1, row, col))) / cells;
                let w = at(anchor, 2, row, col).exp() * anchor_w / cells;
                let h = at(anchor, 3, row, col).exp() * anchor_h / cells;

                let (x1, y1) = letterbox.relative_to_source(cx - w / 2.0, cy - h / 2.0);
                let (x2, y2) = letterbox.relative_to_source(cx + w / 2.0, cy + h / 2.0);
                let bbox = BoundingBox::from_corners(x1, y1, x2, y2).clamp_to(width, height);
                if bbox.area() <= 0.0 {
                    continue;
                }

                detections.push(Detection {
                    score,
                    bbox,
                    landmarks: None,
                });
            }
        }
    }

    nms(detections, TINY_IOU_THRESHOLD, OverlapMode::Union)
}
