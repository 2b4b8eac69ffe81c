//! SSD MobileNet v1 face detector.
//!
//! The exported graph already decodes its anchors: it yields one box tensor
//! (`[1, N, 4]`, normalized `ymin, xmin, ymax, xmax`) and one score tensor
//! (`[1, N]`, or `[1, N, 2]` with the face column last).

use super::{nms, OverlapMode};
use crate::config::Config;
use crate::models::{ModelError, ModelFile, Network, OutputTensor};
use crate::options::SsdOptions;
use crate::preprocess::{letterbox, to_nchw, LetterboxInfo, Normalization};
use crate::types::{BoundingBox, Detection};
use image::RgbImage;

const SSD_INPUT_SIZE: u32 = 512;
const SSD_NORMALIZATION: Normalization = Normalization::uniform(127.5, 1.0 / 127.5);
const SSD_IOU_THRESHOLD: f32 = 0.5;

pub struct SsdMobilenet {
    network: Network,
}

impl SsdMobilenet {
    pub fn load(config: &Config) -> Result<Self, ModelError> {
        Ok(Self {
            network: Network::load(ModelFile::SsdMobilenetV1, config)?,
        })
    }

    /// Detect faces, returning at most `options.max_results` boxes sorted by score.
    pub fn detect(&self, image: &RgbImage, options: &SsdOptions) -> Result<Vec<Detection>, ModelError> {
        let (input, letterbox) = letterbox(image, SSD_INPUT_SIZE);
        let tensor = to_nchw(std::slice::from_ref(&input), SSD_NORMALIZATION);

        let outputs = self.network.run(&tensor)?;
        let (boxes, scores) = split_outputs(&outputs)?;

        let detections = decode(
            &boxes.data,
            &scores.data,
            &letterbox,
            image.dimensions(),
            options,
        );
        tracing::debug!(faces = detections.len(), "ssd detections");
        Ok(detections)
    }
}

/// Tell the box tensor (last axis 4) from the score tensor.
fn split_outputs(outputs: &[OutputTensor]) -> Result<(&OutputTensor, &OutputTensor), ModelError> {
    let boxes = outputs
        .iter()
        .find(|t| t.name.contains("box") || t.shape.last() == Some(&4))
        .ok_or_else(|| ModelError::InferenceFailed("ssd: no box output".into()))?;
    let scores = outputs
        .iter()
        .find(|t| !std::ptr::eq(*t, boxes))
        .ok_or_else(|| ModelError::InferenceFailed("ssd: no score output".into()))?;
    Ok((boxes, scores))
}

fn decode(
    boxes: &[f32],
    scores: &[f32],
    letterbox: &LetterboxInfo,
    (width, height): (u32, u32),
    options: &SsdOptions,
) -> Vec<Detection> {
    let count = boxes.len() / 4;
    let two_class = scores.len() == count * 2;

    let mut detections = Vec::new();
    for i in 0..count {
        let score = if two_class {
            scores[i * 2 + 1]
        } else {
            scores.get(i).copied().unwrap_or(0.0)
        };
        if score < options.min_confidence {
            continue;
        }

        let b = &boxes[i * 4..i * 4 + 4];
        let (ymin, xmin, ymax, xmax) = (
            b[0].clamp(0.0, 1.0),
            b[1].clamp(0.0, 1.0),
            b[2].clamp(0.0, 1.0),
            b[3].clamp(0.0, 1.0),
        );
        let (x1, y1) = letterbox.relative_to_source(xmin, ymin);
        let (x2, y2) = letterbox.relative_to_source(xmax, ymax);
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

    let mut kept = nms(detections, SSD_IOU_THRESHOLD, OverlapMode::Union);
    kept.truncate(options.max_results);
    kept
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity_letterbox() -> LetterboxInfo {
        LetterboxInfo { scale: 1.0, pad_x: 0.0, pad_y: 0.0, size: 512 }
    }

    #[test]
    fn test_decode_maps_to_pixels() {
        let boxes = vec![0.25, 0.5, 0.5, 0.75];
        let scores = vec![0.9];
        let dets = decode(&boxes, &scores, &identity_letterbox(), (512, 512), &SsdOptions::default());
        assert_eq!(dets.len(), 1);
        let b = dets[0].bbox;
        assert!((b.x - 256.0).abs() < 1e-3);
        assert!((b.y - 128.0).abs() < 1e-3);
        assert!((b.width - 128.0).abs() < 1e-3);
        assert!((b.height - 128.0).abs() < 1e-3);
    }

    #[test]
    fn test_decode_filters_low_confidence() {
        let boxes = vec![0.0, 0.0, 0.5, 0.5, 0.5, 0.5, 1.0, 1.0];
        let scores = vec![0.3, 0.8];
        let dets = decode(&boxes, &scores, &identity_letterbox(), (512, 512), &SsdOptions::default());
        assert_eq!(dets.len(), 1);
        assert!((dets[0].score - 0.8).abs() < 1e-6);
    }

    #[test]
    fn test_decode_two_class_scores() {
        let boxes = vec![0.0, 0.0, 0.5, 0.5];
        let scores = vec![0.1, 0.9];
        let dets = decode(&boxes, &scores, &identity_letterbox(), (512, 512), &SsdOptions::default());
        assert_eq!(dets.len(), 1);
        assert!((dets[0].score - 0.9).abs() < 1e-6);
    }

    #[test]
    fn test_decode_caps_results() {
        // Ten disjoint boxes along the diagonal.
        let mut boxes = Vec::new();
        let mut scores = Vec::new();
        for i in 0..10 {
            let o = i as f32 * 0.1;
            boxes.extend_from_slice(&[o, o, o + 0.05, o + 0.05]);
            scores.push(0.6 + i as f32 * 0.01);
        }
        let options = SsdOptions { min_confidence: 0.5, max_results: 3 };
        let dets = decode(&boxes, &scores, &identity_letterbox(), (512, 512), &options);
        assert_eq!(dets.len(), 3);
        assert!(dets[0].score > dets[1].score && dets[1].score > dets[2].score);
    }

    #[test]
    fn test_split_outputs_by_shape() {
        let outputs = vec![
            OutputTensor { name: "scores".into(), shape: vec![1, 3], data: vec![0.0; 3] },
            OutputTensor { name: "1204".into(), shape: vec![1, 3, 4], data: vec![0.0; 12] },
        ];
        let (boxes, scores) = split_outputs(&outputs).unwrap();
        assert_eq!(boxes.name, "1204");
        assert_eq!(scores.name, "scores");
    }
}
