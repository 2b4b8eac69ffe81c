//! MTCNN: three-stage cascaded face detector.
//!
//! P-Net scans an image pyramid for candidate windows, R-Net rejects and
//! refines them on 24x24 crops, O-Net produces final boxes plus five
//! landmarks on 48x48 crops. Each stage's outputs are identified by channel
//! count (2 = face probability, 4 = box regression, 10 = landmarks).

use super::{nms_indices, OverlapMode};
use crate::config::Config;
use crate::models::{ModelError, ModelFile, Network, OutputTensor};
use crate::options::MtcnnOptions;
use crate::preprocess::{crop_padded, to_nchw, Normalization};
use crate::types::{BoundingBox, Detection, Point};
use image::imageops::{self, FilterType};
use image::RgbImage;

const MTCNN_NORMALIZATION: Normalization = Normalization::uniform(127.5, 1.0 / 128.0);
const PNET_STRIDE: f32 = 2.0;
const PNET_CELL_SIZE: f32 = 12.0;
const RNET_INPUT_SIZE: u32 = 24;
const ONET_INPUT_SIZE: u32 = 48;
const PNET_SCALE_NMS: f32 = 0.5;
const PNET_NMS: f32 = 0.7;
const RNET_NMS: f32 = 0.7;
const ONET_NMS: f32 = 0.7;

/// Candidate window with its pending box regression.
#[derive(Debug, Clone, PartialEq)]
struct Candidate {
    bbox: BoundingBox,
    score: f32,
    /// Offsets of (x1, y1, x2, y2) as fractions of the box size.
    reg: [f32; 4],
}

pub struct Mtcnn {
    pnet: Network,
    rnet: Network,
    onet: Network,
}

impl Mtcnn {
    pub fn load(config: &Config) -> Result<Self, ModelError> {
        Ok(Self {
            pnet: Network::load(ModelFile::MtcnnPNet, config)?,
            rnet: Network::load(ModelFile::MtcnnRNet, config)?,
            onet: Network::load(ModelFile::MtcnnONet, config)?,
        })
    }

    pub fn detect(&self, image: &RgbImage, options: &MtcnnOptions) -> Result<Vec<Detection>, ModelError> {
        let (width, height) = image.dimensions();
        let scales = pyramid_scales(width, height, options);
        tracing::debug!(?scales, "mtcnn pyramid");

        let proposals = self.stage1(image, &scales, options.score_thresholds[0])?;
        tracing::debug!(candidates = proposals.len(), "mtcnn stage 1");
        if proposals.is_empty() {
            return Ok(Vec::new());
        }

        let refined = self.stage2(image, &proposals, options.score_thresholds[1])?;
        tracing::debug!(candidates = refined.len(), "mtcnn stage 2");
        if refined.is_empty() {
            return Ok(Vec::new());
        }

        let mut faces = self.stage3(image, &refined, options.score_thresholds[2])?;
        for face in faces.iter_mut() {
            face.bbox = face.bbox.clamp_to(width, height);
        }
        faces.retain(|f| f.bbox.area() > 0.0);
        tracing::debug!(faces = faces.len(), "mtcnn stage 3");
        Ok(faces)
    }

    /// P-Net over every pyramid level; returns calibrated square boxes.
    fn stage1(&self, image: &RgbImage, scales: &[f32], threshold: f32) -> Result<Vec<BoundingBox>, ModelError> {
        let (width, height) = image.dimensions();
        let mut all = Vec::new();

        for &scale in scales {
            let sw = (width as f32 * scale).ceil() as u32;
            let sh = (height as f32 * scale).ceil() as u32;
            if (sw as f32) < PNET_CELL_SIZE || (sh as f32) < PNET_CELL_SIZE {
                continue;
            }

            let resized = imageops::resize(image, sw, sh, FilterType::Triangle);
            let tensor = to_nchw(std::slice::from_ref(&resized), MTCNN_NORMALIZATION);
            let outputs = self.pnet.run(&tensor)?;
            let prob = by_channels(&outputs, 2, "p-net probability")?;
            let reg = by_channels(&outputs, 4, "p-net regression")?;

            let candidates = pnet_candidates(prob, reg, scale, threshold);
            all.extend(suppress(candidates, PNET_SCALE_NMS, OverlapMode::Union));
        }

        Ok(suppress(all, PNET_NMS, OverlapMode::Union)
            .into_iter()
            .map(|c| calibrate(&c.bbox, &c.reg).to_square())
            .collect())
    }

    /// R-Net on 24x24 crops; returns calibrated square boxes.
    fn stage2(&self, image: &RgbImage, boxes: &[BoundingBox], threshold: f32) -> Result<Vec<BoundingBox>, ModelError> {
        let crops: Vec<RgbImage> = boxes
            .iter()
            .map(|b| crop_padded(image, b, RNET_INPUT_SIZE))
            .collect();
        let outputs = self.rnet.run(&to_nchw(&crops, MTCNN_NORMALIZATION))?;
        let prob = by_channels(&outputs, 2, "r-net probability")?;
        let reg = by_channels(&outputs, 4, "r-net regression")?;

        Ok(refine_candidates(boxes, prob, reg, threshold))
    }

    /// O-Net on 48x48 crops; returns final detections with landmarks.
    fn stage3(&self, image: &RgbImage, boxes: &[BoundingBox], threshold: f32) -> Result<Vec<Detection>, ModelError> {
        let crops: Vec<RgbImage> = boxes
            .iter()
            .map(|b| crop_padded(image, b, ONET_INPUT_SIZE))
            .collect();
        let outputs = self.onet.run(&to_nchw(&crops, MTCNN_NORMALIZATION))?;
        let prob = by_channels(&outputs, 2, "o-net probability")?;
        let reg = by_channels(&outputs, 4, "o-net regression")?;
        let points = by_channels(&outputs, 10, "o-net landmarks")?;

        Ok(finalize_detections(boxes, prob, reg, points, threshold))
    }
}

/// R-Net post-processing over `[N,2]` probabilities and `[N,4]` regressions,
/// one row per input box: threshold, union NMS, then calibrate to squares.
fn refine_candidates(
    boxes: &[BoundingBox],
    prob: &OutputTensor,
    reg: &OutputTensor,
    threshold: f32,
) -> Vec<BoundingBox> {
    let candidates: Vec<Candidate> = boxes
        .iter()
        .enumerate()
        .filter_map(|(i, b)| {
            let score = prob.data.get(i * 2 + 1).copied()?;
            if score < threshold {
                return None;
            }
            let r = reg.data.get(i * 4..i * 4 + 4)?;
            Some(Candidate {
                bbox: *b,
                score,
                reg: [r[0], r[1], r[2], r[3]],
            })
        })
        .collect();

    suppress(candidates, RNET_NMS, OverlapMode::Union)
        .into_iter()
        .map(|c| calibrate(&c.bbox, &c.reg).to_square())
        .collect()
}

/// O-Net post-processing over `[N,2]`, `[N,4]` and `[N,10]` outputs:
/// threshold, calibrate, attach landmarks, then min-overlap NMS.
fn finalize_detections(
    boxes: &[BoundingBox],
    prob: &OutputTensor,
    reg: &OutputTensor,
    points: &OutputTensor,
    threshold: f32,
) -> Vec<Detection> {
    let mut detections = Vec::new();
    for (i, b) in boxes.iter().enumerate() {
        let Some(score) = prob.data.get(i * 2 + 1).copied() else {
            continue;
        };
        if score < threshold {
            continue;
        }
        let (Some(r), Some(lm)) = (
            reg.data.get(i * 4..i * 4 + 4),
            points.data.get(i * 10..i * 10 + 10),
        ) else {
            continue;
        };

        detections.push(Detection {
            score,
            bbox: calibrate(b, &[r[0], r[1], r[2], r[3]]),
            landmarks: Some(onet_landmarks(b, lm)),
        });
    }

    let boxes: Vec<BoundingBox> = detections.iter().map(|d| d.bbox).collect();
    let scores: Vec<f32> = detections.iter().map(|d| d.score).collect();
    nms_indices(&boxes, &scores, ONET_NMS, OverlapMode::Min)
        .into_iter()
        .map(|i| detections[i].clone())
        .collect()
}

/// Pyramid scales: start where `min_face_size` maps onto one 12px cell and
/// shrink by `scale_factor` while the short side still covers a cell.
fn pyramid_scales(width: u32, height: u32, options: &MtcnnOptions) -> Vec<f32> {
    let m = PNET_CELL_SIZE / options.min_face_size.max(1) as f32;
    let mut min_layer = width.min(height) as f32 * m;
    let mut scale = m;
    let mut scales = Vec::new();

    while min_layer >= PNET_CELL_SIZE && scales.len() < options.max_num_scales {
        scales.push(scale);
        scale *= options.scale_factor;
        min_layer *= options.scale_factor;
    }

    scales
}

/// Turn the P-Net heat map of one pyramid level into source-space windows.
fn pnet_candidates(prob: &OutputTensor, reg: &OutputTensor, scale: f32, threshold: f32) -> Vec<Candidate> {
    let (h, w) = (prob.dim(2), prob.dim(3));
    let plane = h * w;
    if prob.data.len() < 2 * plane || reg.data.len() < 4 * plane {
        return Vec::new();
    }

    let mut candidates = Vec::new();
    for y in 0..h {
        for x in 0..w {
            let idx = y * w + x;
            let score = prob.data[plane + idx];
            if score < threshold {
                continue;
            }

            let x1 = (PNET_STRIDE * x as f32) / scale;
            let y1 = (PNET_STRIDE * y as f32) / scale;
            let x2 = (PNET_STRIDE * x as f32 + PNET_CELL_SIZE) / scale;
            let y2 = (PNET_STRIDE * y as f32 + PNET_CELL_SIZE) / scale;

            candidates.push(Candidate {
                bbox: BoundingBox::from_corners(x1, y1, x2, y2),
                score,
                reg: [
                    reg.data[idx],
                    reg.data[plane + idx],
                    reg.data[2 * plane + idx],
                    reg.data[3 * plane + idx],
                ],
            });
        }
    }

    candidates
}

/// Apply box regression offsets.
fn calibrate(bbox: &BoundingBox, reg: &[f32; 4]) -> BoundingBox {
    let (w, h) = (bbox.width, bbox.height);
    BoundingBox::from_corners(
        bbox.x + reg[0] * w,
        bbox.y + reg[1] * h,
        bbox.right() + reg[2] * w,
        bbox.bottom() + reg[3] * h,
    )
}

/// O-Net landmarks are relative to the input window: five x's then five y's.
fn onet_landmarks(bbox: &BoundingBox, lm: &[f32]) -> [Point; 5] {
    std::array::from_fn(|j| {
        Point::new(
            bbox.x + bbox.width * lm[j],
            bbox.y + bbox.height * lm[j + 5],
        )
    })
}

fn suppress(candidates: Vec<Candidate>, threshold: f32, mode: OverlapMode) -> Vec<Candidate> {
    let boxes: Vec<BoundingBox> = candidates.iter().map(|c| c.bbox).collect();
    let scores: Vec<f32> = candidates.iter().map(|c| c.score).collect();
    nms_indices(&boxes, &scores, threshold, mode)
        .into_iter()
        .map(|i| candidates[i].clone())
        .collect()
}

fn by_channels<'a>(
    outputs: &'a [OutputTensor],
    channels: usize,
    what: &str,
) -> Result<&'a OutputTensor, ModelError> {
    outputs
        .iter()
        .find(|t| t.dim(1) == channels)
        .ok_or_else(|| {
            ModelError::InferenceFailed(format!(
                "mtcnn: no {what} output with {channels} channels, got shapes {:?}",
                outputs.iter().map(|t| &t.shape).collect::<Vec<_>>()
            ))
        })
}
