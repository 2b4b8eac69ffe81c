//! Face detector backends and shared post-processing.
//!
//! Three interchangeable detectors trade speed for accuracy:
//! SSD MobileNet v1, the Tiny Face Detector and the MTCNN cascade.

pub mod mtcnn;
pub mod ssd;
pub mod tiny;

pub use mtcnn::Mtcnn;
pub use ssd::SsdMobilenet;
pub use tiny::TinyFaceDetector;

use crate::types::{BoundingBox, Detection};

/// Overlap measure used by [`nms`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverlapMode {
    /// Intersection over union.
    Union,
    /// Intersection over the smaller box.
    Min,
}

/// Non-Maximum Suppression: remove overlapping detections.
///
/// Returns the survivors sorted by descending score.
pub fn nms(detections: Vec<Detection>, threshold: f32, mode: OverlapMode) -> Vec<Detection> {
    let boxes: Vec<BoundingBox> = detections.iter().map(|d| d.bbox).collect();
    let scores: Vec<f32> = detections.iter().map(|d| d.score).collect();
    let keep = nms_indices(&boxes, &scores, threshold, mode);

    let mut slots: Vec<Option<Detection>> = detections.into_iter().map(Some).collect();
    keep.into_iter().filter_map(|i| slots[i].take()).collect()
}

/// Index form of [`nms`]: indices of the surviving boxes, best score first.
pub fn nms_indices(boxes: &[BoundingBox], scores: &[f32], threshold: f32, mode: OverlapMode) -> Vec<usize> {
    let mut order: Vec<usize> = (0..boxes.len().min(scores.len())).collect();
    order.sort_by(|&a, &b| {
        scores[b]
            .partial_cmp(&scores[a])
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut keep = Vec::new();
    let mut suppressed = vec![false; order.len()];

    for i in 0..order.len() {
        if suppressed[i] {
            continue;
        }
        keep.push(order[i]);

        for j in (i + 1)..order.len() {
            if suppressed[j] {
                continue;
            }
            if overlap(&boxes[order[i]], &boxes[order[j]], mode) > threshold {
                suppressed[j] = true;
            }
        }
    }

    keep
}

/// Compute the overlap ratio between two bounding boxes.
pub fn overlap(a: &BoundingBox, b: &BoundingBox, mode: OverlapMode) -> f32 {
    let inter_area = a.intersection(b);
    let denom = match mode {
        OverlapMode::Union => a.area() + b.area() - inter_area,
        OverlapMode::Min => a.area().min(b.area()),
    };

    if denom > 0.0 {
        inter_area / denom
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_det(x: f32, y: f32, w: f32, h: f32, score: f32) -> Detection {
        Detection {
            score,
            bbox: BoundingBox::new(x, y, w, h),
            landmarks: None,
        }
    }

    #[test]
    fn test_iou_identical() {
        let a = BoundingBox::new(0.0, 0.0, 100.0, 100.0);
        assert!((overlap(&a, &a, OverlapMode::Union) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_iou_no_overlap() {
        let a = BoundingBox::new(0.0, 0.0, 10.0, 10.0);
        let b = BoundingBox::new(20.0, 20.0, 10.0, 10.0);
        assert!(overlap(&a, &b, OverlapMode::Union).abs() < 1e-6);
    }

    #[test]
    fn test_iou_partial() {
        let a = BoundingBox::new(0.0, 0.0, 10.0, 10.0);
        let b = BoundingBox::new(5.0, 0.0, 10.0, 10.0);
        // Overlap: 5x10 = 50, union: 100+100-50 = 150
        let expected = 50.0 / 150.0;
        assert!((overlap(&a, &b, OverlapMode::Union) - expected).abs() < 1e-6);
    }

    #[test]
    fn test_overlap_min_contained() {
        let outer = BoundingBox::new(0.0, 0.0, 100.0, 100.0);
        let inner = BoundingBox::new(10.0, 10.0, 20.0, 20.0);
        assert!((overlap(&outer, &inner, OverlapMode::Min) - 1.0).abs() < 1e-6);
        assert!(overlap(&outer, &inner, OverlapMode::Union) < 0.05);
    }

    #[test]
    fn test_nms_suppresses_overlapping() {
        let detections = vec![
            make_det(5.0, 5.0, 100.0, 100.0, 0.8),
            make_det(0.0, 0.0, 100.0, 100.0, 0.9),
            make_det(200.0, 200.0, 50.0, 50.0, 0.7),
        ];
        let result = nms(detections, 0.4, OverlapMode::Union);
        assert_eq!(result.len(), 2);
        assert!((result[0].score - 0.9).abs() < 1e-6);
        assert!((result[1].score - 0.7).abs() < 1e-6);
    }

    #[test]
    fn test_nms_min_mode_removes_nested() {
        let detections = vec![
            make_det(0.0, 0.0, 100.0, 100.0, 0.9),
            make_det(10.0, 10.0, 20.0, 20.0, 0.8),
        ];
        assert_eq!(nms(detections.clone(), 0.7, OverlapMode::Union).len(), 2);
        assert_eq!(nms(detections, 0.7, OverlapMode::Min).len(), 1);
    }

    #[test]
    fn test_nms_indices_order() {
        let boxes = vec![
            BoundingBox::new(0.0, 0.0, 10.0, 10.0),
            BoundingBox::new(50.0, 50.0, 10.0, 10.0),
            BoundingBox::new(1.0, 1.0, 10.0, 10.0),
        ];
        let scores = vec![0.5, 0.7, 0.9];
        assert_eq!(nms_indices(&boxes, &scores, 0.5, OverlapMode::Union), vec![2, 1]);
    }

    #[test]
    fn test_nms_empty() {
        let result = nms(vec![], 0.4, OverlapMode::Union);
        assert!(result.is_empty());
    }
}
