//! Face recognition network.
//!
//! Turns a 150x150 aligned face into a 128-dimensional descriptor. Descriptors
//! of the same person lie close together in Euclidean space.

use crate::config::Config;
use crate::landmarks::LANDMARK_NORMALIZATION;
use crate::models::{ModelError, ModelFile, Network, OutputTensor};
use crate::preprocess::{to_nchw, Normalization};
use crate::types::Descriptor;
use image::imageops::{self, FilterType};
use image::RgbImage;

pub const RECOGNITION_INPUT_SIZE: u32 = 150;
pub const DESCRIPTOR_DIM: usize = 128;
pub const RECOGNITION_MODEL_VERSION: &str = "face_recognition_128";

const RECOGNITION_NORMALIZATION: Normalization =
    Normalization::new(LANDMARK_NORMALIZATION.mean, 1.0 / 256.0);

pub struct FaceRecognizer {
    network: Network,
}

impl FaceRecognizer {
    pub fn load(config: &Config) -> Result<Self, ModelError> {
        Ok(Self {
            network: Network::load(ModelFile::FaceRecognition, config)?,
        })
    }

    /// Compute the descriptor of an aligned face crop.
    pub fn describe(&self, aligned_face: &RgbImage) -> Result<Descriptor, ModelError> {
        let input = if aligned_face.dimensions() == (RECOGNITION_INPUT_SIZE, RECOGNITION_INPUT_SIZE) {
            aligned_face.clone()
        } else {
            imageops::resize(
                aligned_face,
                RECOGNITION_INPUT_SIZE,
                RECOGNITION_INPUT_SIZE,
                FilterType::Triangle,
            )
        };

        let outputs = self
            .network
            .run(&to_nchw(std::slice::from_ref(&input), RECOGNITION_NORMALIZATION))?;
        decode_descriptor(&outputs)
    }
}

fn decode_descriptor(outputs: &[OutputTensor]) -> Result<Descriptor, ModelError> {
    let raw = outputs
        .first()
        .ok_or_else(|| ModelError::InferenceFailed("face_recognition: no output".into()))?;

    if raw.data.len() != DESCRIPTOR_DIM {
        return Err(ModelError::InferenceFailed(format!(
            "expected {DESCRIPTOR_DIM}-dim descriptor, got {}",
            raw.data.len()
        )));
    }

    if raw.data.iter().any(|v| !v.is_finite()) {
        return Err(ModelError::InferenceFailed(
            "face_recognition: descriptor contains non-finite values".into(),
        ));
    }

    Ok(Descriptor {
        values: raw.data.clone(),
        model_version: Some(RECOGNITION_MODEL_VERSION.to_string()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn output(data: Vec<f32>) -> Vec<OutputTensor> {
        vec![OutputTensor {
            name: "descriptor".into(),
            shape: vec![1, data.len()],
            data,
        }]
    }

    #[test]
    fn test_decode_descriptor() {
        let d = decode_descriptor(&output(vec![0.01; DESCRIPTOR_DIM])).unwrap();
        assert_eq!(d.len(), DESCRIPTOR_DIM);
        assert_eq!(d.model_version.as_deref(), Some(RECOGNITION_MODEL_VERSION));
    }

    #[test]
    fn test_decode_rejects_wrong_length() {
        let err = decode_descriptor(&output(vec![0.0; 512])).unwrap_err();
        assert!(err.to_string().contains("128-dim"), "{err}");
    }

    #[test]
    fn test_decode_rejects_nan() {
        let mut values = vec![0.0; DESCRIPTOR_DIM];
        values[7] = f32::NAN;
        assert!(decode_descriptor(&output(values)).is_err());
    }

    #[test]
    fn test_normalization_constants() {
        assert_eq!(RECOGNITION_NORMALIZATION.mean, LANDMARK_NORMALIZATION.mean);
        assert!((RECOGNITION_NORMALIZATION.apply(0, 255) - (255.0 - 122.782) / 256.0).abs() < 1e-6);
    }
}
