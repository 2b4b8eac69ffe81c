//! Face attribute networks: age and gender, and facial expressions.
//!
//! Both take a 112x112 aligned face.

use crate::config::Config;
use crate::landmarks::LANDMARK_NORMALIZATION;
use crate::models::{output_by_name, ModelError, ModelFile, Network, OutputTensor};
use crate::preprocess::{softmax, to_nchw};
use crate::types::{AgeGender, FaceExpressions, Gender};
use image::imageops::{self, FilterType};
use image::RgbImage;

pub const ATTRIBUTE_INPUT_SIZE: u32 = 112;

/// Resize an aligned crop to the attribute input unless it already matches.
fn attribute_input(face: &RgbImage) -> RgbImage {
    if face.dimensions() == (ATTRIBUTE_INPUT_SIZE, ATTRIBUTE_INPUT_SIZE) {
        face.clone()
    } else {
        imageops::resize(face, ATTRIBUTE_INPUT_SIZE, ATTRIBUTE_INPUT_SIZE, FilterType::Triangle)
    }
}

pub struct AgeGenderNet {
    network: Network,
}

impl AgeGenderNet {
    pub fn load(config: &Config) -> Result<Self, ModelError> {
        Ok(Self {
            network: Network::load(ModelFile::AgeGender, config)?,
        })
    }

    pub fn estimate(&self, face: &RgbImage) -> Result<AgeGender, ModelError> {
        let input = attribute_input(face);
        let outputs = self
            .network
            .run(&to_nchw(std::slice::from_ref(&input), LANDMARK_NORMALIZATION))?;
        let result = decode_age_gender(&outputs)?;
        tracing::debug!(age = result.age, gender = result.gender.as_str(), "age/gender");
        Ok(result)
    }
}

/// The age head emits one value, the gender head two logits `[male, female]`.
fn decode_age_gender(outputs: &[OutputTensor]) -> Result<AgeGender, ModelError> {
    let age = output_by_name(outputs, &["age"], |t| t.data.len() == 1)
        .and_then(|t| t.data.first().copied())
        .ok_or_else(|| ModelError::InferenceFailed("age_gender: no age output".into()))?;
    let logits = output_by_name(outputs, &["gender"], |t| t.data.len() == 2)
        .filter(|t| t.data.len() == 2)
        .ok_or_else(|| ModelError::InferenceFailed("age_gender: no gender output".into()))?;

    let probs = softmax(&logits.data);
    let (gender, gender_probability) = if probs[0] >= probs[1] {
        (Gender::Male, probs[0])
    } else {
        (Gender::Female, probs[1])
    };

    Ok(AgeGender {
        age,
        gender,
        gender_probability,
    })
}

pub struct ExpressionNet {
    network: Network,
}

impl ExpressionNet {
    pub fn load(config: &Config) -> Result<Self, ModelError> {
        Ok(Self {
            network: Network::load(ModelFile::FaceExpression, config)?,
        })
    }

    pub fn recognize(&self, face: &RgbImage) -> Result<FaceExpressions, ModelError> {
        let input = attribute_input(face);
        let outputs = self
            .network
            .run(&to_nchw(std::slice::from_ref(&input), LANDMARK_NORMALIZATION))?;
        decode_expressions(&outputs)
    }
}

fn decode_expressions(outputs: &[OutputTensor]) -> Result<FaceExpressions, ModelError> {
    let logits = outputs
        .iter()
        .find(|t| t.data.len() == 7)
        .ok_or_else(|| ModelError::InferenceFailed("face_expression: expected 7 logits".into()))?;

    let probs = softmax(&logits.data);
    let mut out = [0.0f32; 7];
    out.copy_from_slice(&probs);
    Ok(FaceExpressions::from_probabilities(out))
}
