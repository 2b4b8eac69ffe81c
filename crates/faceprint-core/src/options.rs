//! Detector selection and typed per-backend options.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

// --- Defaults for every tunable ---
pub const DEFAULT_MIN_CONFIDENCE: f32 = 0.5;
pub const DEFAULT_MAX_RESULTS: usize = 100;
pub const DEFAULT_INPUT_SIZE: u32 = 416;
pub const DEFAULT_SCORE_THRESHOLD: f32 = 0.5;
pub const DEFAULT_MIN_FACE_SIZE: u32 = 100;
pub const DEFAULT_SCALE_FACTOR: f32 = 0.8;
pub const DEFAULT_MTCNN_SCORE_THRESHOLDS: [f32; 3] = [0.6, 0.7, 0.7];
pub const DEFAULT_MTCNN_MAX_NUM_SCALES: usize = 10;

/// Largest Tiny Face Detector input side; bounds the letterbox canvas.
pub const MAX_INPUT_SIZE: u32 = 1024;
/// Smallest MTCNN face size: one P-Net cell, so the pyramid never upscales.
pub const MIN_FACE_SIZE: u32 = 12;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum OptionsError {
    #[error("unknown detector model {0:?}, expected one of \"ssd\", \"tiny\", \"mtcnn\"")]
    UnknownModel(String),
    #[error("invalid {field} = {value}: {reason}")]
    InvalidValue {
        field: &'static str,
        value: String,
        reason: &'static str,
    },
}

/// Face detector backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DetectorKind {
    /// SSD MobileNet v1: accuracy-tuned.
    #[default]
    Ssd,
    /// Tiny Face Detector: fast single pass.
    Tiny,
    /// Multi-task cascaded CNN.
    Mtcnn,
}

impl DetectorKind {
    /// Listing order used in "try another model" hints.
    pub const ALL: [DetectorKind; 3] = [DetectorKind::Tiny, DetectorKind::Ssd, DetectorKind::Mtcnn];

    pub fn as_str(&self) -> &'static str {
        match self {
            DetectorKind::Ssd => "ssd",
            DetectorKind::Tiny => "tiny",
            DetectorKind::Mtcnn => "mtcnn",
        }
    }

    /// Resolve a free-form selector, falling back to SSD for anything unrecognised.
    ///
    /// Use [`str::parse`] instead when an unknown name should be an error.
    pub fn from_selector(selector: &str) -> DetectorKind {
        match selector.parse() {
            Ok(kind) => kind,
            Err(_) => {
                tracing::warn!(
                    selector,
                    fallback = DetectorKind::default().as_str(),
                    "unrecognised detector model, using default"
                );
                DetectorKind::default()
            }
        }
    }

    /// Every backend other than `self`, in [`DetectorKind::ALL`] order.
    pub fn alternatives(&self) -> Vec<DetectorKind> {
        DetectorKind::ALL.iter().copied().filter(|k| k != self).collect()
    }

    /// Backends whose name differs from `selector` exactly. An unrecognised
    /// selector leaves all of them.
    pub fn alternatives_to_selector(selector: &str) -> Vec<DetectorKind> {
        DetectorKind::ALL.iter().copied().filter(|k| k.as_str() != selector).collect()
    }
}

impl FromStr for DetectorKind {
    type Err = OptionsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ssd" => Ok(DetectorKind::Ssd),
            "tiny" => Ok(DetectorKind::Tiny),
            "mtcnn" => Ok(DetectorKind::Mtcnn),
            _ => Err(OptionsError::UnknownModel(s.to_string())),
        }
    }
}

impl fmt::Display for DetectorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Optional named parameter overrides, merged over the defaults of
/// whichever backend is selected.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DetectorOverrides {
    pub min_confidence: Option<f32>,
    pub max_results: Option<usize>,
    pub input_size: Option<u32>,
    pub score_threshold: Option<f32>,
    pub min_face_size: Option<u32>,
    pub scale_factor: Option<f32>,
    pub score_thresholds: Option<[f32; 3]>,
    pub max_num_scales: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SsdOptions {
    pub min_confidence: f32,
    pub max_results: usize,
}

impl Default for SsdOptions {
    fn default() -> Self {
        Self {
            min_confidence: DEFAULT_MIN_CONFIDENCE,
            max_results: DEFAULT_MAX_RESULTS,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TinyOptions {
    /// Square network input side; a multiple of 32.
    pub input_size: u32,
    pub score_threshold: f32,
}

impl Default for TinyOptions {
    fn default() -> Self {
        Self {
            input_size: DEFAULT_INPUT_SIZE,
            score_threshold: DEFAULT_SCORE_THRESHOLD,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MtcnnOptions {
    /// Smallest face side, in pixels, the pyramid is built to find.
    pub min_face_size: u32,
    /// Ratio between successive pyramid levels.
    pub scale_factor: f32,
    /// P-Net, R-Net, O-Net acceptance thresholds.
    pub score_thresholds: [f32; 3],
    pub max_num_scales: usize,
}

impl Default for MtcnnOptions {
    fn default() -> Self {
        Self {
            min_face_size: DEFAULT_MIN_FACE_SIZE,
            scale_factor: DEFAULT_SCALE_FACTOR,
            score_thresholds: DEFAULT_MTCNN_SCORE_THRESHOLDS,
            max_num_scales: DEFAULT_MTCNN_MAX_NUM_SCALES,
        }
    }
}

/// Fully populated options for one detector backend.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "model", rename_all = "lowercase")]
pub enum DetectorOptions {
    Ssd(SsdOptions),
    Tiny(TinyOptions),
    Mtcnn(MtcnnOptions),
}

impl DetectorOptions {
    /// Merge `overrides` over the defaults for `kind` and validate the result.
    pub fn build(
        kind: DetectorKind,
        overrides: Option<&DetectorOverrides>,
    ) -> Result<DetectorOptions, OptionsError> {
        let o = overrides.cloned().unwrap_or_default();
        log_ignored_overrides(kind, &o);

        let options = match kind {
            DetectorKind::Ssd => {
                let d = SsdOptions::default();
                DetectorOptions::Ssd(SsdOptions {
                    min_confidence: o.min_confidence.unwrap_or(d.min_confidence),
                    max_results: o.max_results.unwrap_or(d.max_results),
                })
            }
            DetectorKind::Tiny => {
                let d = TinyOptions::default();
                DetectorOptions::Tiny(TinyOptions {
                    input_size: o.input_size.unwrap_or(d.input_size),
                    score_threshold: o.score_threshold.unwrap_or(d.score_threshold),
                })
            }
            DetectorKind::Mtcnn => {
                let d = MtcnnOptions::default();
                DetectorOptions::Mtcnn(MtcnnOptions {
                    min_face_size: o.min_face_size.unwrap_or(d.min_face_size),
                    scale_factor: o.scale_factor.unwrap_or(d.scale_factor),
                    score_thresholds: o.score_thresholds.unwrap_or(d.score_thresholds),
                    max_num_scales: o.max_num_scales.unwrap_or(d.max_num_scales),
                })
            }
        };

        options.validate()?;
        Ok(options)
    }

    pub fn kind(&self) -> DetectorKind {
        match self {
            DetectorOptions::Ssd(_) => DetectorKind::Ssd,
            DetectorOptions::Tiny(_) => DetectorKind::Tiny,
            DetectorOptions::Mtcnn(_) => DetectorKind::Mtcnn,
        }
    }

    /// Upper bound on returned faces, if the backend has one.
    pub fn max_results(&self) -> Option<usize> {
        match self {
            DetectorOptions::Ssd(o) => Some(o.max_results),
            _ => None,
        }
    }

    pub fn validate(&self) -> Result<(), OptionsError> {
        match self {
            DetectorOptions::Ssd(o) => {
                check_probability("min_confidence", o.min_confidence)?;
                if o.max_results == 0 {
                    return Err(invalid("max_results", o.max_results, "must be at least 1"));
                }
            }
            DetectorOptions::Tiny(o) => {
                if o.input_size == 0 || o.input_size % 32 != 0 {
                    return Err(invalid(
                        "input_size",
                        o.input_size,
                        "must be a positive multiple of 32",
                    ));
                }
                if o.input_size > MAX_INPUT_SIZE {
                    return Err(invalid("input_size", o.input_size, "must be at most 1024"));
                }
                check_probability("score_threshold", o.score_threshold)?;
            }
            DetectorOptions::Mtcnn(o) => {
                if o.min_face_size < MIN_FACE_SIZE {
                    return Err(invalid("min_face_size", o.min_face_size, "must be at least 12"));
                }
                if !(o.scale_factor > 0.0 && o.scale_factor < 1.0) {
                    return Err(invalid(
                        "scale_factor",
                        o.scale_factor,
                        "must lie strictly between 0 and 1",
                    ));
                }
                for t in o.score_thresholds {
                    check_probability("score_thresholds", t)?;
                }
                if o.max_num_scales == 0 {
                    return Err(invalid("max_num_scales", o.max_num_scales, "must be at least 1"));
                }
            }
        }
        Ok(())
    }
}

impl Default for DetectorOptions {
    fn default() -> Self {
        DetectorOptions::Ssd(SsdOptions::default())
    }
}

fn check_probability(field: &'static str, value: f32) -> Result<(), OptionsError> {
    if value > 0.0 && value <= 1.0 {
        Ok(())
    } else {
        Err(invalid(field, value, "must lie in (0, 1]"))
    }
}

fn invalid(field: &'static str, value: impl fmt::Display, reason: &'static str) -> OptionsError {
    OptionsError::InvalidValue {
        field,
        value: value.to_string(),
        reason,
    }
}

fn log_ignored_overrides(kind: DetectorKind, o: &DetectorOverrides) {
    let unused: &[(&str, bool)] = match kind {
        DetectorKind::Ssd => &[
            ("input_size", o.input_size.is_some()),
            ("score_threshold", o.score_threshold.is_some()),
            ("min_face_size", o.min_face_size.is_some()),
            ("scale_factor", o.scale_factor.is_some()),
            ("score_thresholds", o.score_thresholds.is_some()),
            ("max_num_scales", o.max_num_scales.is_some()),
        ],
        DetectorKind::Tiny => &[
            ("min_confidence", o.min_confidence.is_some()),
            ("max_results", o.max_results.is_some()),
            ("min_face_size", o.min_face_size.is_some()),
            ("scale_factor", o.scale_factor.is_some()),
            ("score_thresholds", o.score_thresholds.is_some()),
            ("max_num_scales", o.max_num_scales.is_some()),
        ],
        DetectorKind::Mtcnn => &[
            ("min_confidence", o.min_confidence.is_some()),
            ("max_results", o.max_results.is_some()),
            ("input_size", o.input_size.is_some()),
            ("score_threshold", o.score_threshold.is_some()),
        ],
    };
    for (field, set) in unused {
        if *set {
            tracing::debug!(model = kind.as_str(), field, "override not used by this detector");
        }
    }
}
