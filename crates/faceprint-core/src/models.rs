//! ONNX Runtime session wrapper shared by every network.
//!
//! Each weight file becomes one [`Network`]. Sessions are created once and
//! never replaced; the mutex only serializes `run`, which ONNX Runtime
//! requires exclusive access for.

use crate::config::Config;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use parking_lot::Mutex;
use std::fmt;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("model file not found: {0} (place the ONNX weights in the model directory)")]
    ModelNotFound(String),
    #[error("failed to load model {path}: {source}")]
    LoadFailed {
        path: String,
        #[source]
        source: ort::Error,
    },
    #[error("malformed model {path}: {reason}")]
    InvalidModel { path: String, reason: String },
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Every weight file the registry loads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModelFile {
    SsdMobilenetV1,
    TinyFaceDetector,
    MtcnnPNet,
    MtcnnRNet,
    MtcnnONet,
    FaceLandmark68,
    FaceLandmark68Tiny,
    FaceRecognition,
    AgeGender,
    FaceExpression,
}

impl ModelFile {
    pub const ALL: [ModelFile; 10] = [
        ModelFile::SsdMobilenetV1,
        ModelFile::TinyFaceDetector,
        ModelFile::MtcnnPNet,
        ModelFile::MtcnnRNet,
        ModelFile::MtcnnONet,
        ModelFile::FaceLandmark68,
        ModelFile::FaceLandmark68Tiny,
        ModelFile::FaceRecognition,
        ModelFile::AgeGender,
        ModelFile::FaceExpression,
    ];

    pub fn file_name(&self) -> &'static str {
        match self {
            ModelFile::SsdMobilenetV1 => "ssd_mobilenetv1.onnx",
            ModelFile::TinyFaceDetector => "tiny_face_detector.onnx",
            ModelFile::MtcnnPNet => "mtcnn_pnet.onnx",
            ModelFile::MtcnnRNet => "mtcnn_rnet.onnx",
            ModelFile::MtcnnONet => "mtcnn_onet.onnx",
            ModelFile::FaceLandmark68 => "face_landmark_68.onnx",
            ModelFile::FaceLandmark68Tiny => "face_landmark_68_tiny.onnx",
            ModelFile::FaceRecognition => "face_recognition.onnx",
            ModelFile::AgeGender => "age_gender.onnx",
            ModelFile::FaceExpression => "face_expression.onnx",
        }
    }
}

impl fmt::Display for ModelFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.file_name())
    }
}

/// One output tensor, copied out of the session.
#[derive(Debug, Clone)]
pub struct OutputTensor {
    pub name: String,
    pub shape: Vec<usize>,
    pub data: Vec<f32>,
}

impl OutputTensor {
    /// Size of dimension `axis`, or 0 if the tensor has fewer axes.
    pub fn dim(&self, axis: usize) -> usize {
        self.shape.get(axis).copied().unwrap_or(0)
    }
}

/// A loaded network.
pub struct Network {
    file: ModelFile,
    session: Mutex<Session>,
    output_names: Vec<String>,
}

impl Network {
    /// Load one weight file from the configured model directory.
    pub fn load(file: ModelFile, config: &Config) -> Result<Self, ModelError> {
        let path = config.model_path(file);
        let path_str = path.display().to_string();
        if !path.exists() {
            return Err(ModelError::ModelNotFound(path_str));
        }

        let session = open_session(&path, config.intra_threads).map_err(|source| {
            ModelError::LoadFailed {
                path: path_str.clone(),
                source,
            }
        })?;

        let output_names: Vec<String> =
            session.outputs().iter().map(|o| o.name().to_string()).collect();

        tracing::info!(
            path = %path_str,
            inputs = ?session.inputs().iter().map(|i| i.name()).collect::<Vec<_>>(),
            outputs = ?output_names,
            "loaded {file}"
        );

        check_outputs(&path_str, &output_names)?;

        Ok(Self {
            file,
            session: Mutex::new(session),
            output_names,
        })
    }

    pub fn file(&self) -> ModelFile {
        self.file
    }

    /// Run the network on one NCHW input and copy every output out.
    pub fn run(&self, input: &Array4<f32>) -> Result<Vec<OutputTensor>, ModelError> {
        let mut session = self.session.lock();
        let outputs = session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut tensors = Vec::with_capacity(self.output_names.len());
        for (idx, name) in self.output_names.iter().enumerate() {
            let (shape, data) = outputs[idx].try_extract_tensor::<f32>().map_err(|e| {
                ModelError::InferenceFailed(format!("{}: output {name}: {e}", self.file))
            })?;
            tensors.push(OutputTensor {
                name: name.clone(),
                shape: shape.iter().map(|&d| d.max(0) as usize).collect(),
                data: data.to_vec(),
            });
        }

        tracing::trace!(
            model = %self.file,
            shapes = ?tensors.iter().map(|t| &t.shape).collect::<Vec<_>>(),
            "inference complete"
        );

        Ok(tensors)
    }
}

fn check_outputs(path: &str, output_names: &[String]) -> Result<(), ModelError> {
    if output_names.is_empty() {
        return Err(ModelError::InvalidModel {
            path: path.to_string(),
            reason: "declares no outputs".into(),
        });
    }
    Ok(())
}

fn open_session(path: &Path, intra_threads: usize) -> Result<Session, ort::Error> {
    let session = Session::builder()?
        .with_intra_threads(intra_threads)?
        .commit_from_file(path)?;
    Ok(session)
}

/// Find an output by exact name, falling back to `fallback` when no output
/// carries that name.
pub fn output_by_name<'a>(
    outputs: &'a [OutputTensor],
    names: &[&str],
    fallback: impl Fn(&OutputTensor) -> bool,
) -> Option<&'a OutputTensor> {
    outputs
        .iter()
        .find(|t| names.iter().any(|n| t.name == *n))
        .or_else(|| outputs.iter().find(|t| fallback(t)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tensor(name: &str, shape: &[usize]) -> OutputTensor {
        OutputTensor {
            name: name.to_string(),
            shape: shape.to_vec(),
            data: vec![0.0; shape.iter().product()],
        }
    }

    #[test]
    fn test_file_names_unique() {
        let mut names: Vec<&str> = ModelFile::ALL.iter().map(|f| f.file_name()).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), ModelFile::ALL.len());
    }

    #[test]
    fn test_load_missing_file() {
        let config = Config::default().with_model_dir("/nonexistent/faceprint-weights");
        match Network::load(ModelFile::AgeGender, &config) {
            Err(ModelError::ModelNotFound(path)) => assert!(path.ends_with("age_gender.onnx")),
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("loading a missing file must fail"),
        }
    }

    #[test]
    fn test_model_without_outputs_is_a_load_error() {
        match check_outputs("weights/age_gender.onnx", &[]) {
            Err(ModelError::InvalidModel { path, reason }) => {
                assert_eq!(path, "weights/age_gender.onnx");
                assert!(reason.contains("no outputs"));
            }
            other => panic!("unexpected result: {other:?}"),
        }
        assert!(check_outputs("weights/age_gender.onnx", &["age".to_string()]).is_ok());
    }

    #[test]
    fn test_output_by_name_prefers_name() {
        let outputs = vec![tensor("gender", &[1, 2]), tensor("age", &[1, 1])];
        let age = output_by_name(&outputs, &["age"], |t| t.data.len() == 2).unwrap();
        assert_eq!(age.name, "age");
    }

    #[test]
    fn test_output_by_name_fallback() {
        let outputs = vec![tensor("212", &[1, 2]), tensor("213", &[1, 1])];
        let age = output_by_name(&outputs, &["age"], |t| t.data.len() == 1).unwrap();
        assert_eq!(age.name, "213");
        assert_eq!(age.dim(1), 1);
        assert_eq!(age.dim(5), 0);
    }
}
