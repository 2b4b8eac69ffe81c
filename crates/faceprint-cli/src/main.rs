use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use faceprint_core::{
    Config, DescribeRequest, DetectorKind, DetectorOverrides, FaceApi, ImageSource, ModelFile,
};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "faceprint", version, about = "Describe and match faces in images")]
struct Cli {
    /// Directory holding the ONNX weights (overrides FACEPRINT_MODEL_DIR)
    #[arg(long, global = true)]
    model_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Clone)]
struct DetectArgs {
    /// Face detector: ssd, tiny or mtcnn
    #[arg(short, long, default_value_t = DetectorKind::Ssd)]
    model: DetectorKind,
    /// TOML file with detector overrides (min_confidence, input_size, ...)
    #[arg(long)]
    options: Option<PathBuf>,
    /// Use the tiny 68-point landmark network
    #[arg(long)]
    tiny_landmarks: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Detect faces and print landmarks, attributes and descriptors as JSON
    Describe {
        /// Image path, http(s) URL or data URI
        image: String,
        /// Only describe the best-scoring face
        #[arg(long)]
        single: bool,
        #[command(flatten)]
        detect: DetectArgs,
    },
    /// Add the best face of each image to a gallery under a label
    Enroll {
        /// Identity label
        #[arg(short, long)]
        label: String,
        /// Gallery JSON file (created if missing)
        #[arg(short, long)]
        gallery: PathBuf,
        /// Reference images
        #[arg(required = true)]
        images: Vec<String>,
        #[command(flatten)]
        detect: DetectArgs,
    },
    /// Match the faces of an image against a gallery
    Match {
        /// Gallery JSON file
        #[arg(short, long)]
        gallery: PathBuf,
        /// Query image
        image: String,
        /// Only match the best-scoring face
        #[arg(long)]
        single: bool,
        /// Distance threshold (overrides FACEPRINT_DISTANCE_THRESHOLD)
        #[arg(long)]
        threshold: Option<f32>,
        #[command(flatten)]
        detect: DetectArgs,
    },
    /// Check that every weight file is present
    Models,
}

#[derive(Serialize)]
struct EnrollSummary<'a> {
    label: &'a str,
    added: usize,
    total: usize,
    gallery: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut config = Config::from_env();
    if let Some(dir) = cli.model_dir {
        config = config.with_model_dir(dir);
    }

    match cli.command {
        Commands::Describe { image, single, detect } => {
            let api = open_api(&config)?;
            let request = build_request(&image, single, &detect)?;
            let faces = api
                .compute_descriptor(request)
                .await
                .with_context(|| format!("describing {image}"))?;
            println!("{}", serde_json::to_string_pretty(&faces)?);
        }
        Commands::Enroll { label, gallery, images, detect } => {
            let api = open_api(&config)?;
            let mut descriptors = Vec::with_capacity(images.len());
            for image in &images {
                let face = api
                    .compute_descriptor(build_request(image, true, &detect)?)
                    .await
                    .with_context(|| format!("describing {image}"))?;
                for f in face.into_vec() {
                    tracing::info!(image = %image, score = f.detection.score, "reference face");
                    descriptors.push(f.descriptor);
                }
            }

            let mut entries = faceprint_core::load_gallery(&gallery)
                .with_context(|| format!("loading gallery {}", gallery.display()))?;
            let added = descriptors.len();
            let total = faceprint_core::merge_into_gallery(&mut entries, &label, descriptors)?;
            faceprint_core::save_gallery(&gallery, &entries)
                .with_context(|| format!("saving gallery {}", gallery.display()))?;

            let summary = EnrollSummary {
                label: &label,
                added,
                total,
                gallery: gallery.display().to_string(),
            };
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Commands::Match { gallery, image, single, threshold, detect } => {
            if let Some(t) = threshold {
                config.distance_threshold = t;
            }
            let entries = faceprint_core::load_gallery(&gallery)
                .with_context(|| format!("loading gallery {}", gallery.display()))?;
            if entries.is_empty() {
                tracing::warn!(gallery = %gallery.display(), "gallery is empty, every face will be unknown");
            }

            let api = open_api(&config)?;
            let faces = api
                .compute_descriptor(build_request(&image, single, &detect)?)
                .await
                .with_context(|| format!("describing {image}"))?;
            let matches = api.match_face(entries, Some(&faces))?;
            println!("{}", serde_json::to_string_pretty(&matches)?);
        }
        Commands::Models => {
            let missing = faceprint_core::missing_models(&config);
            for file in ModelFile::ALL {
                let status = if missing.contains(&file) { "missing" } else { "ok" };
                println!("{:<8} {}", status, config.model_path(file).display());
            }
            if !missing.is_empty() {
                bail!(
                    "{} of {} weight files missing from {}",
                    missing.len(),
                    ModelFile::ALL.len(),
                    config.model_dir.display()
                );
            }
        }
    }

    Ok(())
}

/// Load every network (fail fast) and wrap it in the API.
fn open_api(config: &Config) -> Result<FaceApi> {
    let registry = faceprint_core::init(config)
        .with_context(|| format!("loading models from {}", config.model_dir.display()))?;
    // `init` keeps the first registry; thresholds still follow this invocation.
    let api = FaceApi::from_registry(registry)?.with_distance_threshold(config.distance_threshold);
    Ok(api)
}

fn build_request(image: &str, single: bool, detect: &DetectArgs) -> Result<DescribeRequest> {
    let mut request = DescribeRequest::new(ImageSource::parse(image))
        .single(single)
        .tiny_landmarks(detect.tiny_landmarks)
        .model(detect.model);
    if let Some(path) = &detect.options {
        request = request.model_options(load_overrides(path)?);
    }
    Ok(request)
}

fn load_overrides(path: &Path) -> Result<DetectorOverrides> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading detector options {}", path.display()))?;
    toml::from_str(&text).with_context(|| format!("parsing detector options {}", path.display()))
}
