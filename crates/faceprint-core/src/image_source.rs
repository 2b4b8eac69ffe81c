//! Image inputs: local files, `http(s)://` URLs, `data:` URIs and raw bytes.

use base64::Engine;
use image::RgbImage;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to fetch image: {0}")]
    Http(#[from] reqwest::Error),
    #[error("fetching {url} returned HTTP {status}")]
    HttpStatus { url: String, status: u16 },
    #[error("invalid data URI: {0}")]
    InvalidDataUri(String),
    #[error("invalid base64 payload: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("failed to decode image: {0}")]
    Image(#[from] image::ImageError),
}

/// Where the picture comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageSource {
    Path(PathBuf),
    Url(String),
    /// A `data:[<mime>];base64,<payload>` URI.
    DataUri(String),
    Bytes(Vec<u8>),
}

impl ImageSource {
    /// Classify a user-supplied reference by its scheme.
    pub fn parse(reference: &str) -> Self {
        let lower = reference.trim_start().to_ascii_lowercase();
        if lower.starts_with("http://") || lower.starts_with("https://") {
            ImageSource::Url(reference.trim().to_string())
        } else if lower.starts_with("data:") {
            ImageSource::DataUri(reference.trim().to_string())
        } else {
            ImageSource::Path(PathBuf::from(reference))
        }
    }

    /// Short description for logs; never includes inline payloads.
    pub fn describe(&self) -> String {
        match self {
            ImageSource::Path(p) => p.display().to_string(),
            ImageSource::Url(u) => u.clone(),
            ImageSource::DataUri(d) => format!("data URI ({} chars)", d.len()),
            ImageSource::Bytes(b) => format!("{} bytes", b.len()),
        }
    }
}

impl From<&str> for ImageSource {
    fn from(reference: &str) -> Self {
        ImageSource::parse(reference)
    }
}

impl From<PathBuf> for ImageSource {
    fn from(path: PathBuf) -> Self {
        ImageSource::Path(path)
    }
}

impl From<Vec<u8>> for ImageSource {
    fn from(bytes: Vec<u8>) -> Self {
        ImageSource::Bytes(bytes)
    }
}

/// Fetches the encoded bytes behind an [`ImageSource`].
#[derive(Debug, Clone)]
pub struct ImageLoader {
    client: reqwest::Client,
}

impl ImageLoader {
    pub fn new(http_timeout: Duration) -> Result<Self, DecodeError> {
        let client = reqwest::Client::builder().timeout(http_timeout).build()?;
        Ok(Self { client })
    }

    pub async fn fetch(&self, source: &ImageSource) -> Result<Vec<u8>, DecodeError> {
        match source {
            ImageSource::Path(path) => {
                tokio::fs::read(path).await.map_err(|source| DecodeError::Io {
                    path: path.display().to_string(),
                    source,
                })
            }
            ImageSource::Url(url) => {
                let response = self.client.get(url).send().await?;
                let status = response.status();
                if !status.is_success() {
                    return Err(DecodeError::HttpStatus {
                        url: url.clone(),
                        status: status.as_u16(),
                    });
                }
                Ok(response.bytes().await?.to_vec())
            }
            ImageSource::DataUri(uri) => decode_data_uri(uri),
            ImageSource::Bytes(bytes) => Ok(bytes.clone()),
        }
    }
}

/// Extract the payload of a base64 `data:` URI.
pub fn decode_data_uri(uri: &str) -> Result<Vec<u8>, DecodeError> {
    let rest = uri
        .get(..5)
        .filter(|scheme| scheme.eq_ignore_ascii_case("data:"))
        .map(|_| &uri[5..])
        .ok_or_else(|| DecodeError::InvalidDataUri("missing data: scheme".into()))?;
    let (meta, payload) = rest
        .split_once(',')
        .ok_or_else(|| DecodeError::InvalidDataUri("missing ',' separator".into()))?;
    if !meta.to_ascii_lowercase().ends_with(";base64") {
        return Err(DecodeError::InvalidDataUri(
            "only base64-encoded data URIs are supported".into(),
        ));
    }

    let payload: String = payload.chars().filter(|c| !c.is_ascii_whitespace()).collect();
    Ok(base64::engine::general_purpose::STANDARD.decode(payload)?)
}

/// Decode encoded image bytes (any format `image` understands) to RGB.
pub fn decode_image(bytes: &[u8]) -> Result<RgbImage, DecodeError> {
    let image = image::load_from_memory(bytes)?;
    Ok(image.to_rgb8())
}
