//! JSON gallery files: an array of labelled descriptor sets.

use crate::matcher::{LabeledDescriptors, MatchError};
use crate::types::Descriptor;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum GalleryError {
    #[error("gallery I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed gallery JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid gallery entry: {0}")]
    Invalid(#[from] MatchError),
}

/// Read a gallery. A missing file is an empty gallery.
pub fn load_gallery(path: &Path) -> Result<Vec<LabeledDescriptors>, GalleryError> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!(path = %path.display(), "gallery file absent, starting empty");
            return Ok(Vec::new());
        }
        Err(source) => {
            return Err(GalleryError::Io {
                path: path.display().to_string(),
                source,
            })
        }
    };

    let gallery: Vec<LabeledDescriptors> = serde_json::from_str(&raw)?;
    for entry in &gallery {
        entry.validate()?;
    }
    tracing::debug!(path = %path.display(), identities = gallery.len(), "gallery loaded");
    Ok(gallery)
}

/// Write `gallery` as pretty-printed JSON, replacing the file atomically.
pub fn save_gallery(path: &Path, gallery: &[LabeledDescriptors]) -> Result<(), GalleryError> {
    let io_err = |source| GalleryError::Io {
        path: path.display().to_string(),
        source,
    };

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(io_err)?;
    }

    let json = serde_json::to_string_pretty(gallery)?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, json).map_err(io_err)?;
    if let Err(source) = std::fs::rename(&tmp, path) {
        let _ = std::fs::remove_file(&tmp);
        return Err(io_err(source));
    }

    tracing::info!(path = %path.display(), identities = gallery.len(), "gallery saved");
    Ok(())
}

/// Append `descriptors` to the entry named `label`, creating it if needed.
/// Returns the number of descriptors now stored for that label.
pub fn merge_into_gallery(
    gallery: &mut Vec<LabeledDescriptors>,
    label: &str,
    descriptors: Vec<Descriptor>,
) -> Result<usize, GalleryError> {
    let incoming = crate::matcher::label_faces(label, descriptors)?;

    // Every descriptor in the gallery must stay mutually comparable.
    if let Some(existing) = gallery.iter().flat_map(|e| e.descriptors.first()).next() {
        let combined = LabeledDescriptors {
            label: incoming.label.clone(),
            descriptors: std::iter::once(existing.clone())
                .chain(incoming.descriptors.iter().cloned())
                .collect(),
        };
        combined.validate()?;
    }

    match gallery.iter_mut().find(|e| e.label == incoming.label) {
        Some(entry) => {
            entry.descriptors.extend(incoming.descriptors);
            Ok(entry.descriptors.len())
        }
        None => {
            let count = incoming.descriptors.len();
            gallery.push(incoming);
            Ok(count)
        }
    }
}
