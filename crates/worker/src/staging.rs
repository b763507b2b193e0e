//! Staging of caller-supplied reference images.
//!
//! ComfyUI's `LoadImage` node reads files from its input directory, so
//! base64 payloads from the job input are decoded and written there
//! before the graph is submitted. Decoding is separate from writing so a
//! malformed payload is rejected before any engine traffic.

use std::collections::HashMap;
use std::path::PathBuf;

use base64::Engine as _;
use podgen_core::job::JobInput;

/// Base filename for staged images. The legacy single image becomes
/// `input_image.<ext>`, named images `input_image_<n>.<ext>`.
pub const STAGED_IMAGE_STEM: &str = "input_image";

#[derive(Debug, thiserror::Error)]
pub enum StagingError {
    #[error("Image {name:?} is not valid base64: {source}")]
    Decode {
        name: String,
        #[source]
        source: base64::DecodeError,
    },

    #[error("Image {name:?} is not a recognized image format")]
    NotAnImage { name: String },

    #[error("Failed to write {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// A decoded image awaiting staging.
#[derive(Debug, Clone)]
pub struct DecodedImage {
    /// Caller's symbolic name; `None` for the legacy `image` field.
    pub name: Option<String>,
    pub filename: String,
    pub bytes: Vec<u8>,
}

/// Result of [`AssetStager::write`].
#[derive(Debug, Clone, Default)]
pub struct StagedAssets {
    /// Filename of the legacy `image`, bound to the profile's image slot.
    pub primary: Option<String>,
    /// Symbolic name -> staged filename.
    pub substitutions: HashMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct AssetStager {
    input_dir: PathBuf,
}

impl AssetStager {
    pub fn new(input_dir: impl Into<PathBuf>) -> Self {
        Self {
            input_dir: input_dir.into(),
        }
    }

    /// Decode and sniff every image in `job`. Performs no I/O.
    ///
    /// Empty or whitespace-only payloads count as absent.
    pub fn decode(&self, job: &JobInput) -> Result<Vec<DecodedImage>, StagingError> {
        let mut decoded = Vec::with_capacity(job.images.len() + 1);

        if let Some(payload) = job.image.as_deref().filter(|p| !is_blank(p)) {
            let (bytes, ext) = decode_image("image", payload)?;
            decoded.push(DecodedImage {
                name: None,
                filename: format!("{STAGED_IMAGE_STEM}.{ext}"),
                bytes,
            });
        }

        for (index, image) in job.images.iter().enumerate() {
            if is_blank(&image.image) {
                tracing::debug!(name = %image.name, "Skipping empty reference image");
                continue;
            }
            let (bytes, ext) = decode_image(&image.name, &image.image)?;
            decoded.push(DecodedImage {
                name: Some(image.name.clone()),
                filename: format!("{STAGED_IMAGE_STEM}_{}.{ext}", index + 1),
                bytes,
            });
        }

        Ok(decoded)
    }

    /// Write decoded images into the input directory, overwriting any
    /// file left by a previous job.
    pub async fn write(&self, images: Vec<DecodedImage>) -> Result<StagedAssets, StagingError> {
        let mut staged = StagedAssets::default();
        if images.is_empty() {
            return Ok(staged);
        }

        tokio::fs::create_dir_all(&self.input_dir)
            .await
            .map_err(|source| StagingError::Io {
                path: self.input_dir.display().to_string(),
                source,
            })?;

        for image in images {
            let path = self.input_dir.join(&image.filename);
            tokio::fs::write(&path, &image.bytes)
                .await
                .map_err(|source| StagingError::Io {
                    path: path.display().to_string(),
                    source,
                })?;
            tracing::info!(
                path = %path.display(),
                bytes = image.bytes.len(),
                "Staged input image",
            );

            match image.name {
                Some(name) => {
                    staged.substitutions.insert(name, image.filename);
                }
                None => staged.primary = Some(image.filename),
            }
        }

        Ok(staged)
    }
}

fn is_blank(payload: &str) -> bool {
    payload.trim().is_empty()
}

/// Strip an optional `data:<mime>;base64,` prefix.
fn strip_data_url(payload: &str) -> &str {
    match payload.strip_prefix("data:") {
        Some(rest) => rest.split_once(',').map_or(rest, |(_, data)| data),
        None => payload,
    }
}

fn decode_image(name: &str, payload: &str) -> Result<(Vec<u8>, &'static str), StagingError> {
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(strip_data_url(payload).trim())
        .map_err(|source| StagingError::Decode {
            name: name.to_string(),
            source,
        })?;

    let format = image::guess_format(&bytes).map_err(|_| StagingError::NotAnImage {
        name: name.to_string(),
    })?;
    let ext = format.extensions_str().first().copied().unwrap_or("png");

    Ok((bytes, ext))
}
