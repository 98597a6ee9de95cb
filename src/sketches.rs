//! Producer side of the pipeline: new uploads and explicit re-generation.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;
use tracing::{info, instrument, warn};

use crate::blob::{BlobError, BlobStore};
use crate::db::{self, Pool};
use crate::model::{SketchStatus, Slot, ALLOWED_IMAGE_TYPES};
use crate::store::{SketchStore, StoreError};
use crate::worker;

static DATA_URL_PREFIX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^data:([^;,]*);base64,").expect("valid data URL regex"));

const DEFAULT_CONTENT_TYPE: &str = "image/png";

#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("image is empty")]
    EmptyImage,
    #[error("unsupported image content type: {0}")]
    UnsupportedContentType(String),
    #[error("image is not valid base64: {0}")]
    InvalidBase64(#[from] base64::DecodeError),
    #[error(transparent)]
    Blob(#[from] BlobError),
    #[error("database error: {0:#}")]
    Database(#[from] anyhow::Error),
}

#[derive(Debug, Error)]
pub enum RegenerateError {
    #[error("sketch {0} not found")]
    NotFound(i64),
    #[error("sketch {0} has no image attached")]
    NoImage(i64),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Blob(#[from] BlobError),
    #[error("failed to enqueue: {0:#}")]
    Queue(#[from] anyhow::Error),
}

/// A decoded upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageUpload {
    pub bytes: Vec<u8>,
    pub content_type: String,
}

impl ImageUpload {
    pub fn new(bytes: Vec<u8>, content_type: impl Into<String>) -> Self {
        Self {
            bytes,
            content_type: content_type.into(),
        }
    }

    /// Decode `data:<mime>;base64,<payload>` or a bare base64 payload.
    /// A missing or empty mime falls back to `image/png`.
    pub fn from_data_url(data: &str) -> Result<Self, SubmitError> {
        let data = data.trim();
        let (content_type, payload) = match DATA_URL_PREFIX.captures(data) {
            Some(caps) => {
                let mime = caps
                    .get(1)
                    .map(|m| m.as_str().trim())
                    .filter(|m| !m.is_empty())
                    .unwrap_or(DEFAULT_CONTENT_TYPE);
                let end = caps.get(0).map(|m| m.end()).unwrap_or(0);
                (mime.to_ascii_lowercase(), &data[end..])
            }
            None => (DEFAULT_CONTENT_TYPE.to_string(), data),
        };
        if payload.trim().is_empty() {
            return Err(SubmitError::EmptyImage);
        }
        let bytes = STANDARD.decode(payload.trim())?;
        Ok(Self::new(bytes, content_type))
    }

    fn validate(&self) -> Result<(), SubmitError> {
        if self.bytes.is_empty() {
            return Err(SubmitError::EmptyImage);
        }
        if !ALLOWED_IMAGE_TYPES.contains(&self.content_type.as_str()) {
            return Err(SubmitError::UnsupportedContentType(self.content_type.clone()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Submitted {
    pub sketch_id: i64,
    pub job_id: i64,
}

/// Create a sketch in `processing`, attach its image and enqueue the first
/// generation job.
#[instrument(skip_all)]
pub async fn submit_sketch(
    pool: &Pool,
    blobs: &dyn BlobStore,
    title: Option<&str>,
    description: Option<&str>,
    image: ImageUpload,
) -> Result<Submitted, SubmitError> {
    image.validate()?;
    let sketch_id = db::insert_sketch(pool, title, description).await?;

    let blob = match blobs
        .attach(sketch_id, Slot::Image, &image.bytes, "sketch.png", &image.content_type)
        .await
    {
        Ok(blob) => blob,
        Err(err) => {
            warn!(sketch_id, error = %err, "failed to store uploaded image");
            if let Err(e) = db::update_sketch_status(pool, sketch_id, SketchStatus::Failed).await {
                warn!(sketch_id, error = %e, "failed to record failed status");
            }
            return Err(err.into());
        }
    };

    let job_id = db::attach_image_and_enqueue(pool, sketch_id, &blob).await?;
    info!(sketch_id, job_id, bytes = blob.byte_size, "sketch submitted");
    Ok(Submitted { sketch_id, job_id })
}

/// Send an existing sketch back through generation, from any status.
#[instrument(skip(pool, store, blobs))]
pub async fn regenerate(
    pool: &Pool,
    store: &dyn SketchStore,
    blobs: &dyn BlobStore,
    sketch_id: i64,
) -> Result<i64, RegenerateError> {
    let sketch = store
        .find_by_id(sketch_id)
        .await?
        .ok_or(RegenerateError::NotFound(sketch_id))?;
    if !blobs.is_attached(sketch_id, Slot::Image).await? {
        return Err(RegenerateError::NoImage(sketch_id));
    }
    store
        .update_status_only(sketch_id, SketchStatus::Processing)
        .await?;
    let job_id = worker::enqueue(pool, sketch_id).await?;
    info!(job_id, previous = %sketch.status, "re-generation requested");
    Ok(job_id)
}
