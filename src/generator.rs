//! One end-to-end thumbnail generation attempt for a single sketch.
//!
//! Every anticipated failure is classified into a [`FailureKind`] and
//! recorded as `failed` on the sketch. Only store errors the generator
//! cannot settle itself escape as [`GenerateError`].

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use thiserror::Error;
use tokio::fs;
use tracing::{debug, error, info, instrument, warn};

use crate::blob::{BlobError, BlobStore};
use crate::imaging::{self, ImagingError};
use crate::model::{Sketch, SketchStatus, SketchUpdate, Slot, MAX_THUMBNAIL_BYTES};
use crate::openai::{EditError, ImageEditor};
use crate::store::{mark_failed, SketchStore, StoreError};

pub const THUMBNAIL_CONTENT_TYPE: &str = "image/png";

const SCRATCH_PREFIX: &str = "sketch-";

/// Remove scratch files left behind by a process that died mid-attempt.
/// Only call this while no generator is running against `dir`.
pub async fn purge_scratch_dir(dir: &Path) -> std::io::Result<usize> {
    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e),
    };
    let mut removed = 0;
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name();
        if !name.to_string_lossy().starts_with(SCRATCH_PREFIX) {
            continue;
        }
        if entry.file_type().await?.is_file() {
            fs::remove_file(entry.path()).await?;
            removed += 1;
        }
    }
    Ok(removed)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    /// No API credential.
    NotConfigured,
    /// The original image could not be read back from the blob store.
    Download,
    /// Scratch file could not be written.
    Scratch,
    Timeout,
    Transport,
    /// 5xx, 408 or 429.
    Unavailable,
    /// Any other non-200 status.
    Rejected,
    Malformed,
    EmptyPayload,
    /// The original is not a PNG or JPEG that decodes.
    UnreadableImage,
    /// The generated thumbnail could not be stored.
    Attach,
    /// The generated thumbnail failed record validation.
    Invalid,
}

impl FailureKind {
    /// Whether another delivery of the same job may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            FailureKind::Download
                | FailureKind::Scratch
                | FailureKind::Timeout
                | FailureKind::Transport
                | FailureKind::Unavailable
                | FailureKind::Malformed
                | FailureKind::Attach
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::NotConfigured => "not_configured",
            FailureKind::Download => "download",
            FailureKind::Scratch => "scratch",
            FailureKind::Timeout => "timeout",
            FailureKind::Transport => "transport",
            FailureKind::Unavailable => "unavailable",
            FailureKind::Rejected => "rejected",
            FailureKind::Malformed => "malformed",
            FailureKind::EmptyPayload => "empty_payload",
            FailureKind::UnreadableImage => "unreadable_image",
            FailureKind::Attach => "attach",
            FailureKind::Invalid => "invalid",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerateOutcome {
    /// No original image; nothing was touched.
    Skipped,
    Completed,
    Failed(FailureKind),
}

#[derive(Debug, Error)]
pub enum GenerateError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Blob(#[from] BlobError),
}

#[derive(Debug, Error)]
enum AttemptError {
    #[error("failed to download original image: {0}")]
    Download(#[source] BlobError),
    #[error("scratch file error: {0}")]
    Scratch(#[source] std::io::Error),
    #[error("original image could not be converted: {0}")]
    Convert(#[source] ImagingError),
    #[error(transparent)]
    Edit(#[from] EditError),
}

impl AttemptError {
    fn kind(&self) -> FailureKind {
        match self {
            AttemptError::Download(_) => FailureKind::Download,
            AttemptError::Scratch(_) => FailureKind::Scratch,
            AttemptError::Convert(_) => FailureKind::UnreadableImage,
            AttemptError::Edit(err) => classify_edit_error(err),
        }
    }
}

pub fn classify_edit_error(err: &EditError) -> FailureKind {
    match err {
        EditError::NotConfigured => FailureKind::NotConfigured,
        EditError::ReadImage { .. } => FailureKind::Scratch,
        EditError::Timeout(_) => FailureKind::Timeout,
        EditError::Transport(_) => FailureKind::Transport,
        EditError::Status { status, .. } => match status {
            408 | 429 | 500..=599 => FailureKind::Unavailable,
            _ => FailureKind::Rejected,
        },
        EditError::Malformed(_) => FailureKind::Malformed,
        EditError::EmptyPayload => FailureKind::EmptyPayload,
    }
}

pub struct ThumbnailGenerator {
    store: Arc<dyn SketchStore>,
    blobs: Arc<dyn BlobStore>,
    editor: Arc<dyn ImageEditor>,
    scratch_dir: PathBuf,
}

impl ThumbnailGenerator {
    pub fn new(
        store: Arc<dyn SketchStore>,
        blobs: Arc<dyn BlobStore>,
        editor: Arc<dyn ImageEditor>,
        scratch_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            store,
            blobs,
            editor,
            scratch_dir: scratch_dir.into(),
        }
    }

    pub fn store(&self) -> &dyn SketchStore {
        self.store.as_ref()
    }

    pub fn blobs(&self) -> &dyn BlobStore {
        self.blobs.as_ref()
    }

    pub fn scratch_dir(&self) -> &Path {
        &self.scratch_dir
    }

    /// `true` only when a new thumbnail was attached and the sketch is
    /// `completed`.
    pub async fn generate(&self, sketch: &Sketch) -> Result<bool, GenerateError> {
        Ok(self.run(sketch).await? == GenerateOutcome::Completed)
    }

    #[instrument(skip_all, fields(sketch_id = sketch.id))]
    pub async fn run(&self, sketch: &Sketch) -> Result<GenerateOutcome, GenerateError> {
        let id = sketch.id;
        if !self.blobs.is_attached(id, Slot::Image).await? {
            debug!("no original image attached; skipping");
            return Ok(GenerateOutcome::Skipped);
        }
        if !self.editor.is_configured() {
            error!("image API credential is not configured");
            mark_failed(self.store(), id).await;
            return Ok(GenerateOutcome::Failed(FailureKind::NotConfigured));
        }

        match self
            .store
            .update(id, SketchUpdate::status(SketchStatus::Processing))
            .await
        {
            Ok(_) => {}
            Err(StoreError::Validation(msg)) => {
                warn!(%msg, "sketch failed validation before generation");
                mark_failed(self.store(), id).await;
                return Ok(GenerateOutcome::Failed(FailureKind::Invalid));
            }
            Err(err) => return Err(err.into()),
        }

        let started = Instant::now();
        let png = match self.attempt(id).await {
            Ok(png) => png,
            Err(err) => {
                let kind = err.kind();
                warn!(kind = kind.as_str(), error = %err, "thumbnail generation failed");
                mark_failed(self.store(), id).await;
                return Ok(GenerateOutcome::Failed(kind));
            }
        };
        let outcome = self.complete(id, &png).await?;
        if outcome == GenerateOutcome::Completed {
            info!(
                bytes = png.len(),
                elapsed_ms = started.elapsed().as_millis() as u64,
                "thumbnail generated"
            );
        }
        Ok(outcome)
    }

    /// Download the original, normalize it to PNG into a scratch file and
    /// hand that to the editor.
    /// The scratch file is removed when `scratch` drops, on every path out.
    async fn attempt(&self, sketch_id: i64) -> Result<Vec<u8>, AttemptError> {
        let original = self
            .blobs
            .download(sketch_id, Slot::Image)
            .await
            .map_err(AttemptError::Download)?;
        let png = tokio::task::spawn_blocking(move || imaging::to_api_png(&original))
            .await
            .map_err(|e| AttemptError::Scratch(std::io::Error::other(e)))?
            .map_err(AttemptError::Convert)?;
        fs::create_dir_all(&self.scratch_dir)
            .await
            .map_err(AttemptError::Scratch)?;
        let scratch = tempfile::Builder::new()
            .prefix(&format!("{SCRATCH_PREFIX}{sketch_id}-"))
            .suffix(".png")
            .tempfile_in(&self.scratch_dir)
            .map_err(AttemptError::Scratch)?;
        fs::write(scratch.path(), &png)
            .await
            .map_err(AttemptError::Scratch)?;
        drop(png);

        let edited = self.editor.edit_image(scratch.path()).await?;
        Ok(edited)
    }

    async fn complete(&self, sketch_id: i64, png: &[u8]) -> Result<GenerateOutcome, GenerateError> {
        if png.len() as i64 > MAX_THUMBNAIL_BYTES {
            warn!(bytes = png.len(), "generated thumbnail is too large");
            mark_failed(self.store(), sketch_id).await;
            return Ok(GenerateOutcome::Failed(FailureKind::Invalid));
        }

        let filename = format!("thumbnail_{sketch_id}.png");
        let blob = match self
            .blobs
            .attach(
                sketch_id,
                Slot::GeneratedThumbnail,
                png,
                &filename,
                THUMBNAIL_CONTENT_TYPE,
            )
            .await
        {
            Ok(blob) => blob,
            Err(err) => {
                warn!(error = %err, "failed to store generated thumbnail");
                mark_failed(self.store(), sketch_id).await;
                return Ok(GenerateOutcome::Failed(FailureKind::Attach));
            }
        };

        match self
            .store
            .update(sketch_id, SketchUpdate::completed(blob))
            .await
        {
            Ok(_) => Ok(GenerateOutcome::Completed),
            Err(StoreError::Validation(msg)) => {
                warn!(%msg, "generated thumbnail rejected");
                mark_failed(self.store(), sketch_id).await;
                Ok(GenerateOutcome::Failed(FailureKind::Invalid))
            }
            Err(err) => {
                error!(error = %err, "failed to record completed thumbnail");
                mark_failed(self.store(), sketch_id).await;
                Err(err.into())
            }
        }
    }
}
