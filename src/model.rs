//! Domain types for sketches, their attached blobs and queued thumbnail jobs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Content types accepted for both the uploaded image and the generated thumbnail.
pub const ALLOWED_IMAGE_TYPES: [&str; 3] = ["image/png", "image/jpg", "image/jpeg"];

/// Upper bound for a generated thumbnail.
pub const MAX_THUMBNAIL_BYTES: i64 = 5 * 1024 * 1024;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SketchStatus {
    Processing,
    Completed,
    Failed,
}

impl SketchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SketchStatus::Processing => "processing",
            SketchStatus::Completed => "completed",
            SketchStatus::Failed => "failed",
        }
    }

    pub fn parse_status(s: &str) -> Option<Self> {
        match s {
            "processing" => Some(SketchStatus::Processing),
            "completed" => Some(SketchStatus::Completed),
            "failed" => Some(SketchStatus::Failed),
            _ => None,
        }
    }
}

impl fmt::Display for SketchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Attachment slot on a sketch.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Slot {
    Image,
    GeneratedThumbnail,
}

impl Slot {
    pub fn as_str(&self) -> &'static str {
        match self {
            Slot::Image => "image",
            Slot::GeneratedThumbnail => "generated_thumbnail",
        }
    }
}

/// Metadata of an attached blob, as recorded on the sketch row.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BlobRef {
    pub key: String,
    pub filename: String,
    pub content_type: String,
    pub byte_size: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sketch {
    pub id: i64,
    pub title: Option<String>,
    pub description: Option<String>,
    pub status: SketchStatus,
    pub image: Option<BlobRef>,
    pub generated_thumbnail: Option<BlobRef>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Sketch {
    /// Record-level validation applied by the validated update path.
    pub fn validate(&self) -> Result<(), String> {
        let Some(image) = &self.image else {
            return Err("image must be attached".into());
        };
        if !ALLOWED_IMAGE_TYPES.contains(&image.content_type.as_str()) {
            return Err("image must be a PNG, JPG, or JPEG file".into());
        }
        match &self.generated_thumbnail {
            Some(thumb) => {
                if !ALLOWED_IMAGE_TYPES.contains(&thumb.content_type.as_str()) {
                    return Err("generated_thumbnail must be a PNG, JPG, or JPEG file".into());
                }
                if thumb.byte_size > MAX_THUMBNAIL_BYTES {
                    return Err("generated_thumbnail must be smaller than 5MB".into());
                }
            }
            None if self.status == SketchStatus::Completed => {
                return Err("completed sketch must have a generated_thumbnail".into());
            }
            None => {}
        }
        Ok(())
    }
}

/// Fields written by the validated update. `generated_thumbnail` of `None`
/// keeps whatever is already recorded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SketchUpdate {
    pub status: SketchStatus,
    pub generated_thumbnail: Option<BlobRef>,
}

impl SketchUpdate {
    pub fn status(status: SketchStatus) -> Self {
        Self {
            status,
            generated_thumbnail: None,
        }
    }

    pub fn completed(thumbnail: BlobRef) -> Self {
        Self {
            status: SketchStatus::Completed,
            generated_thumbnail: Some(thumbnail),
        }
    }
}

/// A claimed row of the thumbnail job queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThumbnailJob {
    pub id: i64,
    pub sketch_id: i64,
    /// Deliveries that already failed before this one.
    pub attempt: i32,
    pub due_at: DateTime<Utc>,
}
