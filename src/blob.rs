//! Attachment storage for sketch images.
//!
//! Blobs are addressed by `(sketch_id, slot)`. Attaching to an occupied slot
//! replaces the previous content, so a slot never holds more than one blob.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;
use tracing::debug;

use crate::model::{BlobRef, Slot};

#[derive(Debug, Error)]
pub enum BlobError {
    #[error("no blob attached to sketch {sketch_id} slot {slot}")]
    NotAttached { sketch_id: i64, slot: &'static str },
    #[error("blob I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("blob metadata error: {0}")]
    Metadata(#[from] serde_json::Error),
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn attach(
        &self,
        sketch_id: i64,
        slot: Slot,
        bytes: &[u8],
        filename: &str,
        content_type: &str,
    ) -> Result<BlobRef, BlobError>;

    async fn download(&self, sketch_id: i64, slot: Slot) -> Result<Vec<u8>, BlobError>;

    async fn is_attached(&self, sketch_id: i64, slot: Slot) -> Result<bool, BlobError>;
}

/// Sidecar written next to each blob.
#[derive(Debug, Serialize, Deserialize)]
struct BlobMeta {
    filename: String,
    content_type: String,
    byte_size: i64,
}

/// Filesystem-backed store laid out as `{root}/{sketch_id}/{slot}` with a
/// `{slot}.json` metadata sidecar.
#[derive(Debug, Clone)]
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn dir(&self, sketch_id: i64) -> PathBuf {
        self.root.join(sketch_id.to_string())
    }

    fn data_path(&self, sketch_id: i64, slot: Slot) -> PathBuf {
        self.dir(sketch_id).join(slot.as_str())
    }

    fn meta_path(&self, sketch_id: i64, slot: Slot) -> PathBuf {
        self.dir(sketch_id).join(format!("{}.json", slot.as_str()))
    }

    /// Read back the metadata recorded at attach time.
    pub async fn blob_ref(&self, sketch_id: i64, slot: Slot) -> Result<BlobRef, BlobError> {
        let raw = match fs::read(self.meta_path(sketch_id, slot)).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(BlobError::NotAttached {
                    sketch_id,
                    slot: slot.as_str(),
                })
            }
            Err(e) => return Err(e.into()),
        };
        let meta: BlobMeta = serde_json::from_slice(&raw)?;
        Ok(BlobRef {
            key: blob_key(sketch_id, slot),
            filename: meta.filename,
            content_type: meta.content_type,
            byte_size: meta.byte_size,
        })
    }
}

pub fn blob_key(sketch_id: i64, slot: Slot) -> String {
    format!("{}/{}", sketch_id, slot.as_str())
}

/// Write to a sibling `.partial` file, then rename over the target.
async fn replace_file(path: &Path, bytes: &[u8]) -> Result<(), std::io::Error> {
    let mut partial = path.as_os_str().to_owned();
    partial.push(".partial");
    let partial = PathBuf::from(partial);
    fs::write(&partial, bytes).await?;
    fs::rename(&partial, path).await
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn attach(
        &self,
        sketch_id: i64,
        slot: Slot,
        bytes: &[u8],
        filename: &str,
        content_type: &str,
    ) -> Result<BlobRef, BlobError> {
        fs::create_dir_all(self.dir(sketch_id)).await?;
        let meta = BlobMeta {
            filename: filename.to_string(),
            content_type: content_type.to_string(),
            byte_size: bytes.len() as i64,
        };
        replace_file(&self.data_path(sketch_id, slot), bytes).await?;
        replace_file(&self.meta_path(sketch_id, slot), &serde_json::to_vec(&meta)?).await?;
        debug!(sketch_id, slot = slot.as_str(), bytes = bytes.len(), "attached blob");
        Ok(BlobRef {
            key: blob_key(sketch_id, slot),
            filename: meta.filename,
            content_type: meta.content_type,
            byte_size: meta.byte_size,
        })
    }

    async fn download(&self, sketch_id: i64, slot: Slot) -> Result<Vec<u8>, BlobError> {
        match fs::read(self.data_path(sketch_id, slot)).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(BlobError::NotAttached {
                sketch_id,
                slot: slot.as_str(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    async fn is_attached(&self, sketch_id: i64, slot: Slot) -> Result<bool, BlobError> {
        Ok(fs::try_exists(self.data_path(sketch_id, slot)).await?)
    }
}
