//! Record store for sketches.
//!
//! Two write paths exist on purpose: `update` validates the merged record
//! before writing, `update_status_only` writes the status column and nothing
//! else so a failure can still be recorded on a record that would not pass
//! validation.

use async_trait::async_trait;
use thiserror::Error;
use tracing::{error, instrument};

use crate::db::{self, Pool};
use crate::model::{Sketch, SketchStatus, SketchUpdate};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sketch {0} not found")]
    NotFound(i64),
    #[error("sketch validation failed: {0}")]
    Validation(String),
    #[error("database error: {0:#}")]
    Database(#[from] anyhow::Error),
}

#[async_trait]
pub trait SketchStore: Send + Sync {
    async fn find_by_id(&self, id: i64) -> Result<Option<Sketch>, StoreError>;

    async fn update(&self, id: i64, changes: SketchUpdate) -> Result<Sketch, StoreError>;

    async fn update_status_only(&self, id: i64, status: SketchStatus) -> Result<(), StoreError>;
}

/// Record `failed` through the narrow path. A secondary error is logged and
/// swallowed so it never replaces the error that led here.
pub async fn mark_failed(store: &dyn SketchStore, id: i64) {
    if let Err(err) = store.update_status_only(id, SketchStatus::Failed).await {
        error!(sketch_id = id, error = %err, "failed to record failed status");
    }
}

#[derive(Debug, Clone)]
pub struct SqliteSketchStore {
    pool: Pool,
}

impl SqliteSketchStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }
}

#[async_trait]
impl SketchStore for SqliteSketchStore {
    #[instrument(skip(self))]
    async fn find_by_id(&self, id: i64) -> Result<Option<Sketch>, StoreError> {
        Ok(db::fetch_sketch(&self.pool, id).await?)
    }

    #[instrument(skip(self, changes), fields(status = %changes.status))]
    async fn update(&self, id: i64, changes: SketchUpdate) -> Result<Sketch, StoreError> {
        let mut sketch = db::fetch_sketch(&self.pool, id)
            .await?
            .ok_or(StoreError::NotFound(id))?;
        sketch.status = changes.status;
        if let Some(thumbnail) = changes.generated_thumbnail {
            sketch.generated_thumbnail = Some(thumbnail);
        }
        sketch.validate().map_err(StoreError::Validation)?;
        if !db::write_sketch(&self.pool, &sketch).await? {
            return Err(StoreError::NotFound(id));
        }
        Ok(sketch)
    }

    #[instrument(skip(self))]
    async fn update_status_only(&self, id: i64, status: SketchStatus) -> Result<(), StoreError> {
        if db::update_sketch_status(&self.pool, id, status).await? {
            Ok(())
        } else {
            Err(StoreError::NotFound(id))
        }
    }
}
