#![allow(dead_code)]

use anyhow::anyhow;
use async_trait::async_trait;
use image::{DynamicImage, ImageFormat, RgbImage};
use once_cell::sync::Lazy;
use std::collections::VecDeque;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tempfile::TempDir;
use tokio::sync::Mutex;

use sketch_thumbnailer::blob::FsBlobStore;
use sketch_thumbnailer::config;
use sketch_thumbnailer::db::{self, Pool};
use sketch_thumbnailer::generator::ThumbnailGenerator;
use sketch_thumbnailer::model::{Sketch, SketchStatus, SketchUpdate};
use sketch_thumbnailer::openai::{EditError, ImageEditor};
use sketch_thumbnailer::sketches::{submit_sketch, ImageUpload};
use sketch_thumbnailer::store::{SketchStore, SqliteSketchStore, StoreError};

pub static ORIGINAL_PNG: Lazy<Vec<u8>> = Lazy::new(|| encoded_image(ImageFormat::Png, 8, 8));

/// A small gradient encoded as `format`.
pub fn encoded_image(format: ImageFormat, width: u32, height: u32) -> Vec<u8> {
    let img = RgbImage::from_fn(width, height, |x, y| image::Rgb([(x * 16) as u8, (y * 16) as u8, 200]));
    let mut out = Cursor::new(Vec::new());
    DynamicImage::ImageRgb8(img).write_to(&mut out, format).unwrap();
    out.into_inner()
}

pub async fn setup_pool() -> Pool {
    let pool = sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    pool
}

pub fn openai_config(base_url: &str, api_key: Option<&str>) -> config::OpenAi {
    config::OpenAi {
        api_key: api_key.map(str::to_string),
        base_url: base_url.to_string(),
        model: "gpt-image-1".into(),
        prompt: "make it a thumbnail".into(),
        connect_timeout_seconds: 5,
        read_timeout_seconds: 5,
    }
}

/// Editor double: pops queued responses (default `Ok(b"thumbnail")`) and
/// records what the scratch file held at call time.
#[derive(Clone)]
pub struct RecordingEditor {
    configured: bool,
    responses: Arc<Mutex<VecDeque<Result<Vec<u8>, EditError>>>>,
    calls: Arc<Mutex<Vec<(PathBuf, Vec<u8>)>>>,
}

impl RecordingEditor {
    pub fn with_responses(responses: Vec<Result<Vec<u8>, EditError>>) -> Self {
        Self {
            configured: true,
            responses: Arc::new(Mutex::new(VecDeque::from(responses))),
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn unconfigured() -> Self {
        Self {
            configured: false,
            ..Self::with_responses(Vec::new())
        }
    }

    pub async fn calls(&self) -> Vec<(PathBuf, Vec<u8>)> {
        self.calls.lock().await.clone()
    }
}

#[async_trait]
impl ImageEditor for RecordingEditor {
    fn is_configured(&self) -> bool {
        self.configured
    }

    async fn edit_image(&self, image_path: &Path) -> Result<Vec<u8>, EditError> {
        let seen = tokio::fs::read(image_path).await.unwrap_or_default();
        self.calls
            .lock()
            .await
            .push((image_path.to_path_buf(), seen));
        self.responses
            .lock()
            .await
            .pop_front()
            .unwrap_or_else(|| Ok(b"thumbnail".to_vec()))
    }
}

/// Record store that can be told to fail the `completed` write as if the
/// database went away.
pub struct FaultyStore {
    inner: SqliteSketchStore,
    fail_completed: AtomicBool,
}

impl FaultyStore {
    pub fn new(pool: Pool) -> Self {
        Self {
            inner: SqliteSketchStore::new(pool),
            fail_completed: AtomicBool::new(false),
        }
    }

    pub fn fail_completed(&self, on: bool) {
        self.fail_completed.store(on, Ordering::SeqCst);
    }
}

#[async_trait]
impl SketchStore for FaultyStore {
    async fn find_by_id(&self, id: i64) -> Result<Option<Sketch>, StoreError> {
        self.inner.find_by_id(id).await
    }

    async fn update(&self, id: i64, changes: SketchUpdate) -> Result<Sketch, StoreError> {
        if changes.status == SketchStatus::Completed && self.fail_completed.load(Ordering::SeqCst) {
            return Err(StoreError::Database(anyhow!("database is locked")));
        }
        self.inner.update(id, changes).await
    }

    async fn update_status_only(&self, id: i64, status: SketchStatus) -> Result<(), StoreError> {
        self.inner.update_status_only(id, status).await
    }
}

pub struct Fixture {
    pub pool: Pool,
    pub store: Arc<FaultyStore>,
    pub blobs: Arc<FsBlobStore>,
    pub generator: ThumbnailGenerator,
    pub scratch_dir: PathBuf,
    _dir: TempDir,
}

impl Fixture {
    pub async fn new(editor: Arc<dyn ImageEditor>) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let pool = setup_pool().await;
        let store = Arc::new(FaultyStore::new(pool.clone()));
        let blobs = Arc::new(FsBlobStore::new(dir.path().join("blobs")));
        let scratch_dir = dir.path().join("tmp");
        let generator =
            ThumbnailGenerator::new(store.clone(), blobs.clone(), editor, scratch_dir.clone());
        Self {
            pool,
            store,
            blobs,
            generator,
            scratch_dir,
            _dir: dir,
        }
    }

    /// Submit a sketch with an attached original. Returns `(sketch_id, job_id)`.
    pub async fn submit(&self) -> (i64, i64) {
        self.submit_upload(ImageUpload::new(ORIGINAL_PNG.to_vec(), "image/png"))
            .await
    }

    pub async fn submit_upload(&self, upload: ImageUpload) -> (i64, i64) {
        let submitted = submit_sketch(
            &self.pool,
            self.blobs.as_ref(),
            Some("title"),
            None,
            upload,
        )
        .await
        .unwrap();
        (submitted.sketch_id, submitted.job_id)
    }

    pub async fn sketch(&self, id: i64) -> Sketch {
        db::fetch_sketch(&self.pool, id).await.unwrap().unwrap()
    }

    pub fn scratch_files(&self) -> Vec<String> {
        match std::fs::read_dir(&self.scratch_dir) {
            Ok(entries) => entries
                .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
                .collect(),
            Err(_) => Vec::new(),
        }
    }
}

/// `(attempt, dead)` of a job row.
pub async fn job_state(pool: &Pool, job_id: i64) -> Option<(i32, bool)> {
    sqlx::query_as::<_, (i32, bool)>(
        "SELECT attempt, dead_at IS NOT NULL FROM thumbnail_jobs WHERE id = ?",
    )
    .bind(job_id)
    .fetch_optional(pool)
    .await
    .unwrap()
}
