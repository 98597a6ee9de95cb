mod common;

use std::sync::Arc;

use common::{job_state, Fixture, RecordingEditor, ORIGINAL_PNG};
use sketch_thumbnailer::blob::BlobStore;
use sketch_thumbnailer::model::{SketchStatus, Slot};
use sketch_thumbnailer::sketches::{submit_sketch, ImageUpload, SubmitError};

#[tokio::test]
async fn submit_attaches_image_and_enqueues() {
    let fx = Fixture::new(Arc::new(RecordingEditor::with_responses(vec![]))).await;
    let (id, job_id) = fx.submit().await;

    let sketch = fx.sketch(id).await;
    assert_eq!(sketch.status, SketchStatus::Processing);
    assert_eq!(sketch.title.as_deref(), Some("title"));
    let image = sketch.image.unwrap();
    assert_eq!(image.filename, "sketch.png");
    assert_eq!(image.byte_size, ORIGINAL_PNG.len() as i64);
    assert!(sketch.generated_thumbnail.is_none());

    assert_eq!(fx.blobs.download(id, Slot::Image).await.unwrap(), *ORIGINAL_PNG);
    assert_eq!(job_state(&fx.pool, job_id).await, Some((0, false)));
}

#[tokio::test]
async fn data_url_upload_keeps_its_content_type() {
    let fx = Fixture::new(Arc::new(RecordingEditor::with_responses(vec![]))).await;
    let upload = ImageUpload::from_data_url("data:image/jpeg;base64,aGVsbG8=").unwrap();
    let submitted = submit_sketch(&fx.pool, fx.blobs.as_ref(), None, Some("desc"), upload)
        .await
        .unwrap();

    let sketch = fx.sketch(submitted.sketch_id).await;
    assert_eq!(sketch.description.as_deref(), Some("desc"));
    assert_eq!(sketch.image.unwrap().content_type, "image/jpeg");
}

#[tokio::test]
async fn unsupported_upload_creates_nothing() {
    let fx = Fixture::new(Arc::new(RecordingEditor::with_responses(vec![]))).await;
    let err = submit_sketch(
        &fx.pool,
        fx.blobs.as_ref(),
        None,
        None,
        ImageUpload::new(b"GIF89a".to_vec(), "image/gif"),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, SubmitError::UnsupportedContentType(_)));

    let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM sketches")
        .fetch_one(&fx.pool)
        .await
        .unwrap();
    assert_eq!(count, 0);
}
