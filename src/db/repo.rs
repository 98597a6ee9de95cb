use super::model::{JobCounts, StuckSketch};
use crate::model::{BlobRef, Sketch, SketchStatus, ThumbnailJob};
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Duration, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Sqlite, SqlitePool, Transaction};
use tracing::instrument;

pub type Pool = SqlitePool;

const SKETCH_COLUMNS: &str = "\
    id, title, description, status, \
    image_key, image_filename, image_content_type, image_byte_size, \
    thumbnail_key, thumbnail_filename, thumbnail_content_type, thumbnail_byte_size, \
    created_at, updated_at";

pub async fn init_pool(database_url: &str) -> Result<Pool> {
    let normalized = prepare_sqlite_url(database_url);
    let pool = SqlitePool::connect(&normalized).await?;
    // Enable WAL and stricter durability.
    sqlx::query("PRAGMA journal_mode=WAL;")
        .execute(&pool)
        .await?;
    sqlx::query("PRAGMA synchronous=FULL;")
        .execute(&pool)
        .await?;
    Ok(pool)
}

/// If using a file-backed SQLite URL, expand a leading `~/`, ensure the parent
/// directory exists and ask SQLite to create the file. In-memory URLs pass
/// through untouched.
fn prepare_sqlite_url(url: &str) -> String {
    if !url.starts_with("sqlite:") || url.starts_with("sqlite::memory") {
        return url.to_string();
    }

    let rest = &url["sqlite:".len()..];
    let path_with_query = rest.strip_prefix("//").unwrap_or(rest);
    let (path_part, query_part) = match path_with_query.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (path_with_query, None),
    };
    if path_part.is_empty() {
        return url.to_string();
    }

    let expanded_path = match (path_part.strip_prefix("~/"), std::env::var("HOME")) {
        (Some(rest), Ok(home)) => format!("{}/{}", home.trim_end_matches('/'), rest),
        _ => path_part.to_string(),
    };

    if let Some(parent) = std::path::Path::new(&expanded_path).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }

    let query = match query_part {
        Some(q) if q.contains("mode=") => q.to_string(),
        Some(q) => format!("{}&mode=rwc", q),
        None => "mode=rwc".to_string(),
    };
    format!("sqlite://{}?{}", expanded_path, query)
}

pub async fn run_migrations(pool: &Pool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

fn blob_from_row(row: &SqliteRow, prefix: &str) -> Result<Option<BlobRef>> {
    let key: Option<String> = row.try_get(format!("{prefix}_key").as_str())?;
    let Some(key) = key else {
        return Ok(None);
    };
    Ok(Some(BlobRef {
        key,
        filename: row
            .try_get::<Option<String>, _>(format!("{prefix}_filename").as_str())?
            .unwrap_or_default(),
        content_type: row
            .try_get::<Option<String>, _>(format!("{prefix}_content_type").as_str())?
            .unwrap_or_default(),
        byte_size: row
            .try_get::<Option<i64>, _>(format!("{prefix}_byte_size").as_str())?
            .unwrap_or_default(),
    }))
}

fn sketch_from_row(row: &SqliteRow) -> Result<Sketch> {
    let status: String = row.try_get("status")?;
    let status = SketchStatus::parse_status(&status)
        .ok_or_else(|| anyhow!("unknown sketch status '{}'", status))?;
    Ok(Sketch {
        id: row.try_get("id")?,
        title: row.try_get("title")?,
        description: row.try_get("description")?,
        status,
        image: blob_from_row(row, "image")?,
        generated_thumbnail: blob_from_row(row, "thumbnail")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

/// Insert a new sketch in `processing` with no attachments yet.
#[instrument(skip_all)]
pub async fn insert_sketch(
    pool: &Pool,
    title: Option<&str>,
    description: Option<&str>,
) -> Result<i64> {
    let now = Utc::now();
    let rec = sqlx::query(
        "INSERT INTO sketches (title, description, status, created_at, updated_at) VALUES (?, ?, ?, ?, ?) RETURNING id",
    )
    .bind(title)
    .bind(description)
    .bind(SketchStatus::Processing.as_str())
    .bind(now)
    .bind(now)
    .fetch_one(pool)
    .await?;
    Ok(rec.get("id"))
}

#[instrument(skip_all)]
pub async fn fetch_sketch(pool: &Pool, id: i64) -> Result<Option<Sketch>> {
    let query = format!("SELECT {SKETCH_COLUMNS} FROM sketches WHERE id = ?");
    let row = sqlx::query(&query).bind(id).fetch_optional(pool).await?;
    row.as_ref().map(sketch_from_row).transpose()
}

/// Persist the whole mutable part of a sketch: status and both attachments.
/// Returns `false` when no row matched.
#[instrument(skip_all)]
pub async fn write_sketch(pool: &Pool, sketch: &Sketch) -> Result<bool> {
    let image = sketch.image.as_ref();
    let thumb = sketch.generated_thumbnail.as_ref();
    let res = sqlx::query(
        "UPDATE sketches SET status = ?, \
         image_key = ?, image_filename = ?, image_content_type = ?, image_byte_size = ?, \
         thumbnail_key = ?, thumbnail_filename = ?, thumbnail_content_type = ?, thumbnail_byte_size = ?, \
         updated_at = ? WHERE id = ?",
    )
    .bind(sketch.status.as_str())
    .bind(image.map(|b| b.key.as_str()))
    .bind(image.map(|b| b.filename.as_str()))
    .bind(image.map(|b| b.content_type.as_str()))
    .bind(image.map(|b| b.byte_size))
    .bind(thumb.map(|b| b.key.as_str()))
    .bind(thumb.map(|b| b.filename.as_str()))
    .bind(thumb.map(|b| b.content_type.as_str()))
    .bind(thumb.map(|b| b.byte_size))
    .bind(Utc::now())
    .bind(sketch.id)
    .execute(pool)
    .await?;
    Ok(res.rows_affected() > 0)
}

/// Narrow single-column status write with no validation.
/// Returns `false` when no row matched.
#[instrument(skip_all)]
pub async fn update_sketch_status(pool: &Pool, id: i64, status: SketchStatus) -> Result<bool> {
    let res = sqlx::query("UPDATE sketches SET status = ?, updated_at = ? WHERE id = ?")
        .bind(status.as_str())
        .bind(Utc::now())
        .bind(id)
        .execute(pool)
        .await?;
    Ok(res.rows_affected() > 0)
}

/// Record the original image and enqueue its first generation job in one
/// transaction.
#[instrument(skip_all)]
pub async fn attach_image_and_enqueue(pool: &Pool, sketch_id: i64, image: &BlobRef) -> Result<i64> {
    let mut tx = pool.begin().await?;
    let res = sqlx::query(
        "UPDATE sketches SET image_key = ?, image_filename = ?, image_content_type = ?, image_byte_size = ?, \
         status = ?, updated_at = ? WHERE id = ?",
    )
    .bind(&image.key)
    .bind(&image.filename)
    .bind(&image.content_type)
    .bind(image.byte_size)
    .bind(SketchStatus::Processing.as_str())
    .bind(Utc::now())
    .bind(sketch_id)
    .execute(&mut *tx)
    .await?;
    if res.rows_affected() == 0 {
        return Err(anyhow!("sketch {} not found", sketch_id));
    }
    let job_id = enqueue_job_tx(&mut tx, sketch_id, Utc::now()).await?;
    tx.commit().await?;
    Ok(job_id)
}

/// List sketches stuck in `processing` since before `cutoff` that have no
/// live job left to settle them.
#[instrument(skip_all)]
pub async fn list_stuck_sketches(pool: &Pool, cutoff: DateTime<Utc>) -> Result<Vec<StuckSketch>> {
    let rows = sqlx::query(
        "SELECT s.id, s.updated_at FROM sketches s \
         WHERE s.status = ? AND datetime(s.updated_at) <= datetime(?) \
         AND NOT EXISTS (SELECT 1 FROM thumbnail_jobs j WHERE j.sketch_id = s.id AND j.dead_at IS NULL) \
         ORDER BY s.id ASC",
    )
    .bind(SketchStatus::Processing.as_str())
    .bind(cutoff)
    .fetch_all(pool)
    .await?;
    rows.iter()
        .map(|row| {
            Ok(StuckSketch {
                id: row.try_get("id")?,
                updated_at: row.try_get("updated_at")?,
            })
        })
        .collect()
}

#[instrument(skip_all)]
pub async fn enqueue_job(pool: &Pool, sketch_id: i64, due_at: DateTime<Utc>) -> Result<i64> {
    let mut tx = pool.begin().await?;
    let id = enqueue_job_tx(&mut tx, sketch_id, due_at).await?;
    tx.commit().await?;
    Ok(id)
}

async fn enqueue_job_tx(
    tx: &mut Transaction<'_, Sqlite>,
    sketch_id: i64,
    due_at: DateTime<Utc>,
) -> Result<i64> {
    let rec = sqlx::query(
        "INSERT INTO thumbnail_jobs (sketch_id, attempt, due_at, created_at) VALUES (?, 0, ?, ?) RETURNING id",
    )
    .bind(sketch_id)
    .bind(due_at)
    .bind(Utc::now())
    .fetch_one(&mut **tx)
    .await?;
    Ok(rec.get("id"))
}

/// Atomically claim the oldest due job that is neither dead nor leased by a
/// live worker, counting the delivery as it starts. The returned `attempt`
/// is the number of this delivery, so deliveries that died with their worker
/// still count. The lease expires at `now + lease`.
#[instrument(skip_all)]
pub async fn claim_next_job(
    pool: &Pool,
    worker_id: &str,
    lease: std::time::Duration,
) -> Result<Option<ThumbnailJob>> {
    let now = Utc::now();
    let lease = Duration::from_std(lease).context("job lease out of range")?;
    let row = sqlx::query(
        "UPDATE thumbnail_jobs SET attempt = attempt + 1, locked_by = ?, locked_until = ? \
         WHERE id = ( \
             SELECT id FROM thumbnail_jobs \
             WHERE dead_at IS NULL \
             AND datetime(due_at) <= datetime(?) \
             AND (locked_until IS NULL OR datetime(locked_until) <= datetime(?)) \
             ORDER BY datetime(due_at) ASC, id ASC \
             LIMIT 1 \
         ) \
         RETURNING id, sketch_id, attempt, due_at",
    )
    .bind(worker_id)
    .bind(now + lease)
    .bind(now)
    .bind(now)
    .fetch_optional(pool)
    .await?;
    let Some(row) = row else {
        return Ok(None);
    };
    Ok(Some(ThumbnailJob {
        id: row.try_get("id")?,
        sketch_id: row.try_get("sketch_id")?,
        attempt: row.try_get("attempt")?,
        due_at: row.try_get("due_at")?,
    }))
}

/// Acknowledge a settled job. Only the worker holding the lease may do so;
/// returns `false` when the lease was lost to another worker.
#[instrument(skip_all)]
pub async fn delete_job(pool: &Pool, id: i64, worker_id: &str) -> Result<bool> {
    let res = sqlx::query("DELETE FROM thumbnail_jobs WHERE id = ? AND locked_by = ?")
        .bind(id)
        .bind(worker_id)
        .execute(pool)
        .await?;
    Ok(res.rows_affected() > 0)
}

/// Exponential backoff after the `deliveries`-th failed delivery:
/// `base * 2^(deliveries - 1)`, capped at `max_cap_secs` (no cap when it is
/// not positive).
pub fn backoff_secs(deliveries: i32, base_secs: i64, max_cap_secs: i64) -> i64 {
    let secs = base_secs.max(0) * (1_i64 << (deliveries - 1).clamp(0, 10));
    if max_cap_secs <= 0 {
        secs
    } else {
        secs.min(max_cap_secs)
    }
}

/// Release the lease held by `worker_id` and schedule the next delivery.
/// Returns `None` when the lease was lost to another worker.
#[instrument(skip_all)]
pub async fn backoff_job_with_cap(
    pool: &Pool,
    id: i64,
    worker_id: &str,
    deliveries: i32,
    base_secs: i64,
    max_cap_secs: i64,
    last_error: &str,
) -> Result<Option<DateTime<Utc>>> {
    let due_at =
        Utc::now() + Duration::seconds(backoff_secs(deliveries, base_secs, max_cap_secs));
    let res = sqlx::query(
        "UPDATE thumbnail_jobs SET due_at = ?, last_error = ?, locked_by = NULL, locked_until = NULL \
         WHERE id = ? AND locked_by = ?",
    )
    .bind(due_at)
    .bind(last_error)
    .bind(id)
    .bind(worker_id)
    .execute(pool)
    .await?;
    Ok((res.rows_affected() > 0).then_some(due_at))
}

/// Mark a job dead after its final delivery. Dead jobs are never claimed
/// again but stay visible for inspection. `deliveries` is recorded as the
/// final attempt count. Returns `false` when the lease was lost.
#[instrument(skip_all)]
pub async fn bury_job(
    pool: &Pool,
    id: i64,
    worker_id: &str,
    deliveries: i32,
    last_error: &str,
) -> Result<bool> {
    let res = sqlx::query(
        "UPDATE thumbnail_jobs SET attempt = ?, last_error = ?, dead_at = ?, locked_by = NULL, locked_until = NULL \
         WHERE id = ? AND locked_by = ?",
    )
    .bind(deliveries)
    .bind(last_error)
    .bind(Utc::now())
    .bind(id)
    .bind(worker_id)
    .execute(pool)
    .await?;
    Ok(res.rows_affected() > 0)
}

#[instrument(skip_all)]
pub async fn count_jobs(pool: &Pool) -> Result<JobCounts> {
    let row = sqlx::query(
        "SELECT \
         COALESCE(SUM(CASE WHEN dead_at IS NULL THEN 1 ELSE 0 END), 0) AS pending, \
         COALESCE(SUM(CASE WHEN dead_at IS NOT NULL THEN 1 ELSE 0 END), 0) AS dead \
         FROM thumbnail_jobs",
    )
    .fetch_one(pool)
    .await?;
    Ok(JobCounts {
        pending: row.try_get("pending")?,
        dead: row.try_get("dead")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn setup_pool() -> Pool {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        pool
    }

    fn png(key: &str) -> BlobRef {
        BlobRef {
            key: key.into(),
            filename: "sketch.png".into(),
            content_type: "image/png".into(),
            byte_size: 4,
        }
    }

    #[test]
    fn backoff_grows_and_caps() {
        assert_eq!(backoff_secs(1, 5, 60), 5);
        assert_eq!(backoff_secs(2, 5, 60), 10);
        assert_eq!(backoff_secs(4, 5, 60), 40);
        assert_eq!(backoff_secs(5, 5, 60), 60);
        assert_eq!(backoff_secs(5, 5, 0), 80);
        assert_eq!(backoff_secs(3, 0, 60), 0);
        assert_eq!(backoff_secs(0, 5, 60), 5);
    }

    #[test]
    fn prepare_sqlite_url_leaves_memory_alone() {
        assert_eq!(prepare_sqlite_url("sqlite::memory:"), "sqlite::memory:");
        assert_eq!(
            prepare_sqlite_url("postgres://localhost/x"),
            "postgres://localhost/x"
        );
    }

    #[test]
    fn prepare_sqlite_url_adds_create_mode() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("nested").join("s.db");
        let url = prepare_sqlite_url(&format!("sqlite://{}", db.display()));
        assert_eq!(url, format!("sqlite://{}?mode=rwc", db.display()));
        assert!(dir.path().join("nested").is_dir());
    }

    #[tokio::test]
    async fn sketch_round_trip_and_status_only_update() {
        let pool = setup_pool().await;
        let id = insert_sketch(&pool, Some("title"), None).await.unwrap();
        let sketch = fetch_sketch(&pool, id).await.unwrap().unwrap();
        assert_eq!(sketch.status, SketchStatus::Processing);
        assert!(sketch.image.is_none());
        assert_eq!(sketch.title.as_deref(), Some("title"));

        assert!(update_sketch_status(&pool, id, SketchStatus::Failed)
            .await
            .unwrap());
        let sketch = fetch_sketch(&pool, id).await.unwrap().unwrap();
        assert_eq!(sketch.status, SketchStatus::Failed);

        assert!(!update_sketch_status(&pool, id + 100, SketchStatus::Failed)
            .await
            .unwrap());
        assert!(fetch_sketch(&pool, id + 100).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn attach_image_enqueues_and_claim_leases() {
        let pool = setup_pool().await;
        let id = insert_sketch(&pool, None, None).await.unwrap();
        let job_id = attach_image_and_enqueue(&pool, id, &png("1/image"))
            .await
            .unwrap();

        let sketch = fetch_sketch(&pool, id).await.unwrap().unwrap();
        assert_eq!(sketch.image, Some(png("1/image")));

        let lease = std::time::Duration::from_secs(60);
        let job = claim_next_job(&pool, "w1", lease).await.unwrap().unwrap();
        assert_eq!(job.id, job_id);
        assert_eq!(job.sketch_id, id);
        assert_eq!(job.attempt, 1);

        // Leased: a second worker sees nothing and cannot ack it.
        assert!(claim_next_job(&pool, "w2", lease).await.unwrap().is_none());
        assert!(!delete_job(&pool, job.id, "w2").await.unwrap());

        assert!(delete_job(&pool, job.id, "w1").await.unwrap());
        assert_eq!(count_jobs(&pool).await.unwrap(), JobCounts::default());
    }

    #[tokio::test]
    async fn expired_lease_is_reclaimable() {
        let pool = setup_pool().await;
        let job_id = enqueue_job(&pool, 7, Utc::now()).await.unwrap();
        let first = claim_next_job(&pool, "w1", std::time::Duration::ZERO)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.id, job_id);
        let again = claim_next_job(&pool, "w2", std::time::Duration::from_secs(60))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(again.id, job_id);
        assert_eq!((first.attempt, again.attempt), (1, 2));
    }

    #[tokio::test]
    async fn stale_worker_cannot_settle_reclaimed_job() {
        let pool = setup_pool().await;
        let job_id = enqueue_job(&pool, 7, Utc::now()).await.unwrap();
        claim_next_job(&pool, "w1", std::time::Duration::ZERO)
            .await
            .unwrap()
            .unwrap();
        let live = claim_next_job(&pool, "w2", std::time::Duration::from_secs(60))
            .await
            .unwrap()
            .unwrap();

        let due = backoff_job_with_cap(&pool, job_id, "w1", 1, 5, 60, "late")
            .await
            .unwrap();
        assert!(due.is_none());
        assert!(!bury_job(&pool, job_id, "w1", 1, "late").await.unwrap());
        assert!(!delete_job(&pool, job_id, "w1").await.unwrap());

        let (attempt, locked_by, last_error): (i32, Option<String>, Option<String>) =
            sqlx::query_as("SELECT attempt, locked_by, last_error FROM thumbnail_jobs WHERE id = ?")
                .bind(job_id)
                .fetch_one(&pool)
                .await
                .unwrap();
        assert_eq!(attempt, live.attempt);
        assert_eq!(locked_by.as_deref(), Some("w2"));
        assert_eq!(last_error, None);
        assert!(claim_next_job(&pool, "w3", std::time::Duration::from_secs(60))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn backoff_defers_and_bury_removes_from_rotation() {
        let pool = setup_pool().await;
        let job_id = enqueue_job(&pool, 1, Utc::now()).await.unwrap();
        let lease = std::time::Duration::from_secs(60);
        let job = claim_next_job(&pool, "w1", lease).await.unwrap().unwrap();

        let due = backoff_job_with_cap(&pool, job.id, "w1", job.attempt, 5, 60, "boom")
            .await
            .unwrap()
            .unwrap();
        assert!(due > Utc::now());
        assert!(claim_next_job(&pool, "w1", lease).await.unwrap().is_none());

        let (attempt, last_error): (i32, Option<String>) =
            sqlx::query_as("SELECT attempt, last_error FROM thumbnail_jobs WHERE id = ?")
                .bind(job_id)
                .fetch_one(&pool)
                .await
                .unwrap();
        assert_eq!(attempt, 1);
        assert_eq!(last_error.as_deref(), Some("boom"));

        // Make it due again so a worker holds the lease while burying it.
        sqlx::query("UPDATE thumbnail_jobs SET due_at = ? WHERE id = ?")
            .bind(Utc::now() - Duration::seconds(1))
            .bind(job_id)
            .execute(&pool)
            .await
            .unwrap();
        let job = claim_next_job(&pool, "w1", lease).await.unwrap().unwrap();
        assert_eq!(job.attempt, 2);
        assert!(bury_job(&pool, job_id, "w1", job.attempt, "boom again")
            .await
            .unwrap());
        let counts = count_jobs(&pool).await.unwrap();
        assert_eq!(counts, JobCounts { pending: 0, dead: 1 });
    }

    #[tokio::test]
    async fn stuck_sketches_exclude_those_with_live_jobs() {
        let pool = setup_pool().await;
        let with_job = insert_sketch(&pool, None, None).await.unwrap();
        attach_image_and_enqueue(&pool, with_job, &png("a/image"))
            .await
            .unwrap();
        let orphan = insert_sketch(&pool, None, None).await.unwrap();
        let done = insert_sketch(&pool, None, None).await.unwrap();
        update_sketch_status(&pool, done, SketchStatus::Completed)
            .await
            .unwrap();

        let cutoff = Utc::now() + Duration::seconds(1);
        let stuck = list_stuck_sketches(&pool, cutoff).await.unwrap();
        let ids: Vec<i64> = stuck.iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![orphan]);

        let earlier = Utc::now() - Duration::hours(1);
        assert!(list_stuck_sketches(&pool, earlier).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn sketch_whose_only_job_is_dead_is_stuck() {
        let pool = setup_pool().await;
        let id = insert_sketch(&pool, None, None).await.unwrap();
        let job_id = attach_image_and_enqueue(&pool, id, &png("b/image"))
            .await
            .unwrap();
        let lease = std::time::Duration::from_secs(60);
        let job = claim_next_job(&pool, "w1", lease).await.unwrap().unwrap();
        assert!(bury_job(&pool, job_id, "w1", job.attempt, "gave up")
            .await
            .unwrap());

        let cutoff = Utc::now() + Duration::seconds(1);
        let ids: Vec<i64> = list_stuck_sketches(&pool, cutoff)
            .await
            .unwrap()
            .iter()
            .map(|s| s.id)
            .collect();
        assert_eq!(ids, vec![id]);
    }
}
