//! Reconciliation for sketches left in `processing` with nothing queued to
//! settle them (crashed worker, buried job, lost enqueue).

use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::{info, instrument, warn};

use crate::db::{self, Pool};

#[instrument(skip(pool))]
pub async fn requeue_stuck(pool: &Pool, stuck_after: Duration) -> Result<usize> {
    let stuck_after = chrono::Duration::from_std(stuck_after).context("stuck_after out of range")?;
    let cutoff = Utc::now() - stuck_after;
    let stuck = db::list_stuck_sketches(pool, cutoff).await?;
    for sketch in &stuck {
        let job_id = db::enqueue_job(pool, sketch.id, Utc::now()).await?;
        warn!(
            sketch_id = sketch.id,
            job_id,
            stuck_since = %sketch.updated_at,
            "re-enqueued stuck sketch"
        );
    }
    if !stuck.is_empty() {
        let counts = db::count_jobs(pool).await?;
        info!(
            requeued = stuck.len(),
            pending = counts.pending,
            dead = counts.dead,
            "sweep finished"
        );
    }
    Ok(stuck.len())
}
