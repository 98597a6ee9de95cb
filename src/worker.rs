use std::time::{Duration, Instant};

use anyhow::Result;
use chrono::Utc;
use tracing::{error, info, instrument, warn};

use crate::config;
use crate::db::{self, Pool};
use crate::generator::{FailureKind, GenerateError, GenerateOutcome, ThumbnailGenerator};
use crate::model::Slot;
use crate::store::mark_failed;

/// How one delivery of a thumbnail job ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    /// The sketch does not exist.
    Discarded,
    /// The sketch had no original image and was marked failed.
    Skipped,
    Completed,
    Failed(FailureKind),
}

impl JobOutcome {
    pub fn is_retryable(&self) -> bool {
        matches!(self, JobOutcome::Failed(kind) if kind.is_retryable())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total deliveries, the first one included.
    pub max_attempts: i32,
    pub base_backoff_secs: i64,
    pub max_backoff_secs: i64,
}

impl From<&config::Queue> for RetryPolicy {
    fn from(q: &config::Queue) -> Self {
        Self {
            max_attempts: q.max_attempts,
            base_backoff_secs: q.base_backoff_seconds,
            max_backoff_secs: q.max_backoff_seconds,
        }
    }
}

/// Durably record that `sketch_id` needs a thumbnail. Returns the job id.
#[instrument(skip(pool))]
pub async fn enqueue(pool: &Pool, sketch_id: i64) -> Result<i64> {
    let job_id = db::enqueue_job(pool, sketch_id, Utc::now()).await?;
    info!(job_id, "thumbnail job enqueued");
    Ok(job_id)
}

/// Consumer entrypoint for one delivery of a job.
///
/// An `Err` means the sketch was marked failed (best effort) and the
/// delivery should count against the job's retry budget.
#[instrument(skip(generator))]
pub async fn process(generator: &ThumbnailGenerator, sketch_id: i64) -> Result<JobOutcome, GenerateError> {
    let Some(sketch) = generator.store().find_by_id(sketch_id).await? else {
        error!("sketch not found; discarding job");
        return Ok(JobOutcome::Discarded);
    };

    let started = Instant::now();
    let result = match generator.blobs().is_attached(sketch_id, Slot::Image).await {
        Ok(true) => generator.run(&sketch).await,
        Ok(false) => Ok(GenerateOutcome::Skipped),
        Err(err) => Err(err.into()),
    };

    match result {
        Ok(GenerateOutcome::Completed) => {
            info!(
                elapsed_ms = started.elapsed().as_millis() as u64,
                "thumbnail job completed"
            );
            Ok(JobOutcome::Completed)
        }
        Ok(GenerateOutcome::Failed(kind)) => {
            warn!(kind = kind.as_str(), "thumbnail job failed");
            Ok(JobOutcome::Failed(kind))
        }
        Ok(GenerateOutcome::Skipped) => {
            error!("sketch has no original image");
            mark_failed(generator.store(), sketch_id).await;
            Ok(JobOutcome::Skipped)
        }
        Err(err) => {
            error!(error = %err, "unexpected error during thumbnail job");
            mark_failed(generator.store(), sketch_id).await;
            Err(err)
        }
    }
}

/// Claim and run one due job. Returns `false` when the queue had nothing
/// due.
#[instrument(skip_all, fields(worker = worker_id))]
pub async fn process_next_job(
    pool: &Pool,
    generator: &ThumbnailGenerator,
    worker_id: &str,
    lease: Duration,
    policy: &RetryPolicy,
) -> Result<bool> {
    let Some(job) = db::claim_next_job(pool, worker_id, lease).await? else {
        return Ok(false);
    };

    // Deliveries whose lease lapsed were counted at claim time too.
    if job.attempt > policy.max_attempts {
        let deliveries = job.attempt - 1;
        error!(
            job_id = job.id,
            sketch_id = job.sketch_id,
            deliveries,
            "thumbnail job leases kept expiring; burying"
        );
        let buried =
            db::bury_job(pool, job.id, worker_id, deliveries, "lease expired; delivery cap reached").await?;
        if !buried {
            warn!(job_id = job.id, "lost lease before burying thumbnail job");
        }
        return Ok(true);
    }

    let last_error = match process(generator, job.sketch_id).await {
        Ok(outcome) if !outcome.is_retryable() => {
            if db::delete_job(pool, job.id, worker_id).await? {
                info!(job_id = job.id, sketch_id = job.sketch_id, ?outcome, "thumbnail job settled");
            } else {
                warn!(job_id = job.id, ?outcome, "lost lease before acknowledging thumbnail job");
            }
            return Ok(true);
        }
        Ok(JobOutcome::Failed(kind)) => kind.as_str().to_string(),
        Ok(outcome) => format!("{outcome:?}"),
        Err(err) => err.to_string(),
    };

    let delivery = job.attempt;
    if delivery >= policy.max_attempts {
        error!(
            job_id = job.id,
            sketch_id = job.sketch_id,
            delivery,
            %last_error,
            "thumbnail job exhausted its attempts"
        );
        if !db::bury_job(pool, job.id, worker_id, delivery, &last_error).await? {
            warn!(job_id = job.id, "lost lease before burying thumbnail job");
        }
    } else {
        let due_at = db::backoff_job_with_cap(
            pool,
            job.id,
            worker_id,
            delivery,
            policy.base_backoff_secs,
            policy.max_backoff_secs,
            &last_error,
        )
        .await?;
        match due_at {
            Some(due_at) => warn!(
                job_id = job.id,
                sketch_id = job.sketch_id,
                delivery,
                %last_error,
                %due_at,
                "thumbnail job failed; backoff"
            ),
            None => warn!(job_id = job.id, "lost lease before rescheduling thumbnail job"),
        }
    }
    Ok(true)
}
