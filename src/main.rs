use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use sketch_thumbnailer::blob::FsBlobStore;
use sketch_thumbnailer::config;
use sketch_thumbnailer::db;
use sketch_thumbnailer::generator::{purge_scratch_dir, ThumbnailGenerator};
use sketch_thumbnailer::openai::OpenAiClient;
use sketch_thumbnailer::store::SqliteSketchStore;
use sketch_thumbnailer::sweep;
use sketch_thumbnailer::worker::{self, RetryPolicy};

#[derive(Debug, Parser)]
#[command(author, version, about = "Run thumbnail generation workers")]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;
    cfg.ensure_dirs()?;

    let database_url = std::env::var("DATABASE_URL").unwrap_or_else(|_| cfg.app.database_url());
    let pool = db::init_pool(&database_url).await?;
    db::run_migrations(&pool).await?;

    let scratch_dir = cfg.app.scratch_dir();
    let purged = purge_scratch_dir(&scratch_dir).await?;
    if purged > 0 {
        warn!(purged, dir = %scratch_dir.display(), "removed stale scratch files");
    }

    let editor = OpenAiClient::from_config(&cfg.openai)?;
    if !cfg.openai.has_credential() {
        warn!("OPENAI_API_KEY is not set; every generation attempt will fail");
    }
    let generator = Arc::new(ThumbnailGenerator::new(
        Arc::new(SqliteSketchStore::new(pool.clone())),
        Arc::new(FsBlobStore::new(cfg.app.blob_dir())),
        Arc::new(editor),
        scratch_dir,
    ));

    let policy = RetryPolicy::from(&cfg.queue);
    let lease = cfg.job_lease();
    let poll_sleep = Duration::from_millis(cfg.app.poll_interval_ms);
    let mut handles = Vec::with_capacity(cfg.app.workers + 1);

    for _ in 0..cfg.app.workers {
        let pool = pool.clone();
        let generator = generator.clone();
        let worker_id = uuid::Uuid::new_v4().to_string();
        handles.push(tokio::spawn(async move {
            info!(%worker_id, "worker started");
            loop {
                match worker::process_next_job(&pool, &generator, &worker_id, lease, &policy).await {
                    Ok(processed) => {
                        if !processed {
                            tokio::time::sleep(poll_sleep).await;
                        }
                    }
                    Err(err) => {
                        error!(?err, %worker_id, "worker error");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        }));
    }

    let sweep_pool = pool.clone();
    let stuck_after = Duration::from_secs(cfg.app.stuck_after_seconds);
    let sweep_every = Duration::from_secs(cfg.app.sweep_interval_seconds.max(1));
    handles.push(tokio::spawn(async move {
        let mut interval = tokio::time::interval(sweep_every);
        loop {
            interval.tick().await;
            if let Err(err) = sweep::requeue_stuck(&sweep_pool, stuck_after).await {
                error!(?err, "sweep error");
            }
        }
    }));

    info!(workers = cfg.app.workers, "thumbnail pipeline running");
    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    for handle in &handles {
        handle.abort();
    }
    futures::future::join_all(handles).await;
    pool.close().await;
    Ok(())
}
