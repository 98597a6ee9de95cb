use anyhow::{bail, Result};
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, info};

use sketch_thumbnailer::blob::FsBlobStore;
use sketch_thumbnailer::config;
use sketch_thumbnailer::db;
use sketch_thumbnailer::sketches::regenerate;
use sketch_thumbnailer::store::SqliteSketchStore;
use sketch_thumbnailer::sweep;

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Re-trigger thumbnail generation for specific or stuck sketches"
)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Sketch id to regenerate; may be repeated
    #[arg(long = "id")]
    ids: Vec<i64>,

    /// Re-enqueue sketches stuck in `processing` longer than app.stuck_after_seconds
    #[arg(long)]
    stuck: bool,
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
    if args.ids.is_empty() && !args.stuck {
        bail!("nothing to do: pass --id <n> and/or --stuck");
    }
    let cfg = config::load(Some(&args.config))?;
    cfg.ensure_dirs()?;

    let database_url = std::env::var("DATABASE_URL").unwrap_or_else(|_| cfg.app.database_url());
    let pool = db::init_pool(&database_url).await?;
    db::run_migrations(&pool).await?;

    let store = SqliteSketchStore::new(pool.clone());
    let blobs = FsBlobStore::new(cfg.app.blob_dir());
    let mut failures = 0;
    for id in &args.ids {
        match regenerate(&pool, &store, &blobs, *id).await {
            Ok(job_id) => info!(sketch_id = id, job_id, "regeneration queued"),
            Err(err) => {
                failures += 1;
                error!(sketch_id = id, %err, "cannot regenerate sketch");
            }
        }
    }

    if args.stuck {
        let requeued =
            sweep::requeue_stuck(&pool, Duration::from_secs(cfg.app.stuck_after_seconds)).await?;
        info!(requeued, "stuck sketches re-enqueued");
    }

    if failures > 0 {
        bail!("{failures} sketch(es) could not be regenerated");
    }
    Ok(())
}
