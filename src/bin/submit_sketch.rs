use anyhow::{bail, Context, Result};
use clap::Parser;
use std::path::PathBuf;
use tracing::info;

use sketch_thumbnailer::blob::FsBlobStore;
use sketch_thumbnailer::config;
use sketch_thumbnailer::db;
use sketch_thumbnailer::sketches::{submit_sketch, ImageUpload};

#[derive(Debug, Parser)]
#[command(author, version, about = "Submit a sketch image for thumbnail generation")]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// PNG or JPEG file to upload
    #[arg(long)]
    image: Option<PathBuf>,

    /// File holding a `data:image/png;base64,...` URL instead of raw bytes
    #[arg(long, conflicts_with = "image")]
    data_url: Option<PathBuf>,

    #[arg(long)]
    title: Option<String>,

    #[arg(long)]
    description: Option<String>,
}

fn content_type_for(path: &std::path::Path) -> &'static str {
    match path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .as_deref()
    {
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("png") => "image/png",
        _ => "application/octet-stream",
    }
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

    let upload = match (&args.image, &args.data_url) {
        (Some(path), _) => {
            let bytes = tokio::fs::read(path)
                .await
                .with_context(|| format!("failed to read {}", path.display()))?;
            ImageUpload::new(bytes, content_type_for(path))
        }
        (None, Some(path)) => {
            let text = tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("failed to read {}", path.display()))?;
            ImageUpload::from_data_url(&text)?
        }
        (None, None) => bail!("one of --image or --data-url is required"),
    };

    let database_url = std::env::var("DATABASE_URL").unwrap_or_else(|_| cfg.app.database_url());
    let pool = db::init_pool(&database_url).await?;
    db::run_migrations(&pool).await?;

    let blobs = FsBlobStore::new(cfg.app.blob_dir());
    let submitted = submit_sketch(
        &pool,
        &blobs,
        args.title.as_deref(),
        args.description.as_deref(),
        upload,
    )
    .await?;
    info!(
        sketch_id = submitted.sketch_id,
        job_id = submitted.job_id,
        "sketch queued for thumbnail generation"
    );
    println!("{}", submitted.sketch_id);
    Ok(())
}
