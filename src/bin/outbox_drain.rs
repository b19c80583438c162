use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tracing::{info, warn};

use agency_portal::{config, db, email, outbox};

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Deliver all due outbox emails and exit"
)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;
    cfg.ensure_dirs()?;

    let database_url = std::env::var("DATABASE_URL")
        .unwrap_or_else(|_| format!("sqlite://{}/portal.db", cfg.app.data_dir));
    let pool = db::init_pool(&database_url).await?;
    db::run_migrations(&pool).await?;

    let sender = email::sender_from_config(&cfg.email)?;
    let max_backoff = cfg.app.max_backoff_seconds as i64;

    let remaining = db::outbox::count_remaining(&pool).await?;
    if remaining == 0 {
        info!("No outbox tasks to process, exiting");
        return Ok(());
    }
    info!(remaining, "Draining outbox");

    let handled = outbox::drain(&pool, sender.as_ref(), max_backoff).await?;
    let left = db::outbox::count_remaining(&pool).await?;
    if left > 0 {
        warn!(handled, left, "Some tasks failed and are waiting for backoff");
    } else {
        info!(handled, "All outbox tasks delivered");
    }
    Ok(())
}
