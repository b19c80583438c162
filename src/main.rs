use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use agency_portal::api::{self, AppState};
use agency_portal::billing::WooCommerceClient;
use agency_portal::{config, db, email, outbox};

#[derive(Debug, Parser)]
#[command(author, version, about)]
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

    let billing = Arc::new(WooCommerceClient::from_config(&cfg.woocommerce)?);
    let sender = email::sender_from_config(&cfg.email)?;
    let bind = cfg.app.bind.clone();
    let poll_interval = Duration::from_millis(cfg.app.poll_interval_ms);
    let max_backoff = cfg.app.max_backoff_seconds as i64;
    let sweep_interval = Duration::from_secs(cfg.cache.sweep_interval_seconds);

    let state = AppState::new(pool.clone(), cfg, billing)?;

    // Email outbox worker
    tokio::spawn(outbox::run_worker(pool, sender, poll_interval, max_backoff));

    // Cache and rate-limit entries expire lazily; sweep the leftovers.
    let cache = state.cache.clone();
    let limiter = state.limiter.clone();
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(sweep_interval);
        loop {
            tick.tick().await;
            let cached = cache.purge_expired();
            let limited = limiter.purge_expired();
            debug!(cached, limited, "swept expired entries");
        }
    });

    let app = api::router(state);
    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("failed to bind {bind}"))?;
    info!(%bind, "agency portal listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    info!("server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(?err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}
