use anyhow::{bail, Result};
use clap::Parser;
use std::path::PathBuf;
use tracing::info;

use agency_portal::auth::{generate_token, hash_token};
use agency_portal::config;
use agency_portal::db;
use agency_portal::db::users::{self, NewUser};
use agency_portal::model::Role;
use agency_portal::sanitize::normalize_email;
use agency_portal::validation::is_valid_email;

#[derive(Debug, Parser)]
#[command(author, version, about = "Create an admin user and print its API token")]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Admin email address
    #[arg(long)]
    email: String,

    /// Display name
    #[arg(long)]
    name: String,
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

    let email = normalize_email(&args.email);
    if !is_valid_email(&email) {
        bail!("invalid email address: {}", args.email);
    }
    let name = args.name.trim();
    if name.is_empty() {
        bail!("name must not be empty");
    }

    let database_url = std::env::var("DATABASE_URL")
        .unwrap_or_else(|_| format!("sqlite://{}/portal.db", cfg.app.data_dir));
    let pool = db::init_pool(&database_url).await?;
    db::run_migrations(&pool).await?;

    if users::find_by_email(&pool, &email).await?.is_some() {
        bail!("a user with email {email} already exists");
    }

    let token = generate_token();
    let user = users::insert(
        &pool,
        &NewUser {
            email: &email,
            full_name: name,
            role: Role::Admin,
            company_id: None,
            api_token_hash: &hash_token(&token),
        },
    )
    .await?;
    db::audit::record(
        &pool,
        None,
        "user.admin_created",
        "user",
        Some(user.id),
        serde_json::json!({ "email": user.email, "source": "cli" }),
    )
    .await;
    info!(user_id = user.id, "admin created");

    // Shown once; only the hash is stored.
    println!("{token}");
    Ok(())
}
