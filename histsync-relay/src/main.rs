//! histsync relay server
//!
//! Keeps a user's shell history in sync across devices. The relay stores one
//! copy of every encrypted entry per device and only ever sees ciphertext.

mod config;
mod engine;
mod error;
mod handlers;
mod server;
mod storage;
mod sweeper;
mod version;

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "histsync-relay", about = "Encrypted shell history sync relay")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "histsync.toml")]
    config: PathBuf,

    /// Listen address override
    #[arg(short, long)]
    listen: Option<String>,

    /// Database path override
    #[arg(short, long)]
    database: Option<PathBuf>,

    /// Deployment environment: production, development or test
    #[arg(short, long)]
    environment: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let cli = Cli::parse();

    let mut cfg = if cli.config.exists() {
        config::RelayConfig::load(&cli.config)?
    } else {
        tracing::info!("No config file found, using defaults");
        config::RelayConfig::default()
    };
    cfg.apply_env();

    if let Some(listen) = cli.listen {
        cfg.listen_addr = listen;
    }
    if let Some(database) = cli.database {
        cfg.storage_path = database;
    }
    if let Some(environment) = cli.environment {
        cfg.environment = config::Environment::parse(&environment)
            .ok_or_else(|| anyhow::anyhow!("Unknown environment: {}", environment))?;
    }

    tracing::info!(
        environment = ?cfg.environment,
        max_users = ?cfg.max_users,
        "Starting histsync relay on {}",
        cfg.listen_addr
    );

    let cfg = Arc::new(cfg);
    let storage = storage::RelayStorage::open(&cfg.storage_path)?;
    let sweeper = sweeper::spawn_sweeper(storage.clone(), cfg.clone());
    let app = server::build_router(engine::SyncEngine::new(storage, cfg.clone()));

    let listener = tokio::net::TcpListener::bind(&cfg.listen_addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    sweeper.abort();
    tracing::info!("Relay stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
