//! Twofold Relay Server
//!
//! A self-hostable helper for Twofold clients. It serves a reference
//! clock for offset estimation and a short-lived rendezvous registry so
//! two devices can find each other for a backup transfer. Backup payloads
//! never pass through the relay.

mod cleanup;
mod config;
mod error;
mod handlers;
mod rate_limit;
mod server;
mod storage;

use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tokio::signal;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "twofold-relay", about = "Twofold time and rendezvous relay")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "relay.toml")]
    config: PathBuf,

    /// Listen address override
    #[arg(short, long)]
    listen: Option<String>,

    /// Database path override
    #[arg(short, long)]
    database: Option<PathBuf>,
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

    if let Some(listen) = cli.listen {
        cfg.listen_addr = listen;
    }
    if let Some(database) = cli.database {
        cfg.storage_path = database;
    }

    tracing::info!("Starting Twofold relay on {}", cfg.listen_addr);

    let storage = storage::RelayStorage::open(&cfg.storage_path)?;
    let active = storage.active_count(chrono::Utc::now().timestamp())?;
    if active > 0 {
        tracing::info!("Resuming with {} active registrations", active);
    }
    let state = server::AppState::new(storage.clone(), &cfg);
    let cleanup_handle = cleanup::spawn_cleanup_task(
        storage,
        state.limiter.clone(),
        Duration::from_secs(cfg.cleanup_interval_secs.max(1)),
    );
    let app = server::build_router(state, &cfg);

    let listener = tokio::net::TcpListener::bind(&cfg.listen_addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async {
        let _ = signal::ctrl_c().await;
        tracing::info!("Received shutdown signal");
    })
    .await?;

    cleanup_handle.abort();
    Ok(())
}
