mod board;
mod config;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use config::ClientConfig;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use twofold_core::backup::{encode_for_qr, parse_config_json, write_config_file};
use twofold_core::clock::{spawn_refresh_loop, HttpTimeAuthority};
use twofold_core::scheduler::spawn_cycle_loop;
use twofold_core::secrets::SecretUpdate;
use twofold_core::transfer::RendezvousNetwork;
use twofold_core::{
    decode, import_data, remaining, Clock, ClockSync, FormatError, SecretManager, SecretStore,
    SqliteStore, SystemClock, TransferSession, TwofoldError,
};

/// Twofold - TOTP authenticator with clock correction and peer transfer
#[derive(Parser)]
#[command(name = "twofold")]
#[command(about = "TOTP authenticator with clock correction and peer transfer", long_about = None)]
struct Cli {
    /// Path to the configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Secret store database override
    #[arg(long, global = true)]
    database: Option<PathBuf>,

    /// Relay URL override
    #[arg(long, global = true)]
    relay: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Add a secret
    Add {
        /// Base32 secret (spaces allowed)
        #[arg(long, required_unless_present = "uri", conflicts_with = "uri")]
        secret: Option<String>,

        /// Display title
        #[arg(long, required_unless_present = "uri")]
        title: Option<String>,

        /// Account or other description
        #[arg(long, default_value = "")]
        description: String,

        /// otpauth://totp/... URI
        #[arg(long)]
        uri: Option<String>,
    },

    /// List stored secrets
    List,

    /// Print the current codes once
    Codes,

    /// Show a live code board until Ctrl+C
    Watch,

    /// Edit a secret
    Edit {
        id: String,

        #[arg(long)]
        title: Option<String>,

        #[arg(long)]
        description: Option<String>,

        #[arg(long)]
        secret: Option<String>,
    },

    /// Delete a secret
    Delete { id: String },

    /// Move the given ids to the front, in this order
    Reorder {
        #[arg(required = true)]
        ids: Vec<String>,
    },

    /// Print the backup payload, or write a JSON config file into a directory
    Export {
        #[arg(long, value_name = "DIR")]
        json: Option<PathBuf>,
    },

    /// Import a backup payload or a JSON config file
    Import {
        #[arg(required_unless_present = "json", conflicts_with = "json")]
        payload: Option<String>,

        #[arg(long, value_name = "FILE")]
        json: Option<PathBuf>,
    },

    /// Offer all secrets to a peer and wait for it to connect
    Send,

    /// Receive secrets from a peer's rtc:// URI
    Receive { uri: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let mut cfg = ClientConfig::resolve(cli.config.as_deref())?;
    if let Some(database) = cli.database {
        cfg.database_path = database;
    }
    if let Some(relay) = cli.relay {
        cfg.relay_url = Some(relay);
    }

    let store: Arc<dyn SecretStore> = Arc::new(
        SqliteStore::open(&cfg.database_path)
            .with_context(|| format!("Failed to open {}", cfg.database_path.display()))?,
    );
    let manager = Arc::new(SecretManager::new(store.clone()));

    match cli.command {
        Commands::Add {
            secret,
            title,
            description,
            uri,
        } => {
            let record = match (uri, secret, title) {
                (Some(uri), _, _) => manager.add_from_uri(&uri).await?,
                (None, Some(secret), Some(title)) => {
                    manager.add(&secret, &title, &description).await?
                }
                _ => bail!("Either --uri or --secret with --title is required"),
            };
            println!("Added {} ({})", record.title, record.id);
        }
        Commands::List => {
            for record in manager.list().await? {
                if record.description.is_empty() {
                    println!("{}  {}", record.id, record.title);
                } else {
                    println!("{}  {}  {}", record.id, record.title, record.description);
                }
            }
        }
        Commands::Codes => {
            let clock = corrected_clock(&cfg, false).await?;
            let now = clock.now_ms();
            let views = manager.code_board(now).await?;
            print!("{}", board::render_board(&views, remaining(now)));
        }
        Commands::Watch => watch(&cfg, manager).await?,
        Commands::Edit {
            id,
            title,
            description,
            secret,
        } => {
            let record = manager
                .edit(
                    &id,
                    SecretUpdate {
                        title,
                        description,
                        secret,
                    },
                )
                .await?;
            println!("Updated {} ({})", record.title, record.id);
        }
        Commands::Delete { id } => {
            manager.delete(&id).await?;
            println!("Deleted {}", id);
        }
        Commands::Reorder { ids } => {
            manager.reorder(&ids).await?;
            println!("Reordered {} secrets", ids.len());
        }
        Commands::Export { json } => {
            let records = manager.list().await?;
            if records.is_empty() {
                bail!("There are no secrets to export");
            }
            match json {
                Some(dir) => {
                    let path = write_config_file(&dir, &records, chrono::Utc::now())?;
                    println!("Wrote {} secrets to {}", records.len(), path.display());
                }
                None => match encode_for_qr(&records) {
                    Ok(payload) => println!("{}", payload),
                    Err(e @ FormatError::PayloadTooLarge { .. }) => {
                        bail!("{}; use `export --json DIR` instead", e)
                    }
                    Err(e) => return Err(e.into()),
                },
            }
        }
        Commands::Import { payload, json } => {
            let records = match (json, payload) {
                (Some(path), _) => {
                    let text = std::fs::read_to_string(&path)
                        .with_context(|| format!("Failed to read {}", path.display()))?;
                    parse_config_json(&text)?
                }
                (None, Some(payload)) => decode(&payload)?,
                (None, None) => bail!("Nothing to import"),
            };
            let imported = import_data(store.as_ref(), &records).await;
            println!("Imported {} of {} secrets", imported, records.len());
        }
        Commands::Send => send(&cfg, store.as_ref()).await?,
        Commands::Receive { uri } => receive(&cfg, store.as_ref(), &uri).await?,
    }

    Ok(())
}

/// Clock corrected against the relay when one is configured, otherwise the
/// local clock. With `keep_fresh` the offset is re-measured periodically.
async fn corrected_clock(cfg: &ClientConfig, keep_fresh: bool) -> Result<Arc<dyn Clock>> {
    let Some(relay) = cfg.relay_url.as_deref().filter(|url| !url.trim().is_empty()) else {
        return Ok(Arc::new(SystemClock));
    };

    let authority = Arc::new(HttpTimeAuthority::new(relay)?);
    let sync = Arc::new(ClockSync::with_timeout(
        authority,
        Arc::new(SystemClock),
        cfg.time_timeout(),
    ));
    if keep_fresh {
        // First tick measures immediately
        spawn_refresh_loop(sync.clone(), cfg.clock_refresh());
    } else {
        sync.refresh().await;
    }
    Ok(sync as Arc<dyn Clock>)
}

async fn watch(cfg: &ClientConfig, manager: Arc<SecretManager>) -> Result<()> {
    let clock = corrected_clock(cfg, true).await?;
    let shown: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let board_clock = clock.clone();

    let (handle, control) = spawn_cycle_loop(clock, cfg.tick_interval(), move |tick| {
        let manager = manager.clone();
        let clock = board_clock.clone();
        let shown = shown.clone();
        async move {
            if tick.recompute.is_none() {
                eprint!("\r{}", board::countdown_bar(tick.remaining));
                return false;
            }

            let views = match manager.code_board(clock.now_ms()).await {
                Ok(views) => views,
                Err(e) => {
                    warn!("Failed to load codes: {}", e);
                    return false;
                }
            };
            let codes = board::codes_of(&views);
            let changed = match shown.lock() {
                Ok(mut previous) => {
                    let changed = *previous != codes;
                    *previous = codes;
                    changed
                }
                Err(_) => true,
            };
            if changed {
                print!("\n{}", board::render_board(&views, tick.remaining));
            }
            changed
        }
    });

    tokio::signal::ctrl_c().await?;
    control.shutdown();
    handle.await?;
    eprintln!();
    Ok(())
}

fn rendezvous_session(cfg: &ClientConfig) -> Result<TransferSession> {
    let network = RendezvousNetwork::new(cfg.require_relay()?)?;
    let session = TransferSession::new(Arc::new(network));

    let mut status = session.subscribe();
    tokio::spawn(async move {
        while status.changed().await.is_ok() {
            let current = *status.borrow();
            info!("Peer status: {}", current);
        }
    });
    Ok(session)
}

async fn send(cfg: &ClientConfig, store: &dyn SecretStore) -> Result<()> {
    if !store.has_secrets().await? {
        bail!("There are no secrets to send");
    }

    let mut session = rendezvous_session(cfg)?;
    let uri = session.publish().await?;
    println!("{}", uri);
    println!("Waiting for the other device. Press Ctrl+C to cancel.");

    tokio::select! {
        sent = session.send_backup(store) => {
            let sent = sent?;
            println!("Sent {} secrets", sent);
        }
        _ = tokio::signal::ctrl_c() => {
            session.reset().await;
            println!("Cancelled");
        }
    }
    Ok(())
}

async fn receive(cfg: &ClientConfig, store: &dyn SecretStore, uri: &str) -> Result<()> {
    let mut session = rendezvous_session(cfg)?;

    let mut connected = session.connect(uri).await;
    while let Err(TwofoldError::Network(e)) = &connected {
        warn!("Connect attempt {} failed: {}", session.attempts(), e);
        tokio::time::sleep(Duration::from_secs(1)).await;
        connected = session.retry_connect(uri).await;
    }
    connected?;

    let payload = session.receive().await?;
    let records = decode(&payload)?;
    let imported = import_data(store, &records).await;
    println!("Imported {} of {} secrets", imported, records.len());
    Ok(())
}
