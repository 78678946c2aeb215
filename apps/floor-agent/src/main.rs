//! # Floor Agent
//!
//! Headless host for one [`ShopfloorClient`].
//!
//! ## Startup
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  1. tracing (RUST_LOG, default info,shopfloor=debug,sqlx=warn)         │
//! │  2. SyncConfig: preset (SHOPFLOOR_PRESET) → sync.toml → env → validate │
//! │  3. SQLite store in the platform data dir (SHOPFLOOR_DB_PATH overrides)│
//! │  4. cleanup of finished actions past retention                         │
//! │  5. client build + connect (failure is retried in the background)     │
//! │  6. status logging until Ctrl-C / SIGTERM                              │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use directories::ProjectDirs;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use shopfloor_core::{ConflictRecord, SocketState};
use shopfloor_store::{Database, DbConfig};
use shopfloor_sync::{protocol, EventMessage, Preset, ShopfloorClient, SyncConfig};

const DEFAULT_FILTER: &str = "info,shopfloor=debug,sqlx=warn";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();

    info!("Starting floor agent...");

    let config = load_config()?;
    info!(
        device_id = %config.device_id(),
        server_url = %config.server_url(),
        "Configuration loaded"
    );

    let db_path = database_path()?;
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating data directory {}", parent.display()))?;
    }
    let database = Database::new(DbConfig::new(&db_path))
        .await
        .with_context(|| format!("opening {}", db_path.display()))?;
    info!(path = %db_path.display(), "Action store ready");

    let client = ShopfloorClient::builder(config)
        .with_store(Arc::new(database))
        .build()
        .await
        .context("building sync client")?;

    let removed = client.cleanup().await?;
    if removed > 0 {
        info!(removed, "Removed finished actions past retention");
    }

    let _conflicts = client.on(protocol::SYNC_CONFLICT, |event: &EventMessage| {
        match serde_json::from_value::<ConflictRecord>(event.data.clone()) {
            Ok(conflict) => warn!(
                action_id = conflict.action_id,
                entity_type = %conflict.entity_type,
                entity_id = %conflict.entity_id,
                server_version = conflict.server_version,
                "Conflict waiting for a decision"
            ),
            Err(e) => warn!(error = %e, "Unreadable conflict event"),
        }
    })?;
    let _failures = client.on(protocol::SYNC_ACTION_FAILED, |event: &EventMessage| {
        warn!(data = %event.data, "Action failed");
    })?;

    if let Err(e) = client.connect().await {
        warn!(error = %e, "Initial connect failed, retrying in the background");
    }

    let mut status = client.watch_status();
    let mut last_socket = status.borrow().socket;
    let mut report = tokio::time::interval(Duration::from_secs(60));

    loop {
        tokio::select! {
            _ = shutdown_signal() => break,
            changed = status.changed() => {
                if changed.is_err() {
                    error!("Connection manager stopped unexpectedly");
                    break;
                }
                let snapshot = status.borrow_and_update().clone();
                if snapshot.socket != last_socket {
                    info!(
                        socket = %snapshot.socket,
                        attempts = snapshot.reconnect_attempts,
                        next_retry_ms = ?snapshot.next_retry_ms,
                        "Connection state changed"
                    );
                    if snapshot.socket == SocketState::Error {
                        error!(last_error = ?snapshot.last_error, "Giving up until reset");
                    }
                    last_socket = snapshot.socket;
                }
            }
            _ = report.tick() => {
                let stats = client.queue_stats().await;
                let snapshot = client.status();
                let network = client.network_status();
                info!(
                    socket = %snapshot.socket,
                    health = snapshot.health_score,
                    latency_ms = ?snapshot.latency_ms,
                    network = %network.quality,
                    pending = stats.pending,
                    failed = stats.failed,
                    conflicts = stats.conflicts,
                    "Status"
                );
            }
        }
    }

    client.shutdown().await;
    info!("Floor agent stopped");
    Ok(())
}

/// Preset from `SHOPFLOOR_PRESET`, then file, then environment.
fn load_config() -> anyhow::Result<SyncConfig> {
    let base = match std::env::var("SHOPFLOOR_PRESET") {
        Ok(name) => {
            let preset: Preset = name.parse().context("SHOPFLOOR_PRESET")?;
            info!(%preset, "Using preset");
            SyncConfig::preset(preset)
        }
        Err(_) => SyncConfig::default(),
    };
    Ok(SyncConfig::load_with_base(base, None)?)
}

fn database_path() -> anyhow::Result<PathBuf> {
    if let Ok(path) = std::env::var("SHOPFLOOR_DB_PATH") {
        return Ok(PathBuf::from(path));
    }
    let dirs = ProjectDirs::from("com", "shopfloor", "link")
        .context("no home directory to place the action store in")?;
    Ok(dirs.data_dir().join("shopfloor.db"))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}
