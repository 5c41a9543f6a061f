//! shellroom-server: shared Linux study room.
//!
//! Gives every user a private container, streams a login shell into it over
//! WebSocket, and lets everyone else in the room watch.

mod accounts;
mod broadcast;
mod chat;
mod config;
mod container;
mod db;
mod lifecycle;
mod rate_limit;
mod server;
mod session;
mod transport;

use accounts::{IdentityRegistry, SqliteAccountStore};
use anyhow::{Context, Result};
use broadcast::Broadcaster;
use chat::ChatService;
use clap::Parser;
use config::{CliOverrides, ServerConfig};
use container::{ContainerRuntime, DockerCli};
use db::Database;
use lifecycle::LifecycleManager;
use server::RoomServer;
use session::SessionManager;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// shellroom-server: per-user containers with shared terminals
#[derive(Parser, Debug)]
#[command(name = "shellroom-server", version, about = "Shared Linux study room server")]
struct Cli {
    /// Listen port
    #[arg(short, long)]
    port: Option<u16>,

    /// Listen address
    #[arg(long)]
    bind: Option<String>,

    /// Config file path
    #[arg(long, default_value = "~/.shellroom/config.toml")]
    config: String,

    /// SQLite database path
    #[arg(long)]
    database: Option<String>,

    /// Container runtime binary (docker, podman)
    #[arg(long)]
    runtime: Option<String>,

    /// Container lifetime in seconds
    #[arg(long)]
    lifetime: Option<u64>,

    /// Expiry sweep interval in seconds
    #[arg(long)]
    sweep_interval: Option<u64>,

    /// Maximum concurrent terminal sessions
    #[arg(long)]
    max_sessions: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    use tracing_subscriber::EnvFilter;
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "starting shellroom-server");

    let room = match bootstrap(cli).await {
        Ok(room) => Arc::new(room),
        Err(e) => {
            error!(error = %format!("{e:#}"), "startup failed");
            std::process::exit(1);
        }
    };

    tokio::select! {
        result = room.clone().run() => {
            if let Err(e) = result {
                error!(error = %e, "server error");
                std::process::exit(1);
            }
        }
        _ = shutdown_signal() => {
            info!("received shutdown signal");
            room.shutdown();
            // Let connection loops flush their shutdown notice.
            tokio::time::sleep(Duration::from_millis(250)).await;
        }
    }

    info!("shellroom-server stopped");
}

/// Wire storage, identity, runtime and the room together.
async fn bootstrap(cli: Cli) -> Result<RoomServer> {
    let overrides = CliOverrides {
        port: cli.port,
        bind: cli.bind,
        database: cli.database,
        runtime: cli.runtime,
        lifetime_secs: cli.lifetime,
        sweep_interval_secs: cli.sweep_interval,
        max_sessions: cli.max_sessions,
    };
    let config_path = PathBuf::from(&cli.config);
    let config = ServerConfig::load(Some(&config_path), overrides).context("loading config")?;

    let db = Database::open(&config.database_path)
        .await
        .with_context(|| format!("opening database {}", config.database_path.display()))?;

    let store = Arc::new(SqliteAccountStore::new(db.pool().clone()));
    let registry =
        Arc::new(IdentityRegistry::new(store, config.bcrypt_cost).context("identity registry")?);

    let runtime: Arc<dyn ContainerRuntime> = Arc::new(DockerCli::new(config.runtime_binary.clone()));
    match runtime.health_check().await {
        Ok(version) => info!(runtime = %config.runtime_binary, version = %version, "container runtime reachable"),
        Err(e) => warn!(
            runtime = %config.runtime_binary,
            error = %e,
            "container runtime unavailable; joins will fail until it is reachable"
        ),
    }

    let lifecycle = Arc::new(LifecycleManager::new(
        runtime.clone(),
        registry,
        config.lifecycle.clone(),
        config.username_policy,
        config.password_policy,
    ));
    match lifecycle.reattach_existing().await {
        Ok(count) => info!(count, "reattached existing containers"),
        Err(e) => warn!(error = %e, "could not list existing containers"),
    }

    let sessions = Arc::new(SessionManager::new(runtime, config.max_sessions));
    let broadcaster = Arc::new(Broadcaster::new());
    let chat = Arc::new(ChatService::new(db.pool().clone(), config.chat.clone()));

    Ok(RoomServer::new(config, lifecycle, sessions, broadcaster, chat))
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm =
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(sigterm) => sigterm,
                Err(e) => {
                    warn!(error = %e, "failed to install SIGTERM handler");
                    let _ = ctrl_c.await;
                    return;
                }
            };
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
