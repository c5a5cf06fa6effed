//! sandpit-daemon - Playground daemon owning one sandbox container per session
//!
//! - START / EXECUTE / LINT / STOP / SAVE_TABS over a Unix socket
//! - runs under a hard deadline, serialized per session
//! - idle sandboxes reclaimed by a background reaper

use anyhow::Result;
use clap::Parser;
use futures_util::StreamExt;
use sandpit_core::runtime::DockerRuntime;
use sandpit_core::{IdleReaper, SandboxManager};
use signal_hook::consts::signal::{SIGINT, SIGTERM};
use signal_hook_tokio::Signals;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::UnixListener;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

mod config;
mod server;

use config::DaemonConfig;

#[derive(Parser)]
#[command(name = "sandpit-daemon")]
#[command(author, version, about = "Per-session sandbox daemon for the code playground")]
struct Args {
    /// JSON configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Socket path (overrides the configuration file)
    #[arg(short, long)]
    socket: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("sandpit=info".parse()?))
        .init();

    tracing::info!("sandpit-daemon starting");

    let args = Args::parse();
    let mut config = match &args.config {
        Some(path) => DaemonConfig::load(path)?,
        None => DaemonConfig::default(),
    };
    if let Some(socket) = args.socket {
        config.socket_path = socket;
    }
    tracing::info!(
        socket = ?config.socket_path,
        image = %config.manager.sandbox.image,
        timeout_secs = config.manager.sandbox.timeout.as_secs(),
        idle_ttl_secs = config.manager.idle_ttl.as_secs(),
        "configuration loaded"
    );

    // Create socket directory if needed
    if let Some(parent) = config.socket_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    // Remove existing socket
    let _ = std::fs::remove_file(&config.socket_path);

    let runtime = DockerRuntime::connect(config.manager.sandbox.clone())?;
    let manager = Arc::new(SandboxManager::new(Arc::new(runtime), config.manager.clone()));
    // adopt sandboxes left by a previous daemon so the reaper sees them
    if let Err(e) = manager.adopt_existing().await {
        tracing::warn!(error = %e, "could not list existing sandboxes");
    }
    let reaper = IdleReaper::new(Arc::clone(&manager)).spawn();

    // Bind socket
    let listener = UnixListener::bind(&config.socket_path)?;
    tracing::info!(socket = ?config.socket_path, "listening");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut signals = Signals::new([SIGINT, SIGTERM])?;
    let signals_handle = signals.handle();
    tokio::spawn(async move {
        if let Some(signal) = signals.next().await {
            tracing::info!(signal, "shutdown signal received");
            let _ = shutdown_tx.send(true);
        }
    });

    // Run server
    let served = server::run(listener, manager, shutdown_rx).await;

    signals_handle.close();
    reaper.shutdown().await;
    let _ = std::fs::remove_file(&config.socket_path);
    tracing::info!("sandpit-daemon stopped");

    served.map_err(Into::into)
}
