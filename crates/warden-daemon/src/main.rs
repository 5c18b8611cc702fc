//! wardend: serves the policy manager on a local socket.

mod config;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::watch;
use tracing::{error, info, warn};

use warden::policy::{
    DirectoryLoader, MemoryStore, PolicyManager, PolicyStore, SqliteStore, StaticLoader,
};
use warden::rmi::{Listener, Server};
use warden::service::{DEFAULT_SOCKET, PolicyService};

use crate::config::DaemonConfig;

/// Policy daemon for multi-administrator devices.
#[derive(Parser, Debug)]
#[command(name = "wardend", version, about)]
struct Cli {
    /// Path of the listening socket.
    #[arg(long, env = "WARDEN_SOCKET", default_value = DEFAULT_SOCKET)]
    socket: PathBuf,

    /// SQLite database holding admins and votes.
    #[arg(long, env = "WARDEN_DB")]
    database: Option<PathBuf>,

    /// Directory of provider plugins.
    #[arg(long, env = "WARDEN_PLUGIN_DIR")]
    plugin_dir: Option<PathBuf>,

    /// Always bind the socket, ignoring LISTEN_FDS.
    #[arg(long)]
    no_activation: bool,
}

impl From<Cli> for DaemonConfig {
    fn from(cli: Cli) -> Self {
        Self {
            socket: cli.socket,
            database: cli.database,
            plugin_dir: cli.plugin_dir,
            socket_activation: !cli.no_activation,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    warden::logging::init_tracing("info");
    let config = DaemonConfig::from(Cli::parse());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = shutdown_tx.send(true);
    });

    serve(config, shutdown_rx).await
}

async fn open_store(config: &DaemonConfig) -> anyhow::Result<Arc<dyn PolicyStore>> {
    match &config.database {
        Some(path) => {
            let store = SqliteStore::open(path)
                .await
                .with_context(|| format!("failed to open database {}", path.display()))?;
            info!(database = %path.display(), "Opened policy database");
            Ok(Arc::new(store))
        }
        None => {
            warn!("No database configured, policy state lives in memory");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}

async fn serve(config: DaemonConfig, shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
    let manager = Arc::new(PolicyManager::new(open_store(&config).await?));

    let installed = match &config.plugin_dir {
        Some(dir) => manager
            .install(&DirectoryLoader::new(dir))
            .with_context(|| format!("failed to scan plugins in {}", dir.display()))?,
        None => manager.install(&StaticLoader::new().with(warden_policy_bluetooth::provider))?,
    };
    if installed == 0 {
        warn!("No policy providers installed");
    }
    manager.load().await.context("failed to restore policy state")?;

    let listener = if config.socket_activation {
        Listener::bind_or_activate(&config.socket)?
    } else {
        Listener::create(&config.socket)?
    };

    let mut server = Server::new();
    PolicyService::bind(&mut server, Arc::clone(&manager));

    info!(
        socket = %config.socket.display(),
        activated = listener.is_activated(),
        providers = installed,
        methods = server.methods().count(),
        "wardend listening"
    );
    server.run(listener, shutdown).await;
    info!("wardend shutdown complete");
    Ok(())
}

/// Wait for SIGINT or SIGTERM. A handler that cannot be installed is logged
/// and never fires.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await
        }
    };

    let terminate = async {
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT, shutting down"),
        _ = terminate => info!("Received SIGTERM, shutting down"),
    }
}
