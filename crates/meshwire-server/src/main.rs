//! Meshwire coordinator
//!
//! Owns the fleet registry, renders tunnel and routing configs, and
//! dispatches tasks to node agents over streaming gRPC. One TCP listener
//! serves both the gRPC services and the dashboard/agent HTTP API.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use tracing::{info, warn};

use meshwire_core::config::ServerConfig;
use meshwire_core::tracing_init;
use meshwire_server::server::MeshServer;
use meshwire_server::storage::open_store;

#[derive(Parser, Debug)]
#[command(name = "meshwire-server")]
#[command(version, about = "Meshwire coordinator - mesh control plane")]
struct Args {
    /// Path to the YAML configuration file.
    #[arg(long, env = "MESHWIRE_CONFIG", default_value = "meshwire-server.yaml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = ServerConfig::load(&args.config)?;

    tracing_init::init_tracing(
        &tracing_init::default_filter("meshwire_server", config.log.debug),
        config.log.file.as_deref(),
    )?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        addr = %config.listen_addr(),
        storage = ?config.storage.kind,
        "Starting meshwire-server"
    );

    let store = open_store(&config.storage).await?;
    let server = MeshServer::new(&config, store);

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    let addr = config.listen_addr();
    let mut server_task = tokio::spawn(async move { server.serve(&addr, shutdown_rx).await });

    #[cfg(unix)]
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    #[cfg(unix)]
    let sigterm_future = sigterm.recv();
    #[cfg(not(unix))]
    let sigterm_future = std::future::pending::<Option<()>>();

    tokio::select! {
        result = &mut server_task => {
            result??;
            return Ok(());
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C shutdown signal");
        }
        _ = sigterm_future => {
            info!("Received SIGTERM shutdown signal");
        }
    }

    // Drain in-flight work, then force the issue.
    let _ = shutdown_tx.send(true);
    match tokio::time::timeout(Duration::from_secs(5), &mut server_task).await {
        Ok(result) => result??,
        Err(_) => {
            warn!("Drain grace expired; aborting");
            server_task.abort();
        }
    }

    Ok(())
}
