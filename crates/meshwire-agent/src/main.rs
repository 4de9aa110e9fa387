//! Meshwire agent
//!
//! Runs on every mesh member: keeps a persistent session to the
//! coordinator, applies configuration-update tasks, and reports host
//! health.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::info;

use meshwire_agent::executor::TaskExecutor;
use meshwire_agent::metrics::SystemMetrics;
use meshwire_agent::session::{build_endpoint, AgentSession};
use meshwire_agent::status::StatusReporter;
use meshwire_core::config::AgentConfig;
use meshwire_core::tracing_init;

#[derive(Parser, Debug)]
#[command(name = "meshwire-agent")]
#[command(version, about = "Meshwire agent - applies mesh configuration on a member node")]
struct Args {
    /// Path to the YAML configuration file.
    #[arg(long, env = "MESHWIRE_AGENT_CONFIG", default_value = "meshwire-agent.yaml")]
    config: PathBuf,

    /// Log intended actions without writing files or restarting units.
    #[arg(long)]
    dry_run: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = AgentConfig::load(&args.config)?;
    if args.dry_run {
        config.runtime.dry_run = true;
    }

    tracing_init::init_tracing(
        &format!("meshwire_agent={}", config.runtime.log_level),
        config.runtime.log_path.as_deref(),
    )?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        node_id = config.node_id,
        server = %config.server.address,
        dry_run = config.runtime.dry_run,
        "Starting meshwire-agent"
    );

    // One lazy channel for the executor's acks and the status loop;
    // the session manages its own connection so it can re-register.
    let channel = build_endpoint(&config)?.connect_lazy();

    let executor = Arc::new(TaskExecutor::new(config.clone(), channel.clone()));
    let reporter = StatusReporter::new(
        config.clone(),
        channel,
        Box::new(SystemMetrics::new()),
        executor.active_tasks(),
    );
    let session = AgentSession::new(config, executor);

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let reporter_handle = tokio::spawn(reporter.run(shutdown_tx.subscribe()));

    #[cfg(unix)]
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    #[cfg(unix)]
    let sigterm_future = sigterm.recv();
    #[cfg(not(unix))]
    let sigterm_future = std::future::pending::<Option<()>>();

    let result = tokio::select! {
        result = session.run(shutdown_rx) => result,
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C shutdown signal");
            Ok(())
        }
        _ = sigterm_future => {
            info!("Received SIGTERM shutdown signal");
            Ok(())
        }
    };

    let _ = shutdown_tx.send(true);
    let _ = reporter_handle.await;

    info!("Agent stopped");
    result.map_err(Into::into)
}
