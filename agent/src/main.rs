//! Fleet agent entry point.
//!
//! Parses flags (or `FLEET_AGENT_*` variables), builds the firmware layer
//! and keeps a session to the hub until SIGINT/SIGTERM.

use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use fleet_agent::{AgentArgs, ConnectionManager, Firmware, TokioCommandRunner};
use fleet_protocol::limits;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = AgentArgs::parse().into_config()?;
    tracing::info!(
        device_id = %config.device_id,
        firmware_version = %config.firmware_version,
        mode = %config.mode,
        "fleet-agent starting"
    );

    let runner = Arc::new(TokioCommandRunner::new(limits::MAX_OUTPUT_BYTES));
    let firmware = Arc::new(Firmware::new(runner, config.paths.clone()));

    let (stop_tx, stop_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        tracing::info!("shutdown signal received");
        let _ = stop_tx.send(true);
    });

    ConnectionManager::new(config, firmware).run(stop_rx).await;
    tracing::info!("fleet-agent stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to install Ctrl-C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}
