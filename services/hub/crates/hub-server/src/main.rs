//! Fleet hub entry point.
//!
//! Initialises tracing, loads configuration from `FLEET_HUB_*` environment
//! variables, picks the state backend (Valkey, or in-memory with a devices
//! file) and serves the agent socket and device API until SIGINT/SIGTERM.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum_server::tls_rustls::RustlsConfig;
use fleet_hub::{
    AppState, DeviceRegistry, EventSink, Hub, HubConfig, MemoryEvents, MemoryStore,
    SnapshotStore, StaticRegistry, ValkeyStore, build_router,
};
use fleet_protocol::limits;
use tracing_subscriber::EnvFilter;

/// Time allowed for in-flight HTTP requests once shutdown starts.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

type Backends = (
    Arc<dyn SnapshotStore>,
    Arc<dyn DeviceRegistry>,
    Arc<dyn EventSink>,
);

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    tracing::info!("fleet-hub starting");

    let config = HubConfig::from_env()?;
    tracing::info!(
        listen_addr = %config.listen_addr,
        valkey = config.valkey_url.is_some(),
        tls_enabled = config.tls_cert.is_some(),
        admin_token = config.admin_token_file.is_some(),
        "configuration loaded",
    );

    let (store, registry, events) = backends(&config).await?;
    let hub = Hub::new(config.settings(), store, registry, events);

    let mut state = AppState::new(hub.clone());
    state.default_command_ttl_secs = config.command_ttl_secs;
    state.max_command_ttl_secs = config.max_command_ttl_secs;
    if let Some(token) = config.admin_token()? {
        state = state.with_admin_token(token);
    } else {
        tracing::warn!("FLEET_HUB_ADMIN_TOKEN_FILE not set: device API is unauthenticated");
    }
    let router = build_router(state);

    let addr: std::net::SocketAddr = config
        .listen_addr
        .parse()
        .context("invalid listen address")?;

    if let (Some(cert_path), Some(key_path)) = (&config.tls_cert, &config.tls_key) {
        tracing::info!(cert = %cert_path, "TLS enabled");
        let tls_config = RustlsConfig::from_pem_file(cert_path, key_path)
            .await
            .context("failed to load TLS certificates")?;

        let handle = axum_server::Handle::new();
        let shutdown = handle.clone();
        // Agent sockets are closed with 1012 before HTTP draining starts.
        let hub = hub.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            hub.shutdown().await;
            shutdown.graceful_shutdown(Some(DRAIN_TIMEOUT));
        });

        tracing::info!("hub ready on https://{addr}");
        axum_server::bind_rustls(addr, tls_config)
            .handle(handle)
            .serve(router.into_make_service())
            .await
            .context("HTTPS server error")?;
    } else {
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .context("failed to bind TCP listener")?;

        tracing::info!("hub ready on http://{addr} (TLS disabled)");
        let hub = hub.clone();
        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                shutdown_signal().await;
                hub.shutdown().await;
            })
            .await
            .context("HTTP server error")?;
    }

    tracing::info!("fleet-hub shut down");
    Ok(())
}

async fn backends(config: &HubConfig) -> Result<Backends> {
    if let Some(options) = config.valkey_options()? {
        let valkey = Arc::new(
            ValkeyStore::connect(&options)
                .await
                .context("failed to initialise Valkey connection")?,
        );
        let store: Arc<dyn SnapshotStore> = valkey.clone();
        let registry: Arc<dyn DeviceRegistry> = valkey.clone();
        let events: Arc<dyn EventSink> = valkey;
        return Ok((store, registry, events));
    }

    // validate() guarantees a devices file when Valkey is not configured.
    let path = config
        .devices_file
        .as_deref()
        .context("FLEET_HUB_DEVICES_FILE is required without FLEET_HUB_VALKEY_URL")?;
    let registry = StaticRegistry::from_file(Path::new(path))?;
    tracing::warn!(
        devices = registry.len(),
        "using in-memory state: snapshots do not survive a restart"
    );
    let capacity = usize::try_from(limits::EVENT_STREAM_MAXLEN).unwrap_or(usize::MAX);
    let store: Arc<dyn SnapshotStore> = Arc::new(MemoryStore::new());
    let registry: Arc<dyn DeviceRegistry> = Arc::new(registry);
    let events: Arc<dyn EventSink> = Arc::new(MemoryEvents::new(capacity));
    Ok((store, registry, events))
}

/// Wait for SIGINT (Ctrl-C) or SIGTERM.
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
    tracing::info!("received shutdown signal");
}
