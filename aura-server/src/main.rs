//! Aura gateway server binary
//!
//! Loads configuration, initializes tracing, builds the gateway lifecycle
//! and runs until SIGINT/SIGTERM. Also registers the echo smoke handler so
//! a fresh deployment can be exercised end to end before the downstream
//! components come up.

use anyhow::Context;
use aura_gateway::prelude::*;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config.toml".to_string());
    let store = std::sync::Arc::new(
        ConfigStore::from_file(&config_path)
            .with_context(|| format!("loading configuration from {}", config_path))?,
    );
    let config = store.current();

    init_tracing(&config).context("initializing tracing")?;
    info!(config = %config_path, "Starting Aura gateway");

    let gateway = Gateway::build(config)
        .await
        .context("building the gateway")?;

    // hot-reload notifications; subscribers re-read on change
    store.clone().spawn_watcher(gateway.shutdown_token());
    let mut config_changes = store.subscribe();
    tokio::spawn(async move {
        while config_changes.changed().await.is_ok() {
            info!("Configuration changed on disk; new values apply to reloadable consumers");
        }
    });

    spawn_echo_handler(gateway.core());

    let shutdown = gateway.shutdown_token();
    tokio::spawn(async move {
        shutdown_signal().await;
        shutdown.cancel();
    });

    gateway.run().await.context("running the gateway")?;
    info!("Gateway shutdown complete");
    Ok(())
}

/// Echo handler on `gateway.echo`: replies with the request payload
fn spawn_echo_handler(core: std::sync::Arc<GatewayCore>) {
    let mut subscription = core.bus.subscribe("gateway.echo");
    let bus = core.bus.clone();
    tokio::spawn(async move {
        while let Some(message) = subscription.next().await {
            let payload = message
                .json()
                .map(|request| request["payload"].clone())
                .unwrap_or(serde_json::Value::Null);
            let body = serde_json::to_vec(&payload).unwrap_or_default();
            if let Err(e) = bus.respond(&message, bytes::Bytes::from(body)).await {
                tracing::debug!(error = %e, "Echo reply not delivered");
            }
        }
    });
}

/// Wait for SIGTERM or SIGINT
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT, starting graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, starting graceful shutdown");
        }
    }
}
