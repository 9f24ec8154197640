//! ocf-event-gateway server entry point.
//!
//! Starts the Axum HTTP server with the ingestion REST API and the `/ws`
//! subscription stream.

use std::sync::Arc;

use anyhow::Context;
use tracing_subscriber::EnvFilter;

use ocf_event_gateway::app::build_app;
use ocf_event_gateway::app_state::AppState;
use ocf_event_gateway::config::{GatewayConfig, LogFormat};
use ocf_event_gateway::persistence::{EventStore, MemoryEventStore, PostgresEventStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration
    let config = GatewayConfig::from_env()
        .map_err(|e| anyhow::anyhow!("invalid configuration: {e}"))?;

    // Initialize tracing
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match config.log_format {
        LogFormat::Json => tracing_subscriber::fmt().json().with_env_filter(filter).init(),
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
    }
    tracing::info!(addr = %config.listen_addr, "starting ocf-event-gateway");

    // Select the event store
    let store: Arc<dyn EventStore> = if config.persistence_enabled {
        let store = PostgresEventStore::connect(
            &config.database_url,
            config.database_max_connections,
            config.database_connect_timeout(),
        )
        .await
        .context("connecting to the event store")?;
        Arc::new(store)
    } else {
        tracing::warn!("persistence disabled, events are kept in memory only");
        Arc::new(MemoryEventStore::new())
    };

    // Build application state and router
    let listen_addr = config.listen_addr;
    let app = build_app(AppState::new(store, config));

    // Start server
    let listener = tokio::net::TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("binding {listen_addr}"))?;
    tracing::info!(addr = %listen_addr, "server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for shutdown signal");
    }
}
