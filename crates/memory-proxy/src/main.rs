use anyhow::{Context, Result};
use std::net::SocketAddr;
use tracing::info;

use memory_proxy::config::Settings;
use memory_proxy::utils::logger::init_logger;
use memory_proxy::{build_router, store, AppState};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    init_logger()?;

    info!("🚀 Starting memory proxy...");

    // Load configuration
    let settings = Settings::load()?;
    info!(
        "✅ Configuration loaded (upstream: {}, storage: {:?})",
        settings.upstream.base_url, settings.storage.backend
    );

    // Message store: failure here is fatal
    let store = store::connect(&settings.storage)
        .await
        .context("opening message store")?;
    info!("✅ Message store connected");

    let state = AppState::new(&settings, store)?;
    let app = build_router(state, &settings.server);

    // Server address
    let addr = SocketAddr::from((
        settings.server.host.parse::<std::net::IpAddr>()?,
        settings.server.port,
    ));

    info!("🎯 Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
    }
    info!("Shutdown signal received");
}
