#![forbid(unsafe_code)]

use anyhow::Result;
use castrelay::config::ServerConfig;
use castrelay::metrics::ServerMetrics;
use castrelay::signaling::SignalingServer;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "castrelay=debug,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("castrelay - Starting server");

    let config = ServerConfig::from_env()?;
    let port = config.port;

    let metrics = ServerMetrics::new();
    let signaling_server = SignalingServer::new(config, metrics);

    info!("Starting signaling server on port {}", port);

    // Run server with graceful shutdown
    tokio::select! {
        result = signaling_server.clone().serve(port) => {
            if let Err(e) = result {
                tracing::error!("Signaling server error: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
        }
    }

    signaling_server.shutdown().await;
    info!("Server shutdown complete");
    Ok(())
}
