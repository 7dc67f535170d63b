//! Committee Arena Server
//!
//! Binds the WebSocket endpoint and runs rooms until Ctrl-C.

use std::sync::Arc;
use anyhow::Context;
use tracing::info;
use tracing_subscriber::EnvFilter;

use arena::{GameServer, ServerConfig, VERSION};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = ServerConfig::from_env().context("invalid server configuration")?;

    info!("Committee Arena Server v{}", VERSION);
    info!("Max connections: {}", config.max_connections);
    info!("Reconnect grace: {}s", config.reconnect_grace.as_secs());

    let server = Arc::new(GameServer::new(config));
    let runner = server.clone();
    let mut run = tokio::spawn(async move { runner.run().await });

    tokio::select! {
        result = &mut run => {
            result.context("server task panicked")??;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl-C, shutting down");
            server.shutdown();
            run.await.context("server task panicked")??;
        }
    }

    Ok(())
}
