//! AWorld Server
//!
//! WebSocket game server plus the HTTP side surface.

use anyhow::Context;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use aworld::{
    VERSION,
    network::{http, GameServer, ServerConfig},
};

#[cfg(feature = "debug-tracing")]
const DEFAULT_FILTER: &str = "debug";
#[cfg(not(feature = "debug-tracing"))]
const DEFAULT_FILTER: &str = "info";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER)),
        )
        .init();

    let config = ServerConfig::from_env().context("invalid server configuration")?;
    info!("AWorld Server v{}", VERSION);
    info!(
        "Tick rate {} Hz, broadcast every {} tick(s), max {} connections",
        config.tick_rate(),
        config.broadcast_interval_ticks,
        config.max_connections
    );

    let http_addr = config.http_addr;
    let server = GameServer::new(config);
    let handle = server.handle();

    let http_task = tokio::spawn(http::serve(http_addr, handle.clone()));

    let shutdown = handle.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Shutdown requested"),
            Err(e) => error!("Failed to listen for ctrl-c: {}", e),
        }
        shutdown.shutdown();
    });

    server.run().await.context("game server failed")?;

    match http_task.await {
        Ok(result) => result.context("http server failed")?,
        Err(e) => error!("HTTP task ended abnormally: {}", e),
    }

    info!("Server stopped");
    Ok(())
}
