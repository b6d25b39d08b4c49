//! HTTP Surface
//!
//! Out-of-band endpoints next to the WebSocket server:
//!
//! - `GET /health` -> status and live counters
//! - `GET /api/physics` -> the shared physics constants
//! - `POST /api/wall_display` -> replace and broadcast shared display content

use std::net::SocketAddr;
use axum::{
    extract::State,
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::{Serialize, Deserialize};
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::core::physics::PhysicsConfig;
use crate::network::server::{GameServerError, ServerHandle, ServerStats};

/// `GET /health` body.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    /// Always "ok" while the server answers.
    pub status: String,
    /// Server version.
    pub version: String,
    /// Live counters.
    #[serde(flatten)]
    pub stats: ServerStatsBody,
}

/// Counters as exposed over HTTP.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerStatsBody {
    /// Joined players.
    pub players: usize,
    /// Open connections.
    pub connections: usize,
    /// Input commands applied.
    pub processed_inputs: u64,
    /// Input commands dropped by queue overflow.
    pub dropped_inputs: u64,
    /// Ticks run.
    pub tick: u64,
}

impl From<ServerStats> for ServerStatsBody {
    fn from(stats: ServerStats) -> Self {
        Self {
            players: stats.players,
            connections: stats.connections,
            processed_inputs: stats.processed_inputs,
            dropped_inputs: stats.dropped_inputs,
            tick: stats.tick,
        }
    }
}

/// `POST /api/wall_display` body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WallDisplayRequest {
    /// New content.
    pub content: String,
}

/// Generic status reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
    /// "ok" or "error".
    pub status: String,
    /// Error detail.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Build the router.
pub fn router(handle: ServerHandle) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/physics", get(physics))
        .route("/api/wall_display", post(wall_display))
        .with_state(handle)
}

async fn health(State(handle): State<ServerHandle>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: handle.version().to_string(),
        stats: handle.stats().into(),
    })
}

async fn physics(State(handle): State<ServerHandle>) -> Json<PhysicsConfig> {
    Json(*handle.physics())
}

async fn wall_display(
    State(handle): State<ServerHandle>,
    Json(req): Json<WallDisplayRequest>,
) -> (StatusCode, Json<StatusResponse>) {
    match handle.set_wall_display(req.content).await {
        Ok(()) => (
            StatusCode::OK,
            Json(StatusResponse { status: "ok".to_string(), error: None }),
        ),
        Err(e) => {
            warn!("Wall display update failed: {}", e);
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(StatusResponse { status: "error".to_string(), error: Some(e.to_string()) }),
            )
        }
    }
}

/// Serve the HTTP surface until the server shuts down.
pub async fn serve(addr: SocketAddr, handle: ServerHandle) -> Result<(), GameServerError> {
    let listener = TcpListener::bind(addr).await?;
    serve_on(listener, handle).await
}

/// Serve on an already bound listener until the server shuts down.
pub async fn serve_on(listener: TcpListener, handle: ServerHandle) -> Result<(), GameServerError> {
    info!("HTTP listening on {}", listener.local_addr()?);
    let mut shutdown = handle.shutdown_signal();
    axum::serve(listener, router(handle))
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
        })
        .await?;
    Ok(())
}
