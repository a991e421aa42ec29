//! Web server module: axum HTTP API + WebSocket push channels.
//!
//! Admin routes (bearer token when configured):
//! - `POST /api/stream/switch-camera`: idempotent camera switch
//! - `POST /api/stream/switch-profile`: idempotent quality profile switch
//! - `POST /api/stream/start`, `/api/stream/stop`, `/api/stream/retry`
//! - `POST /api/stream/command`: generic command dispatch
//! - `GET /api/stream/status`: stream state plus both switch requests
//! - `GET /api/commands/{id}`: command ledger lookup
//! - `POST /api/featured`: broadcast the featured vehicle
//! - `WS /ws/events`: push events for dashboards
//!
//! Edge routes (`x-truck-token` header):
//! - `POST /api/edge/heartbeat`
//! - `POST /api/edge/command-response`
//! - `POST /api/edge/profile-request`
//! - `WS /ws/edge`: command feed for the token's vehicle

mod routes;
pub mod ws;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::routing::{get, post};
use axum::Router;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::cloud::ControlPlane;
use crate::command::RedactedString;

pub use routes::ApiError;

/// Shared state for the web server
pub struct WebState {
    pub plane: Arc<ControlPlane>,
    /// Bearer token for admin routes; `None` leaves them open
    pub admin_token: Option<RedactedString>,
    /// Closes long-lived WebSocket feeds on shutdown
    pub shutdown: CancellationToken,
}

/// Build the application router.
pub fn router(state: Arc<WebState>) -> Router {
    Router::new()
        .route("/api/stream/switch-camera", post(routes::switch_camera))
        .route("/api/stream/switch-profile", post(routes::switch_profile))
        .route("/api/stream/start", post(routes::start_stream))
        .route("/api/stream/stop", post(routes::stop_stream))
        .route("/api/stream/retry", post(routes::retry))
        .route("/api/stream/command", post(routes::dispatch))
        .route("/api/stream/status", get(routes::status))
        .route("/api/commands/{id}", get(routes::command))
        .route("/api/featured", post(routes::featured))
        .route("/api/edge/heartbeat", post(routes::edge_heartbeat))
        .route("/api/edge/command-response", post(routes::edge_command_response))
        .route("/api/edge/profile-request", post(routes::edge_profile_request))
        .route("/ws/edge", get(ws::edge_upgrade))
        .route("/ws/events", get(ws::events_upgrade))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Start the web server and serve until `shutdown` is cancelled.
pub async fn start(
    plane: Arc<ControlPlane>,
    bind: SocketAddr,
    admin_token: Option<RedactedString>,
    shutdown: CancellationToken,
) -> Result<()> {
    let state = Arc::new(WebState {
        plane,
        admin_token,
        shutdown: shutdown.clone(),
    });
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .context(format!("Failed to bind to {}", bind))?;

    info!("Web server listening on http://{}", bind);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("Web server error")?;

    Ok(())
}
