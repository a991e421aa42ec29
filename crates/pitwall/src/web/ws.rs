//! WebSocket push channels.
//!
//! Text frames, one JSON [`PushEvent`] each:
//!   `/ws/edge`   → `edge_command` events for the authenticated vehicle only
//!   `/ws/events` → every state change, switch, and featured-vehicle event
//!
//! Both feeds are fire-and-forget: a lagging or reconnecting subscriber
//! misses events and nothing is replayed.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::routes::{edge_identity, require_admin};
use super::WebState;
use crate::event::PushEvent;
use crate::vehicle::VehicleKey;

#[derive(Debug, Deserialize)]
pub struct TokenQuery {
    token: Option<String>,
}

/// GET /ws/edge
pub async fn edge_upgrade(
    ws: WebSocketUpgrade,
    State(state): State<Arc<WebState>>,
    headers: HeaderMap,
) -> Response {
    match edge_identity(&state, &headers) {
        Ok(key) => ws
            .on_upgrade(move |socket| handle_edge(socket, key, state))
            .into_response(),
        Err(e) => e.into_response(),
    }
}

/// GET /ws/events
pub async fn events_upgrade(
    ws: WebSocketUpgrade,
    State(state): State<Arc<WebState>>,
    headers: HeaderMap,
    Query(query): Query<TokenQuery>,
) -> Response {
    match require_admin(&state, &headers, query.token.as_deref()) {
        Ok(()) => ws
            .on_upgrade(move |socket| handle_events(socket, state))
            .into_response(),
        Err(e) => e.into_response(),
    }
}

/// Forward one vehicle's command feed to its edge.
async fn handle_edge(socket: WebSocket, key: VehicleKey, state: Arc<WebState>) {
    let mut rx = state.plane.transport().subscribe(&key);
    info!(vehicle = %key, "Edge subscribed to command feed");

    pump(socket, &state, &mut rx, |result| match result {
        Ok(envelope) => Some(PushEvent::edge_command(&key, envelope)),
        Err(broadcast::error::RecvError::Lagged(n)) => {
            warn!(vehicle = %key, missed = n, "Edge feed lagged, commands dropped");
            None
        }
        Err(broadcast::error::RecvError::Closed) => None,
    })
    .await;

    info!(vehicle = %key, "Edge unsubscribed from command feed");
}

/// Forward every push event to a dashboard.
async fn handle_events(socket: WebSocket, state: Arc<WebState>) {
    let mut rx = state.plane.events().subscribe();
    pump(socket, &state, &mut rx, |result| match result {
        Ok(event) => Some(event),
        Err(broadcast::error::RecvError::Lagged(n)) => {
            warn!("Event subscriber lagged, missed {} events", n);
            None
        }
        Err(broadcast::error::RecvError::Closed) => None,
    })
    .await;
    debug!("Event subscriber disconnected");
}

/// Shared send loop: broadcast receiver → JSON text frames, until either
/// side closes or the server shuts down.
async fn pump<T, F>(
    socket: WebSocket,
    state: &WebState,
    rx: &mut broadcast::Receiver<T>,
    mut to_event: F,
) where
    T: Clone,
    F: FnMut(Result<T, broadcast::error::RecvError>) -> Option<PushEvent>,
{
    let (mut ws_tx, mut ws_rx) = socket.split();

    loop {
        tokio::select! {
            _ = state.shutdown.cancelled() => {
                let _ = ws_tx.send(Message::Close(None)).await;
                break;
            }
            result = rx.recv() => {
                let closed = matches!(result, Err(broadcast::error::RecvError::Closed));
                if let Some(event) = to_event(result) {
                    let text = match serde_json::to_string(&event) {
                        Ok(text) => text,
                        Err(e) => {
                            warn!("Failed to encode push event: {}", e);
                            continue;
                        }
                    };
                    if ws_tx.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                if closed {
                    break;
                }
            }
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(Message::Ping(data))) => {
                        let _ = ws_tx.send(Message::Pong(data)).await;
                    }
                    Some(Err(_)) => break,
                    _ => {} // Subscribers have nothing to say
                }
            }
        }
    }
}
