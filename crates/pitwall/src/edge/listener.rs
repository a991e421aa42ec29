//! Edge side of the command push channel
//!
//! Holds a WebSocket open to the cloud's `/ws/edge`, authenticated with the
//! truck token, and forwards every `edge_command` frame to the agent.
//! Reconnects forever with jittered backoff; the attempt counter resets
//! after each successful connect.

use anyhow::{Context, Result};
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::backoff::BackoffPolicy;
use crate::command::{CommandEnvelope, RedactedString};
use crate::event::PushEvent;
use crate::protocol::TRUCK_TOKEN_HEADER;

/// `http(s)://host` → `ws(s)://host/ws/edge`
pub fn edge_feed_url(cloud_url: &str) -> String {
    let base = cloud_url.trim_end_matches('/');
    let base = if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{}", rest)
    } else if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{}", rest)
    } else {
        base.to_string()
    };
    format!("{}/ws/edge", base)
}

enum SessionEnd {
    /// Shutdown requested or nobody left to hand commands to
    Finished,
    /// The cloud closed the socket or it dropped
    Dropped,
}

pub struct CommandListener {
    url: String,
    token: RedactedString,
    backoff: BackoffPolicy,
    commands: mpsc::Sender<CommandEnvelope>,
}

impl CommandListener {
    pub fn new(
        cloud_url: &str,
        token: RedactedString,
        commands: mpsc::Sender<CommandEnvelope>,
    ) -> Self {
        Self {
            url: edge_feed_url(cloud_url),
            token,
            backoff: BackoffPolicy::reconnect(),
            commands,
        }
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    /// Connect/reconnect loop. Returns on cancellation.
    pub async fn run(self, cancel: CancellationToken) {
        let mut attempt = 0u32;
        loop {
            match self.session(&cancel, &mut attempt).await {
                Ok(SessionEnd::Finished) => return,
                Ok(SessionEnd::Dropped) => info!("Command channel closed"),
                Err(e) => warn!("Command channel error: {:#}", e),
            }

            let delay = self.backoff.delay(attempt);
            attempt = attempt.saturating_add(1);
            info!(
                attempt,
                "Reconnecting command channel in {:.1}s",
                delay.as_secs_f64()
            );
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn session(&self, cancel: &CancellationToken, attempt: &mut u32) -> Result<SessionEnd> {
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .with_context(|| format!("Invalid command channel URL {}", self.url))?;
        request.headers_mut().insert(
            TRUCK_TOKEN_HEADER,
            HeaderValue::from_str(self.token.expose()).context("Truck token is not a valid header")?,
        );

        let (mut ws, _response) = tokio::select! {
            _ = cancel.cancelled() => return Ok(SessionEnd::Finished),
            conn = tokio_tungstenite::connect_async(request) => {
                conn.with_context(|| format!("Failed to connect to {}", self.url))?
            }
        };
        info!(url = %self.url, "Command channel connected");
        *attempt = 0;

        loop {
            let msg = tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = ws.close(None).await;
                    return Ok(SessionEnd::Finished);
                }
                msg = ws.next() => msg,
            };
            let text = match msg {
                Some(Ok(Message::Text(text))) => text,
                Some(Ok(Message::Close(_))) | None => return Ok(SessionEnd::Dropped),
                // Pings are answered by tungstenite
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(e).context("Command channel read failed"),
            };

            match serde_json::from_str::<PushEvent>(text.as_str()) {
                Ok(PushEvent::EdgeCommand { command, .. }) => {
                    debug!(
                        command_id = %command.command_id,
                        command = %command.command,
                        "Command received"
                    );
                    if self.commands.send(command).await.is_err() {
                        return Ok(SessionEnd::Finished);
                    }
                }
                Ok(other) => debug!(event = other.name(), "Ignoring push event"),
                Err(e) => warn!(error = %e, "Unparseable push frame"),
            }
        }
    }
}
