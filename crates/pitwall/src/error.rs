//! Error taxonomy shared by the cloud and edge halves.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Rejections raised before anything is sent to an edge.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ControlError {
    #[error("Unknown camera '{0}' (expected main, cockpit, chase or suspension)")]
    InvalidCamera(String),

    #[error("Unknown quality profile '{0}'")]
    InvalidProfile(String),

    #[error("Camera '{0}' is not reported by the edge")]
    CameraUnavailable(String),

    #[error("Vehicle {0} is not registered for this event")]
    VehicleNotRegistered(String),

    #[error("Edge for vehicle {0} is not reachable")]
    EdgeOffline(String),

    #[error("Stream key is not configured on vehicle {0}")]
    EncoderKeyNotConfigured(String),

    #[error("Switch requested too soon, retry in {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    #[error("Cannot {action} while stream is {state}")]
    InvalidTransition { action: &'static str, state: String },

    #[error("Unknown command '{0}'")]
    UnknownCommand(String),

    #[error("Invalid parameters for '{command}': {message}")]
    InvalidParams { command: String, message: String },
}

impl ControlError {
    /// Machine-readable reason matching the stream error taxonomy.
    pub fn reason(&self) -> StreamErrorReason {
        match self {
            ControlError::InvalidCamera(_) | ControlError::CameraUnavailable(_) => {
                StreamErrorReason::InvalidSource
            }
            ControlError::EdgeOffline(_) => StreamErrorReason::EdgeDisconnected,
            ControlError::EncoderKeyNotConfigured(_) => StreamErrorReason::EncoderKeyNotConfigured,
            _ => StreamErrorReason::Unknown,
        }
    }
}

/// Why a stream ended up in `ERROR` (or `DISCONNECTED`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StreamErrorReason {
    EdgeTimeout,
    EdgeDisconnected,
    EdgeRejected,
    InvalidSource,
    EncoderKeyNotConfigured,
    EncoderProcessFailed,
    Unknown,
}

impl StreamErrorReason {
    pub fn as_str(self) -> &'static str {
        match self {
            StreamErrorReason::EdgeTimeout => "EDGE_TIMEOUT",
            StreamErrorReason::EdgeDisconnected => "EDGE_DISCONNECTED",
            StreamErrorReason::EdgeRejected => "EDGE_REJECTED",
            StreamErrorReason::InvalidSource => "INVALID_SOURCE",
            StreamErrorReason::EncoderKeyNotConfigured => "ENCODER_KEY_NOT_CONFIGURED",
            StreamErrorReason::EncoderProcessFailed => "ENCODER_PROCESS_FAILED",
            StreamErrorReason::Unknown => "UNKNOWN",
        }
    }

    /// What an operator should do about it.
    pub fn remediation(self) -> &'static str {
        match self {
            StreamErrorReason::EdgeTimeout => {
                "The edge did not answer in time. Check the vehicle's uplink, then retry."
            }
            StreamErrorReason::EdgeDisconnected => {
                "No heartbeat from the vehicle. Wait for it to reconnect or check its power and modem."
            }
            StreamErrorReason::EdgeRejected => {
                "The edge refused the command. Review the edge message and retry."
            }
            StreamErrorReason::InvalidSource => {
                "Pick one of the cameras the vehicle reports (main, cockpit, chase, suspension)."
            }
            StreamErrorReason::EncoderKeyNotConfigured => {
                "Set the stream key in the vehicle's streaming settings before starting."
            }
            StreamErrorReason::EncoderProcessFailed => {
                "The encoder crashed or was paused. Check the camera cable and credentials, then start again."
            }
            StreamErrorReason::Unknown => "Retry; if it keeps failing, check the edge logs.",
        }
    }

    /// Best-effort classification of an edge-supplied failure message.
    ///
    /// Substring rules are approximate; an unmatched non-empty message is
    /// treated as an explicit rejection.
    pub fn classify_ack_message(message: &str) -> StreamErrorReason {
        let msg = message.to_ascii_lowercase();
        if msg.trim().is_empty() {
            return StreamErrorReason::Unknown;
        }
        if msg.contains("timed out") || msg.contains("timeout") {
            StreamErrorReason::EdgeTimeout
        } else if msg.contains("stream key")
            || msg.contains("youtube")
            || msg.contains("rtmp url")
        {
            StreamErrorReason::EncoderKeyNotConfigured
        } else if msg.contains("camera")
            || msg.contains("source")
            || msg.contains("no such device")
            || msg.contains("device")
        {
            StreamErrorReason::InvalidSource
        } else if msg.contains("ffmpeg")
            || msg.contains("encoder")
            || msg.contains("process")
            || msg.contains("exited")
            || msg.contains("paused")
        {
            StreamErrorReason::EncoderProcessFailed
        } else {
            StreamErrorReason::EdgeRejected
        }
    }
}

impl fmt::Display for StreamErrorReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
