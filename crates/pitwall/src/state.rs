//! Per-vehicle stream state and the edge's self-report.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::camera::CameraSlot;
use crate::command::CommandId;
use crate::error::StreamErrorReason;
use crate::profile::QualityProfile;

/// Cloud-side lifecycle of one vehicle's stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StreamPhase {
    Disconnected,
    Idle,
    Starting,
    Streaming,
    Stopping,
    Error,
}

impl StreamPhase {
    /// Waiting on an ACK for a start or stop.
    pub fn is_transitioning(self) -> bool {
        matches!(self, StreamPhase::Starting | StreamPhase::Stopping)
    }
}

impl fmt::Display for StreamPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StreamPhase::Disconnected => "DISCONNECTED",
            StreamPhase::Idle => "IDLE",
            StreamPhase::Starting => "STARTING",
            StreamPhase::Streaming => "STREAMING",
            StreamPhase::Stopping => "STOPPING",
            StreamPhase::Error => "ERROR",
        };
        f.write_str(s)
    }
}

/// Who last acted on a stream. Informational only, never an authorization gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamController {
    #[default]
    Production,
    PitCrew,
    /// The edge's own health controller
    Auto,
}

/// Authoritative stream state for one (event, vehicle).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamState {
    pub state: StreamPhase,
    pub source_id: Option<CameraSlot>,
    pub controller: Option<StreamController>,
    pub pending_command_id: Option<CommandId>,
    /// When the pending command was issued (epoch ms)
    pub pending_since: Option<u64>,
    pub error_reason: Option<StreamErrorReason>,
    pub error_message: Option<String>,
    pub started_at: Option<u64>,
    pub last_heartbeat_at: Option<u64>,
}

impl Default for StreamState {
    fn default() -> Self {
        Self {
            state: StreamPhase::Disconnected,
            source_id: None,
            controller: None,
            pending_command_id: None,
            pending_since: None,
            error_reason: None,
            error_message: None,
            started_at: None,
            last_heartbeat_at: None,
        }
    }
}

impl StreamState {
    pub fn clear_pending(&mut self) {
        self.pending_command_id = None;
        self.pending_since = None;
    }

    pub fn clear_error(&mut self) {
        self.error_reason = None;
        self.error_message = None;
    }

    pub fn fail(&mut self, reason: StreamErrorReason, message: impl Into<String>) {
        self.state = StreamPhase::Error;
        self.error_reason = Some(reason);
        self.error_message = Some(message.into());
        self.clear_pending();
    }

    /// Operator hint for the current error, if any.
    pub fn remediation(&self) -> Option<&'static str> {
        self.error_reason.map(StreamErrorReason::remediation)
    }
}

/// Encoder status as reported by the edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamingStatus {
    Live,
    #[default]
    Idle,
    Starting,
    Error,
    Paused,
}

/// Periodic edge → cloud self-report.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Heartbeat {
    #[serde(default)]
    pub streaming_status: StreamingStatus,
    /// Raw camera name; normalized by the cloud on receipt.
    #[serde(default)]
    pub streaming_camera: Option<String>,
    #[serde(default)]
    pub cameras: Vec<String>,
    #[serde(default)]
    pub youtube_configured: bool,
    #[serde(default)]
    pub youtube_url: Option<String>,
    #[serde(default)]
    pub profile: Option<QualityProfile>,
    /// When the current encoder run started (epoch ms)
    #[serde(default)]
    pub started_at: Option<u64>,
    /// Supervisor snapshot, opaque to the cloud.
    #[serde(default)]
    pub supervisor: Option<serde_json::Value>,
}

impl Heartbeat {
    pub fn is_live(&self) -> bool {
        self.streaming_status == StreamingStatus::Live
    }

    pub fn camera(&self) -> Option<CameraSlot> {
        self.streaming_camera.as_deref().and_then(CameraSlot::normalize)
    }

    /// Cameras the edge says it has, normalized. Unknown names are skipped.
    pub fn available_cameras(&self) -> Vec<CameraSlot> {
        let mut slots: Vec<CameraSlot> = Vec::with_capacity(self.cameras.len());
        for slot in self.cameras.iter().filter_map(|c| CameraSlot::normalize(c)) {
            if !slots.contains(&slot) {
                slots.push(slot);
            }
        }
        slots
    }
}
