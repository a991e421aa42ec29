//! Command protocol types for cloud → edge control
//!
//! Commands travel cloud → edge over the push channel as a [`CommandEnvelope`]
//! carrying a verb plus JSON params. The edge answers out of band with a
//! [`CommandAck`] correlated by `command_id`. Params are parsed into the typed
//! [`EdgeCommand`] union at both ends so nothing downstream probes maps.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;

use crate::camera::CameraSlot;
use crate::error::ControlError;
use crate::profile::QualityProfile;
use crate::protocol::COMMAND_TIMEOUT_MS;
use crate::vehicle::VehicleKey;

/// A string wrapper that redacts its contents in Debug output.
///
/// Used for stream keys and device tokens so they never reach the logs.
/// Serializes/deserializes transparently as a plain string.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RedactedString(pub String);

impl RedactedString {
    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Debug for RedactedString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"***\"")
    }
}

impl From<String> for RedactedString {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for RedactedString {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Correlation token binding a command to its eventual ACK.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommandId(pub String);

impl CommandId {
    /// Mint a fresh random id.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CommandId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CommandId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Who asked for a quality profile change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProfileOrigin {
    /// Operator or pit crew; sets the auto-quality ceiling.
    #[default]
    Manual,
    /// The edge health controller.
    Auto,
}

/// All supported edge commands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EdgeCommand {
    /// Launch the encoder on a camera
    StartStream {
        camera: CameraSlot,
        profile: Option<QualityProfile>,
    },
    /// Stop the encoder
    StopStream,
    /// Restart the encoder on a different camera
    SetActiveCamera { camera: CameraSlot },
    /// Restart the encoder with a different quality profile
    SetProfile {
        profile: QualityProfile,
        origin: ProfileOrigin,
    },
    /// Report supervisor status in the ACK data
    GetStatus,
    /// Clear a paused supervisor and its failure counters
    ResetSupervisor,
}

impl EdgeCommand {
    pub fn verb(&self) -> &'static str {
        match self {
            EdgeCommand::StartStream { .. } => "start_stream",
            EdgeCommand::StopStream => "stop_stream",
            EdgeCommand::SetActiveCamera { .. } => "set_active_camera",
            EdgeCommand::SetProfile { .. } => "set_profile",
            EdgeCommand::GetStatus => "get_status",
            EdgeCommand::ResetSupervisor => "reset_supervisor",
        }
    }

    /// Wire params for this command.
    pub fn params(&self) -> Value {
        match self {
            EdgeCommand::StartStream { camera, profile } => match profile {
                Some(p) => json!({ "camera": camera, "profile": p }),
                None => json!({ "camera": camera }),
            },
            EdgeCommand::SetActiveCamera { camera } => json!({ "camera": camera }),
            EdgeCommand::SetProfile { profile, origin } => {
                json!({ "profile": profile, "origin": origin })
            }
            EdgeCommand::StopStream | EdgeCommand::GetStatus | EdgeCommand::ResetSupervisor => {
                json!({})
            }
        }
    }

    /// Validate a verb + params pair into a typed command.
    ///
    /// Camera names go through legacy-alias normalization here, so callers
    /// may pass `pov` or `roof` and get the canonical slot.
    pub fn parse(verb: &str, params: &Value) -> Result<Self, ControlError> {
        match verb {
            "start_stream" => Ok(EdgeCommand::StartStream {
                camera: camera_param(verb, params)?,
                profile: profile_param(verb, params)?,
            }),
            "stop_stream" => Ok(EdgeCommand::StopStream),
            "set_active_camera" | "set_camera" | "switch_camera" => {
                Ok(EdgeCommand::SetActiveCamera {
                    camera: camera_param(verb, params)?,
                })
            }
            "set_profile" | "switch_profile" => {
                let profile = profile_param(verb, params)?.ok_or_else(|| {
                    ControlError::InvalidParams {
                        command: verb.to_string(),
                        message: "missing 'profile'".into(),
                    }
                })?;
                let origin = match params.get("origin") {
                    None | Some(Value::Null) => ProfileOrigin::Manual,
                    Some(v) => serde_json::from_value(v.clone()).map_err(|e| {
                        ControlError::InvalidParams {
                            command: verb.to_string(),
                            message: format!("bad 'origin': {}", e),
                        }
                    })?,
                };
                Ok(EdgeCommand::SetProfile { profile, origin })
            }
            "get_status" => Ok(EdgeCommand::GetStatus),
            "reset_supervisor" => Ok(EdgeCommand::ResetSupervisor),
            other => Err(ControlError::UnknownCommand(other.to_string())),
        }
    }
}

fn camera_param(verb: &str, params: &Value) -> Result<CameraSlot, ControlError> {
    let name = params
        .get("camera")
        .and_then(Value::as_str)
        .ok_or_else(|| ControlError::InvalidParams {
            command: verb.to_string(),
            message: "missing 'camera'".into(),
        })?;
    name.parse()
}

fn profile_param(verb: &str, params: &Value) -> Result<Option<QualityProfile>, ControlError> {
    match params.get("profile") {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => s.parse().map(Some),
        Some(_) => Err(ControlError::InvalidParams {
            command: verb.to_string(),
            message: "'profile' must be a string".into(),
        }),
    }
}

/// What the edge receives on its push feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandEnvelope {
    pub command_id: CommandId,
    pub command: String,
    #[serde(default)]
    pub params: Value,
    pub sent_at: u64,
}

impl CommandEnvelope {
    pub fn new(command_id: CommandId, command: &EdgeCommand, sent_at: u64) -> Self {
        Self {
            command_id,
            command: command.verb().to_string(),
            params: command.params(),
            sent_at,
        }
    }

    /// Parse the verb + params back into a typed command.
    pub fn decode(&self) -> Result<EdgeCommand, ControlError> {
        EdgeCommand::parse(&self.command, &self.params)
    }
}

/// Result reported by the edge for one command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AckStatus {
    Success,
    Error,
}

/// Edge → cloud command response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandAck {
    pub command_id: CommandId,
    pub status: AckStatus,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl CommandAck {
    pub fn success(command_id: CommandId, message: impl Into<String>) -> Self {
        Self {
            command_id,
            status: AckStatus::Success,
            message: message.into(),
            data: None,
        }
    }

    pub fn error(command_id: CommandId, message: impl Into<String>) -> Self {
        Self {
            command_id,
            status: AckStatus::Error,
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn is_success(&self) -> bool {
        self.status == AckStatus::Success
    }
}

/// Lifecycle of a CommandRecord.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandStatus {
    Pending,
    Success,
    Error,
    Timeout,
}

/// Which component is waiting on a command's ACK.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandOwner {
    Stream,
    CameraSwitch,
    ProfileSwitch,
    Dispatch,
}

/// Correlation ledger entry, one per command id.
///
/// Written once at creation and transitions status at most once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandRecord {
    pub command_id: CommandId,
    #[serde(flatten)]
    pub vehicle: VehicleKey,
    pub owner: CommandOwner,
    pub command: String,
    pub params: Value,
    pub status: CommandStatus,
    pub sent_at: u64,
    pub responded_at: Option<u64>,
    pub message: Option<String>,
    pub data: Option<Value>,
}

impl CommandRecord {
    pub fn new(vehicle: VehicleKey, owner: CommandOwner, envelope: &CommandEnvelope) -> Self {
        Self {
            command_id: envelope.command_id.clone(),
            vehicle,
            owner,
            command: envelope.command.clone(),
            params: envelope.params.clone(),
            status: CommandStatus::Pending,
            sent_at: envelope.sent_at,
            responded_at: None,
            message: None,
            data: None,
        }
    }

    /// Status as seen at `now_ms`: a pending record past the command
    /// timeout reads as `Timeout`.
    pub fn status_at(&self, now_ms: u64) -> CommandStatus {
        if self.status == CommandStatus::Pending
            && now_ms > self.sent_at.saturating_add(COMMAND_TIMEOUT_MS)
        {
            CommandStatus::Timeout
        } else {
            self.status
        }
    }

    /// Apply an ACK. Returns false when the record already left `Pending`.
    pub fn resolve(&mut self, ack: &CommandAck, now_ms: u64) -> bool {
        if self.status != CommandStatus::Pending {
            return false;
        }
        self.status = match ack.status {
            AckStatus::Success => CommandStatus::Success,
            AckStatus::Error => CommandStatus::Error,
        };
        self.responded_at = Some(now_ms);
        self.message = Some(ack.message.clone());
        self.data = ack.data.clone();
        true
    }
}
