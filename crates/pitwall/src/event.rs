//! Outbound push events for edge and UI subscribers.

use serde::{Deserialize, Serialize};

use crate::camera::CameraSlot;
use crate::command::{CommandEnvelope, CommandId};
use crate::error::StreamErrorReason;
use crate::profile::QualityProfile;
use crate::state::{StreamPhase, StreamState};
use crate::vehicle::VehicleKey;

/// JSON push payload, tagged by `type` and keyed by vehicle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PushEvent {
    CameraSwitch {
        event_id: String,
        vehicle_id: String,
        camera: CameraSlot,
        request_id: CommandId,
    },
    ProfileSwitch {
        event_id: String,
        vehicle_id: String,
        profile: QualityProfile,
        request_id: CommandId,
    },
    FeaturedVehicle {
        event_id: String,
        vehicle_id: String,
    },
    StreamStateChange {
        event_id: String,
        vehicle_id: String,
        state: StreamPhase,
        source_id: Option<CameraSlot>,
        error_reason: Option<StreamErrorReason>,
        error_message: Option<String>,
    },
    EdgeCommand {
        event_id: String,
        vehicle_id: String,
        command: CommandEnvelope,
    },
}

impl PushEvent {
    pub fn name(&self) -> &'static str {
        match self {
            PushEvent::CameraSwitch { .. } => crate::protocol::EVENT_CAMERA_SWITCH,
            PushEvent::ProfileSwitch { .. } => "profile_switch",
            PushEvent::FeaturedVehicle { .. } => crate::protocol::EVENT_FEATURED_VEHICLE,
            PushEvent::StreamStateChange { .. } => crate::protocol::EVENT_STREAM_STATE_CHANGE,
            PushEvent::EdgeCommand { .. } => crate::protocol::EVENT_EDGE_COMMAND,
        }
    }

    pub fn vehicle(&self) -> VehicleKey {
        match self {
            PushEvent::CameraSwitch {
                event_id,
                vehicle_id,
                ..
            }
            | PushEvent::ProfileSwitch {
                event_id,
                vehicle_id,
                ..
            }
            | PushEvent::FeaturedVehicle {
                event_id,
                vehicle_id,
            }
            | PushEvent::StreamStateChange {
                event_id,
                vehicle_id,
                ..
            }
            | PushEvent::EdgeCommand {
                event_id,
                vehicle_id,
                ..
            } => VehicleKey::new(event_id.clone(), vehicle_id.clone()),
        }
    }

    pub fn state_change(key: &VehicleKey, state: &StreamState) -> Self {
        PushEvent::StreamStateChange {
            event_id: key.event_id.clone(),
            vehicle_id: key.vehicle_id.clone(),
            state: state.state,
            source_id: state.source_id,
            error_reason: state.error_reason,
            error_message: state.error_message.clone(),
        }
    }

    pub fn edge_command(key: &VehicleKey, command: CommandEnvelope) -> Self {
        PushEvent::EdgeCommand {
            event_id: key.event_id.clone(),
            vehicle_id: key.vehicle_id.clone(),
            command,
        }
    }
}
