//! Control plane: the cloud-side entry point
//!
//! Wires the transport, stream controller and switch managers together and
//! routes every correlated ACK to the component that owns its command id.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::camera::CameraSlot;
use crate::cloud::controller::VehicleStreamController;
use crate::cloud::directory::VehicleDirectory;
use crate::cloud::events::EventBus;
use crate::cloud::switch::{SwitchRequest, SwitchRequestManager, SwitchStatus, SwitchTicket};
use crate::cloud::transport::CommandTransport;
use crate::command::{
    CommandAck, CommandId, CommandOwner, CommandRecord, EdgeCommand, ProfileOrigin,
};
use crate::error::ControlError;
use crate::event::PushEvent;
use crate::profile::QualityProfile;
use crate::protocol::now_ms;
use crate::state::{Heartbeat, StreamController, StreamState};
use crate::vehicle::VehicleKey;

/// Control plane tunables.
#[derive(Debug, Clone)]
pub struct PlaneConfig {
    /// Minimum gap between switch requests for different values
    pub switch_min_interval_ms: u64,
    /// How often the sweeper applies staleness and timeouts
    pub sweep_interval: Duration,
}

impl Default for PlaneConfig {
    fn default() -> Self {
        Self {
            switch_min_interval_ms: 1_000,
            sweep_interval: Duration::from_secs(1),
        }
    }
}

/// Everything an operator sees for one vehicle.
#[derive(Debug, Clone, Serialize)]
pub struct VehicleStatus {
    pub stream: StreamState,
    pub remediation: Option<&'static str>,
    pub camera_switch: SwitchRequest<CameraSlot>,
    pub profile_switch: SwitchRequest<QualityProfile>,
}

/// Outcome of a generic command dispatch.
#[derive(Debug, Clone, Serialize)]
pub struct Dispatched {
    pub command_id: CommandId,
    pub status: &'static str,
}

pub struct ControlPlane {
    directory: Arc<dyn VehicleDirectory>,
    transport: CommandTransport,
    events: EventBus,
    controller: VehicleStreamController,
    cameras: SwitchRequestManager<CameraSlot>,
    profiles: SwitchRequestManager<QualityProfile>,
    config: PlaneConfig,
}

impl ControlPlane {
    pub fn new(directory: Arc<dyn VehicleDirectory>, config: PlaneConfig) -> Self {
        let transport = CommandTransport::new();
        let events = EventBus::new();
        Self {
            controller: VehicleStreamController::new(transport.clone(), events.clone()),
            cameras: SwitchRequestManager::new(transport.clone(), config.switch_min_interval_ms),
            profiles: SwitchRequestManager::new(transport.clone(), config.switch_min_interval_ms),
            directory,
            transport,
            events,
            config,
        }
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn transport(&self) -> &CommandTransport {
        &self.transport
    }

    pub fn controller(&self) -> &VehicleStreamController {
        &self.controller
    }

    /// Resolve an edge's device token to its vehicle.
    pub fn authenticate_edge(&self, token: &str) -> Option<VehicleKey> {
        self.directory.resolve_token(token)
    }

    fn ensure_registered(&self, key: &VehicleKey) -> Result<(), ControlError> {
        if self.directory.is_registered(key) {
            Ok(())
        } else {
            Err(ControlError::VehicleNotRegistered(key.to_string()))
        }
    }

    fn ensure_connected(&self, key: &VehicleKey, now_ms: u64) -> Result<(), ControlError> {
        if self.controller.is_connected(key, now_ms) {
            Ok(())
        } else {
            Err(ControlError::EdgeOffline(key.to_string()))
        }
    }

    pub fn handle_heartbeat(&self, key: &VehicleKey, hb: Heartbeat, now_ms: u64) -> StreamState {
        self.controller.on_heartbeat(key, hb, now_ms)
    }

    /// Correlate an ACK and hand it to the command's owner.
    pub fn handle_ack(&self, ack: &CommandAck, now_ms: u64) -> Option<CommandRecord> {
        let record = self.transport.receive_ack(ack, now_ms)?;
        let key = &record.vehicle;

        match record.owner {
            CommandOwner::Stream => {
                self.controller.apply_ack(key, &record, now_ms);
            }
            CommandOwner::CameraSwitch => {
                if let Some(req) = self.cameras.apply_ack(key, &record, now_ms) {
                    if let (SwitchStatus::Success, Some(camera)) = (req.status, req.active_value) {
                        self.controller.force_source(key, camera, now_ms);
                        self.events.publish(PushEvent::CameraSwitch {
                            event_id: key.event_id.clone(),
                            vehicle_id: key.vehicle_id.clone(),
                            camera,
                            request_id: record.command_id.clone(),
                        });
                    }
                }
            }
            CommandOwner::ProfileSwitch => {
                if let Some(req) = self.profiles.apply_ack(key, &record, now_ms) {
                    if let (SwitchStatus::Success, Some(profile)) = (req.status, req.active_value) {
                        self.events.publish(PushEvent::ProfileSwitch {
                            event_id: key.event_id.clone(),
                            vehicle_id: key.vehicle_id.clone(),
                            profile,
                            request_id: record.command_id.clone(),
                        });
                    }
                }
            }
            CommandOwner::Dispatch => {
                info!(
                    vehicle = %key,
                    command_id = %record.command_id,
                    command = %record.command,
                    status = ?record.status,
                    "Dispatched command answered"
                );
            }
        }
        Some(record)
    }

    /// Request a camera switch. Legacy camera names are accepted.
    pub fn switch_camera(
        &self,
        key: &VehicleKey,
        camera: &str,
        now_ms: u64,
    ) -> Result<SwitchTicket, ControlError> {
        let camera: CameraSlot = camera.parse()?;
        self.ensure_registered(key)?;
        self.ensure_connected(key, now_ms)?;
        if let Some(hb) = self.controller.last_heartbeat(key, now_ms) {
            let available = hb.available_cameras();
            if !available.is_empty() && !available.contains(&camera) {
                return Err(ControlError::CameraUnavailable(camera.to_string()));
            }
        }
        self.cameras.request_switch(
            key,
            camera,
            &EdgeCommand::SetActiveCamera { camera },
            now_ms,
        )
    }

    /// Request a quality profile change.
    pub fn switch_profile(
        &self,
        key: &VehicleKey,
        profile: &str,
        origin: ProfileOrigin,
        now_ms: u64,
    ) -> Result<SwitchTicket, ControlError> {
        let profile: QualityProfile = profile.parse()?;
        self.ensure_registered(key)?;
        self.ensure_connected(key, now_ms)?;
        self.profiles.request_switch(
            key,
            profile,
            &EdgeCommand::SetProfile { profile, origin },
            now_ms,
        )
    }

    pub fn start_stream(
        &self,
        key: &VehicleKey,
        camera: &str,
        controller: StreamController,
        now_ms: u64,
    ) -> Result<CommandId, ControlError> {
        self.ensure_registered(key)?;
        self.controller.start_stream(key, camera, controller, now_ms)
    }

    pub fn stop_stream(
        &self,
        key: &VehicleKey,
        controller: StreamController,
        now_ms: u64,
    ) -> Result<CommandId, ControlError> {
        self.ensure_registered(key)?;
        self.controller.stop_stream(key, controller, now_ms)
    }

    pub fn retry(&self, key: &VehicleKey, now_ms: u64) -> Result<StreamState, ControlError> {
        self.ensure_registered(key)?;
        self.controller.retry_from_error(key, now_ms)
    }

    /// Send any command verb, routed to the component that owns it.
    pub fn dispatch(
        &self,
        key: &VehicleKey,
        verb: &str,
        params: &Value,
        controller: StreamController,
        now_ms: u64,
    ) -> Result<Dispatched, ControlError> {
        let command = EdgeCommand::parse(verb, params)?;
        self.ensure_registered(key)?;

        let command_id = match command {
            EdgeCommand::StartStream { camera, .. } => {
                self.start_stream(key, camera.as_str(), controller, now_ms)?
            }
            EdgeCommand::StopStream => self.stop_stream(key, controller, now_ms)?,
            EdgeCommand::SetActiveCamera { camera } => {
                self.switch_camera(key, camera.as_str(), now_ms)?.request_id
            }
            EdgeCommand::SetProfile { profile, origin } => {
                self.switch_profile(key, profile.as_str(), origin, now_ms)?
                    .request_id
            }
            EdgeCommand::GetStatus | EdgeCommand::ResetSupervisor => {
                self.ensure_connected(key, now_ms)?;
                self.transport
                    .send(key, &command, CommandOwner::Dispatch, now_ms)
            }
        };
        debug!(vehicle = %key, command = verb, command_id = %command_id, "Dispatched");
        Ok(Dispatched {
            command_id,
            status: "pending",
        })
    }

    pub fn status(&self, key: &VehicleKey, now_ms: u64) -> Result<VehicleStatus, ControlError> {
        self.ensure_registered(key)?;
        let stream = self.controller.get_state(key, now_ms);
        Ok(VehicleStatus {
            remediation: stream.remediation(),
            stream,
            camera_switch: self.cameras.get_state(key, now_ms),
            profile_switch: self.profiles.get_state(key, now_ms),
        })
    }

    pub fn command(&self, id: &CommandId, now_ms: u64) -> Option<CommandRecord> {
        self.transport.record(id, now_ms)
    }

    /// Broadcast that a vehicle is the featured feed for its event.
    pub fn feature(&self, key: &VehicleKey) -> Result<(), ControlError> {
        self.ensure_registered(key)?;
        info!(vehicle = %key, "Featured vehicle");
        self.events.publish(PushEvent::FeaturedVehicle {
            event_id: key.event_id.clone(),
            vehicle_id: key.vehicle_id.clone(),
        });
        Ok(())
    }

    /// One sweeper pass.
    pub fn sweep(&self, now_ms: u64) {
        let moved = self.controller.sweep(now_ms);
        let purged = self.transport.purge(now_ms);
        if moved > 0 || purged > 0 {
            debug!(moved, purged, "Sweep");
        }
    }

    /// Run the sweeper until cancelled.
    pub async fn run_sweeper(self: Arc<Self>, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.sweep_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => self.sweep(now_ms()),
            }
        }
        debug!("Sweeper stopped");
    }
}
