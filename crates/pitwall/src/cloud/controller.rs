//! Vehicle stream controller
//!
//! Authoritative per-(event, vehicle) stream state machine. Every mutation
//! goes through one of the transition functions below, each of which runs as
//! a single atomic update on the vehicle's entry in the state store.
//!
//! ```text
//!              heartbeat (not live)          start ACK ok
//! DISCONNECTED ──────────────────▶ IDLE ──▶ STARTING ──────▶ STREAMING
//!      ▲  │ heartbeat (live)                   │ ACK err/timeout  │ stop
//!      │  └────────────────────────────────────┼──────────────────┤
//!      │                                       ▼                  ▼
//!   stale (30s)                              ERROR ◀────────── STOPPING ──▶ IDLE
//! ```
//!
//! Time is always passed in (epoch ms). Staleness and command timeouts are
//! applied lazily on every read and write, and by the periodic sweeper.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::camera::CameraSlot;
use crate::cloud::events::EventBus;
use crate::cloud::transport::CommandTransport;
use crate::command::{CommandId, CommandOwner, CommandRecord, CommandStatus, EdgeCommand};
use crate::error::{ControlError, StreamErrorReason};
use crate::event::PushEvent;
use crate::protocol::{COMMAND_TIMEOUT_MS, HEARTBEAT_STALE_MS};
use crate::state::{Heartbeat, StreamController, StreamPhase, StreamState, StreamingStatus};
use crate::store::{KeyedStore, MemoryStore};
use crate::vehicle::VehicleKey;

/// Owner of every vehicle's [`StreamState`].
pub struct VehicleStreamController {
    states: Arc<dyn KeyedStore<VehicleKey, StreamState>>,
    heartbeats: Arc<dyn KeyedStore<VehicleKey, Heartbeat>>,
    transport: CommandTransport,
    events: EventBus,
}

/// Apply time-driven transitions. Returns true if anything changed.
fn evaluate(state: &mut StreamState, now_ms: u64) -> bool {
    let stale = match state.last_heartbeat_at {
        Some(at) => now_ms.saturating_sub(at) >= HEARTBEAT_STALE_MS,
        None => true,
    };
    if stale && !matches!(state.state, StreamPhase::Disconnected | StreamPhase::Error) {
        state.state = StreamPhase::Disconnected;
        state.error_reason = Some(StreamErrorReason::EdgeDisconnected);
        state.error_message = Some(format!("No heartbeat for {}s", HEARTBEAT_STALE_MS / 1000));
        state.clear_pending();
        return true;
    }

    if state.state.is_transitioning() {
        let expired = state
            .pending_since
            .is_some_and(|since| now_ms > since.saturating_add(COMMAND_TIMEOUT_MS));
        if expired {
            let id = state
                .pending_command_id
                .as_ref()
                .map(|id| id.to_string())
                .unwrap_or_default();
            let verb = if state.state == StreamPhase::Starting {
                "start"
            } else {
                "stop"
            };
            state.fail(
                StreamErrorReason::EdgeTimeout,
                format!(
                    "Edge did not acknowledge {} command {} within {}s",
                    verb,
                    id,
                    COMMAND_TIMEOUT_MS / 1000
                ),
            );
            return true;
        }
    }
    false
}

/// Reconcile local state with a fresh edge self-report.
fn reconcile(state: &mut StreamState, hb: &Heartbeat, now_ms: u64) {
    let live = hb.is_live();
    match state.state {
        StreamPhase::Disconnected => {
            state.clear_error();
            if live {
                adopt_live(state, hb, now_ms);
            } else {
                state.state = StreamPhase::Idle;
                state.started_at = None;
            }
        }
        // Desync repair: the edge is streaming on its own.
        StreamPhase::Idle | StreamPhase::Error if live => {
            state.clear_error();
            adopt_live(state, hb, now_ms);
        }
        StreamPhase::Streaming => match hb.streaming_status {
            StreamingStatus::Live => {
                if let Some(camera) = hb.camera() {
                    state.source_id = Some(camera);
                }
            }
            StreamingStatus::Idle => {
                state.state = StreamPhase::Idle;
                state.started_at = None;
            }
            StreamingStatus::Paused => {
                state.fail(
                    StreamErrorReason::EncoderProcessFailed,
                    "Encoder paused on edge after repeated failures",
                );
                state.started_at = None;
            }
            // Supervisor is restarting the encoder; still our stream.
            StreamingStatus::Starting | StreamingStatus::Error => {}
        },
        StreamPhase::Idle
        | StreamPhase::Error
        | StreamPhase::Starting
        | StreamPhase::Stopping => {}
    }
}

fn adopt_live(state: &mut StreamState, hb: &Heartbeat, now_ms: u64) {
    state.state = StreamPhase::Streaming;
    state.source_id = hb.camera().or(state.source_id);
    state.started_at = hb.started_at.or(state.started_at).or(Some(now_ms));
}

fn observable(state: &StreamState) -> (StreamPhase, Option<CameraSlot>, Option<StreamErrorReason>) {
    (state.state, state.source_id, state.error_reason)
}

impl VehicleStreamController {
    pub fn new(transport: CommandTransport, events: EventBus) -> Self {
        Self {
            states: Arc::new(MemoryStore::new()),
            heartbeats: Arc::new(MemoryStore::new()),
            transport,
            events,
        }
    }

    pub fn with_stores(
        states: Arc<dyn KeyedStore<VehicleKey, StreamState>>,
        heartbeats: Arc<dyn KeyedStore<VehicleKey, Heartbeat>>,
        transport: CommandTransport,
        events: EventBus,
    ) -> Self {
        Self {
            states,
            heartbeats,
            transport,
            events,
        }
    }

    /// Run `f` atomically on the vehicle's state, publishing a
    /// `stream_state_change` if the observable state moved.
    fn transition(
        &self,
        key: &VehicleKey,
        now_ms: u64,
        mut f: impl FnMut(&mut StreamState),
    ) -> StreamState {
        let mut snapshot = StreamState::default();
        let mut changed = false;
        self.states.update(key, now_ms, &mut |slot| {
            let state = slot.get_or_insert_with(StreamState::default);
            let before = observable(state);
            evaluate(state, now_ms);
            f(state);
            changed = observable(state) != before;
            snapshot = state.clone();
        });

        if changed {
            info!(
                vehicle = %key,
                state = %snapshot.state,
                source = ?snapshot.source_id,
                reason = ?snapshot.error_reason,
                "Stream state changed"
            );
            self.events.publish(PushEvent::state_change(key, &snapshot));
        }
        snapshot
    }

    /// Whether the vehicle's last heartbeat is fresh.
    pub fn is_connected(&self, key: &VehicleKey, now_ms: u64) -> bool {
        self.states
            .get(key, now_ms)
            .and_then(|s| s.last_heartbeat_at)
            .is_some_and(|at| now_ms.saturating_sub(at) < HEARTBEAT_STALE_MS)
    }

    pub fn last_heartbeat(&self, key: &VehicleKey, now_ms: u64) -> Option<Heartbeat> {
        self.heartbeats.get(key, now_ms)
    }

    /// Ingest an edge heartbeat.
    pub fn on_heartbeat(&self, key: &VehicleKey, hb: Heartbeat, now_ms: u64) -> StreamState {
        let mut latest = Some(hb.clone());
        self.heartbeats
            .update(key, now_ms, &mut |slot| *slot = latest.take());

        let state = self.transition(key, now_ms, |state| {
            state.last_heartbeat_at = Some(now_ms);
            reconcile(state, &hb, now_ms);
        });
        debug!(vehicle = %key, state = %state.state, edge = ?hb.streaming_status, "Heartbeat");
        state
    }

    /// Current state with staleness and timeouts applied.
    pub fn get_state(&self, key: &VehicleKey, now_ms: u64) -> StreamState {
        match self.states.get(key, now_ms) {
            Some(_) => self.transition(key, now_ms, |_| ()),
            None => StreamState::default(),
        }
    }

    /// Check a start request against what the edge last reported.
    fn validate_start(&self, key: &VehicleKey, camera: CameraSlot, now_ms: u64) -> Result<(), ControlError> {
        let hb = self
            .last_heartbeat(key, now_ms)
            .ok_or_else(|| ControlError::EdgeOffline(key.to_string()))?;
        let available = hb.available_cameras();
        if !available.is_empty() && !available.contains(&camera) {
            return Err(ControlError::CameraUnavailable(camera.to_string()));
        }
        if !hb.youtube_configured {
            return Err(ControlError::EncoderKeyNotConfigured(key.to_string()));
        }
        Ok(())
    }

    /// `IDLE/STREAMING → STARTING`.
    pub fn start_stream(
        &self,
        key: &VehicleKey,
        camera: &str,
        controller: StreamController,
        now_ms: u64,
    ) -> Result<CommandId, ControlError> {
        let camera: CameraSlot = camera.parse()?;
        self.validate_start(key, camera, now_ms)?;

        let id = CommandId::generate();
        let mut accepted = Ok(());
        self.transition(key, now_ms, |state| {
            accepted = match state.state {
                StreamPhase::Idle | StreamPhase::Streaming => {
                    state.state = StreamPhase::Starting;
                    state.controller = Some(controller);
                    state.pending_command_id = Some(id.clone());
                    state.pending_since = Some(now_ms);
                    state.clear_error();
                    Ok(())
                }
                StreamPhase::Disconnected => Err(ControlError::EdgeOffline(key.to_string())),
                other => Err(ControlError::InvalidTransition {
                    action: "start",
                    state: other.to_string(),
                }),
            };
        });
        accepted?;

        self.transport.send_with_id(
            key,
            id.clone(),
            &EdgeCommand::StartStream {
                camera,
                profile: None,
            },
            CommandOwner::Stream,
            now_ms,
        );
        Ok(id)
    }

    /// `STREAMING → STOPPING`. Any controller may stop any stream.
    pub fn stop_stream(
        &self,
        key: &VehicleKey,
        controller: StreamController,
        now_ms: u64,
    ) -> Result<CommandId, ControlError> {
        let id = CommandId::generate();
        let mut accepted = Ok(());
        self.transition(key, now_ms, |state| {
            accepted = match state.state {
                StreamPhase::Streaming => {
                    if state.controller.is_some_and(|c| c != controller) {
                        debug!(
                            vehicle = %key,
                            previous = ?state.controller,
                            by = ?controller,
                            "Stop issued by a different controller"
                        );
                    }
                    state.state = StreamPhase::Stopping;
                    state.controller = Some(controller);
                    state.pending_command_id = Some(id.clone());
                    state.pending_since = Some(now_ms);
                    Ok(())
                }
                StreamPhase::Disconnected => Err(ControlError::EdgeOffline(key.to_string())),
                other => Err(ControlError::InvalidTransition {
                    action: "stop",
                    state: other.to_string(),
                }),
            };
        });
        accepted?;

        self.transport.send_with_id(
            key,
            id.clone(),
            &EdgeCommand::StopStream,
            CommandOwner::Stream,
            now_ms,
        );
        Ok(id)
    }

    /// Apply a correlated ACK for a start or stop command.
    ///
    /// Ignored unless the record's id is the state's current pending id.
    pub fn apply_ack(&self, key: &VehicleKey, record: &CommandRecord, now_ms: u64) -> StreamState {
        let requested_camera = match record.command.as_str() {
            "start_stream" => record
                .params
                .get("camera")
                .and_then(|c| c.as_str())
                .and_then(CameraSlot::normalize),
            _ => None,
        };
        let success = record.status == CommandStatus::Success;
        let message = record.message.clone().unwrap_or_default();

        let mut applied = false;
        let state = self.transition(key, now_ms, |state| {
            if state.pending_command_id.as_ref() != Some(&record.command_id) {
                return;
            }
            applied = true;
            match (state.state, success) {
                (StreamPhase::Starting, true) => {
                    state.state = StreamPhase::Streaming;
                    state.started_at = Some(now_ms);
                    if requested_camera.is_some() {
                        state.source_id = requested_camera;
                    }
                    state.clear_pending();
                    state.clear_error();
                }
                (StreamPhase::Stopping, true) => {
                    state.state = StreamPhase::Idle;
                    state.started_at = None;
                    state.clear_pending();
                    state.clear_error();
                }
                (StreamPhase::Starting | StreamPhase::Stopping, false) => {
                    let reason = StreamErrorReason::classify_ack_message(&message);
                    let text = if message.trim().is_empty() {
                        "Edge reported failure without a message".to_string()
                    } else {
                        message.clone()
                    };
                    state.fail(reason, text);
                }
                _ => state.clear_pending(),
            }
        });

        if !applied {
            warn!(
                vehicle = %key,
                command_id = %record.command_id,
                pending = ?state.pending_command_id,
                "Discarding stale stream ACK"
            );
        }
        state
    }

    /// Point `source_id` at a camera the edge confirmed switching to.
    pub fn force_source(&self, key: &VehicleKey, camera: CameraSlot, now_ms: u64) -> StreamState {
        self.transition(key, now_ms, |state| state.source_id = Some(camera))
    }

    /// Clear an `ERROR` and fall back to `IDLE` or `DISCONNECTED`.
    ///
    /// Never re-issues the failed command.
    pub fn retry_from_error(&self, key: &VehicleKey, now_ms: u64) -> Result<StreamState, ControlError> {
        let connected = self.is_connected(key, now_ms);
        let mut result = Ok(());
        let state = self.transition(key, now_ms, |state| {
            if state.state != StreamPhase::Error {
                result = Err(ControlError::InvalidTransition {
                    action: "retry",
                    state: state.state.to_string(),
                });
                return;
            }
            state.clear_error();
            state.clear_pending();
            state.started_at = None;
            state.state = if connected {
                StreamPhase::Idle
            } else {
                StreamPhase::Disconnected
            };
        });
        result.map(|_| state)
    }

    /// Apply time-driven transitions to every known vehicle.
    ///
    /// Returns the number of vehicles whose state changed.
    pub fn sweep(&self, now_ms: u64) -> usize {
        let mut changed = 0;
        for key in self.states.keys(now_ms) {
            let mut moved = None;
            self.states.update(&key, now_ms, &mut |slot| {
                if let Some(state) = slot.as_mut() {
                    if evaluate(state, now_ms) {
                        moved = Some(state.clone());
                    }
                }
            });
            if let Some(state) = moved {
                info!(vehicle = %key, state = %state.state, reason = ?state.error_reason, "Sweeper moved stream state");
                self.events.publish(PushEvent::state_change(&key, &state));
                changed += 1;
            }
        }
        changed
    }
}
