//! Idempotent switch requests
//!
//! One [`SwitchRequestManager`] per kind (camera, quality profile). Each
//! vehicle holds at most one [`SwitchRequest`] per kind; a request for a new
//! value supersedes the old one, a repeat of the pending value collapses
//! onto it.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::camera::CameraSlot;
use crate::cloud::transport::CommandTransport;
use crate::command::{CommandId, CommandOwner, CommandRecord, CommandStatus, EdgeCommand};
use crate::error::ControlError;
use crate::profile::QualityProfile;
use crate::protocol::COMMAND_TIMEOUT_MS;
use crate::store::{KeyedStore, MemoryStore};
use crate::vehicle::VehicleKey;

/// A value a switch request can target.
pub trait SwitchValue:
    Copy + PartialEq + fmt::Debug + fmt::Display + Send + Sync + 'static
{
    /// Label used in logs and error messages
    const KIND: &'static str;
    /// Ledger owner for commands issued by this kind of request
    const OWNER: CommandOwner;
}

impl SwitchValue for CameraSlot {
    const KIND: &'static str = "camera";
    const OWNER: CommandOwner = CommandOwner::CameraSwitch;
}

impl SwitchValue for QualityProfile {
    const KIND: &'static str = "profile";
    const OWNER: CommandOwner = CommandOwner::ProfileSwitch;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SwitchStatus {
    Pending,
    Success,
    Failed,
    Timeout,
    /// Nothing requested yet
    #[default]
    Idle,
}

/// Desired vs. confirmed value for one (vehicle, kind).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwitchRequest<T> {
    pub desired_value: Option<T>,
    pub active_value: Option<T>,
    pub request_id: Option<CommandId>,
    pub status: SwitchStatus,
    pub last_error: Option<String>,
    pub timeout_at: Option<u64>,
    /// When the current request was minted (epoch ms)
    pub requested_at: Option<u64>,
}

impl<T> Default for SwitchRequest<T> {
    fn default() -> Self {
        Self {
            desired_value: None,
            active_value: None,
            request_id: None,
            status: SwitchStatus::Idle,
            last_error: None,
            timeout_at: None,
            requested_at: None,
        }
    }
}

impl<T> SwitchRequest<T> {
    /// Flip an expired pending request to `timeout`. Returns true if it did.
    fn expire(&mut self, now_ms: u64) -> bool {
        let expired = self.status == SwitchStatus::Pending
            && self.timeout_at.is_some_and(|at| now_ms > at);
        if expired {
            self.status = SwitchStatus::Timeout;
            self.last_error = Some(format!(
                "Switch request {} timed out after {}s without an edge acknowledgement",
                self.request_id
                    .as_ref()
                    .map(CommandId::as_str)
                    .unwrap_or("?"),
                COMMAND_TIMEOUT_MS / 1000
            ));
        }
        expired
    }
}

/// Result of a switch request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SwitchTicket {
    pub request_id: CommandId,
    pub status: SwitchStatus,
    /// True when the call collapsed onto an identical pending request
    pub deduplicated: bool,
}

pub struct SwitchRequestManager<T: SwitchValue> {
    requests: Arc<dyn KeyedStore<VehicleKey, SwitchRequest<T>>>,
    transport: CommandTransport,
    /// Minimum gap between minting requests for different values
    min_interval_ms: u64,
}

impl<T: SwitchValue> SwitchRequestManager<T> {
    pub fn new(transport: CommandTransport, min_interval_ms: u64) -> Self {
        Self::with_store(Arc::new(MemoryStore::new()), transport, min_interval_ms)
    }

    pub fn with_store(
        requests: Arc<dyn KeyedStore<VehicleKey, SwitchRequest<T>>>,
        transport: CommandTransport,
        min_interval_ms: u64,
    ) -> Self {
        Self {
            requests,
            transport,
            min_interval_ms,
        }
    }

    /// Ask the edge to switch to `desired`, sending `command` if a new
    /// request is minted.
    pub fn request_switch(
        &self,
        key: &VehicleKey,
        desired: T,
        command: &EdgeCommand,
        now_ms: u64,
    ) -> Result<SwitchTicket, ControlError> {
        let fresh_id = CommandId::generate();
        let mut outcome: Result<SwitchTicket, ControlError> =
            Err(ControlError::UnknownCommand(T::KIND.to_string()));

        self.requests.update(key, now_ms, &mut |slot| {
            let req = slot.get_or_insert_with(SwitchRequest::default);
            req.expire(now_ms);

            if req.status == SwitchStatus::Pending && req.desired_value == Some(desired) {
                if let Some(id) = req.request_id.clone() {
                    outcome = Ok(SwitchTicket {
                        request_id: id,
                        status: SwitchStatus::Pending,
                        deduplicated: true,
                    });
                    return;
                }
            }

            if req.desired_value != Some(desired) {
                if let Some(at) = req.requested_at {
                    let elapsed = now_ms.saturating_sub(at);
                    if elapsed < self.min_interval_ms {
                        outcome = Err(ControlError::RateLimited {
                            retry_after_ms: self.min_interval_ms - elapsed,
                        });
                        return;
                    }
                }
            }

            req.desired_value = Some(desired);
            req.request_id = Some(fresh_id.clone());
            req.status = SwitchStatus::Pending;
            req.last_error = None;
            req.timeout_at = Some(now_ms + COMMAND_TIMEOUT_MS);
            req.requested_at = Some(now_ms);
            outcome = Ok(SwitchTicket {
                request_id: fresh_id.clone(),
                status: SwitchStatus::Pending,
                deduplicated: false,
            });
        });

        let ticket = outcome?;
        if ticket.deduplicated {
            debug!(
                vehicle = %key,
                kind = T::KIND,
                desired = %desired,
                request_id = %ticket.request_id,
                "Collapsed repeat switch onto pending request"
            );
        } else {
            info!(
                vehicle = %key,
                kind = T::KIND,
                desired = %desired,
                request_id = %ticket.request_id,
                "Switch requested"
            );
            self.transport.send_with_id(
                key,
                ticket.request_id.clone(),
                command,
                T::OWNER,
                now_ms,
            );
        }
        Ok(ticket)
    }

    /// Current request, with timeout evaluated at read time.
    pub fn get_state(&self, key: &VehicleKey, now_ms: u64) -> SwitchRequest<T> {
        let mut snapshot = SwitchRequest::default();
        self.requests.update(key, now_ms, &mut |slot| {
            if let Some(req) = slot.as_mut() {
                if req.expire(now_ms) {
                    debug!(vehicle = %key, kind = T::KIND, "Switch request timed out");
                }
                snapshot = req.clone();
            }
        });
        snapshot
    }

    /// Apply a correlated ACK.
    ///
    /// Returns the updated request when the ACK matched the current pending
    /// request; stale or late ACKs leave the request untouched.
    pub fn apply_ack(
        &self,
        key: &VehicleKey,
        record: &CommandRecord,
        now_ms: u64,
    ) -> Option<SwitchRequest<T>> {
        let mut applied = None;
        self.requests.update(key, now_ms, &mut |slot| {
            let Some(req) = slot.as_mut() else {
                return;
            };
            req.expire(now_ms);
            if req.request_id.as_ref() != Some(&record.command_id)
                || req.status != SwitchStatus::Pending
            {
                return;
            }
            if record.status == CommandStatus::Success {
                req.status = SwitchStatus::Success;
                req.active_value = req.desired_value;
                req.last_error = None;
            } else {
                req.status = SwitchStatus::Failed;
                req.last_error = Some(
                    record
                        .message
                        .clone()
                        .filter(|m| !m.trim().is_empty())
                        .unwrap_or_else(|| "Edge rejected the switch".to_string()),
                );
            }
            applied = Some(req.clone());
        });

        match &applied {
            Some(req) => info!(
                vehicle = %key,
                kind = T::KIND,
                status = ?req.status,
                active = ?req.active_value,
                "Switch request resolved"
            ),
            None => warn!(
                vehicle = %key,
                kind = T::KIND,
                command_id = %record.command_id,
                "Discarding stale switch ACK"
            ),
        }
        applied
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{CommandAck, ProfileOrigin};

    const T0: u64 = 5_000_000;

    fn key() -> VehicleKey {
        VehicleKey::new("race-1", "car-7")
    }

    fn camera_cmd(camera: CameraSlot) -> EdgeCommand {
        EdgeCommand::SetActiveCamera { camera }
    }

    fn manager() -> (CommandTransport, SwitchRequestManager<CameraSlot>) {
        let transport = CommandTransport::new();
        let manager = SwitchRequestManager::new(transport.clone(), 1_000);
        (transport, manager)
    }

    fn ack(transport: &CommandTransport, ack: CommandAck, now: u64) -> CommandRecord {
        transport.receive_ack(&ack, now).unwrap()
    }

    #[tokio::test]
    async fn repeat_request_collapses_onto_pending() {
        let (transport, mgr) = manager();
        let mut feed = transport.subscribe(&key());

        let a = mgr
            .request_switch(&key(), CameraSlot::Chase, &camera_cmd(CameraSlot::Chase), T0)
            .unwrap();
        let b = mgr
            .request_switch(&key(), CameraSlot::Chase, &camera_cmd(CameraSlot::Chase), T0 + 10)
            .unwrap();

        assert_eq!(a.request_id, b.request_id);
        assert!(!a.deduplicated);
        assert!(b.deduplicated);

        assert_eq!(feed.recv().await.unwrap().command_id, a.request_id);
        assert!(feed.try_recv().is_err(), "exactly one command pushed");
        assert!(transport.record(&a.request_id, T0 + 10).is_some());
    }

    #[test]
    fn success_ack_sets_active_value() {
        let (transport, mgr) = manager();
        let t = mgr
            .request_switch(&key(), CameraSlot::Cockpit, &camera_cmd(CameraSlot::Cockpit), T0)
            .unwrap();
        let rec = ack(&transport, CommandAck::success(t.request_id, "switched"), T0 + 200);
        let req = mgr.apply_ack(&key(), &rec, T0 + 200).unwrap();
        assert_eq!(req.status, SwitchStatus::Success);
        assert_eq!(req.active_value, Some(CameraSlot::Cockpit));
        assert!(req.last_error.is_none());
    }

    #[test]
    fn failure_ack_records_edge_message() {
        let (transport, mgr) = manager();
        let t = mgr
            .request_switch(&key(), CameraSlot::Cockpit, &camera_cmd(CameraSlot::Cockpit), T0)
            .unwrap();
        let rec = ack(
            &transport,
            CommandAck::error(t.request_id, "cockpit camera unplugged"),
            T0 + 200,
        );
        let req = mgr.apply_ack(&key(), &rec, T0 + 200).unwrap();
        assert_eq!(req.status, SwitchStatus::Failed);
        assert_eq!(req.active_value, None);
        assert_eq!(req.last_error.as_deref(), Some("cockpit camera unplugged"));
    }

    #[test]
    fn pending_reads_as_timeout_after_deadline() {
        let (_transport, mgr) = manager();
        let t = mgr
            .request_switch(&key(), CameraSlot::Main, &camera_cmd(CameraSlot::Main), T0)
            .unwrap();
        assert_eq!(
            mgr.get_state(&key(), T0 + COMMAND_TIMEOUT_MS).status,
            SwitchStatus::Pending
        );

        let req = mgr.get_state(&key(), T0 + COMMAND_TIMEOUT_MS + 1);
        assert_eq!(req.status, SwitchStatus::Timeout);
        assert!(req.last_error.unwrap().contains(t.request_id.as_str()));
    }

    #[test]
    fn stale_ack_does_not_touch_newer_request() {
        let (transport, mgr) = manager();
        let first = mgr
            .request_switch(&key(), CameraSlot::Main, &camera_cmd(CameraSlot::Main), T0)
            .unwrap();
        let second = mgr
            .request_switch(&key(), CameraSlot::Chase, &camera_cmd(CameraSlot::Chase), T0 + 2_000)
            .unwrap();
        assert_ne!(first.request_id, second.request_id);

        let rec = ack(&transport, CommandAck::success(first.request_id, "ok"), T0 + 2_100);
        assert!(mgr.apply_ack(&key(), &rec, T0 + 2_100).is_none());

        let req = mgr.get_state(&key(), T0 + 2_100);
        assert_eq!(req.status, SwitchStatus::Pending);
        assert_eq!(req.desired_value, Some(CameraSlot::Chase));
        assert_eq!(req.active_value, None);
    }

    #[test]
    fn different_value_too_soon_is_rate_limited() {
        let (_transport, mgr) = manager();
        mgr.request_switch(&key(), CameraSlot::Main, &camera_cmd(CameraSlot::Main), T0)
            .unwrap();
        let err = mgr
            .request_switch(&key(), CameraSlot::Chase, &camera_cmd(CameraSlot::Chase), T0 + 400)
            .unwrap_err();
        assert_eq!(err, ControlError::RateLimited { retry_after_ms: 600 });
        assert!(mgr
            .request_switch(&key(), CameraSlot::Chase, &camera_cmd(CameraSlot::Chase), T0 + 1_000)
            .is_ok());
    }

    #[test]
    fn same_value_after_resolution_mints_new_request() {
        let (transport, mgr) = manager();
        let t = mgr
            .request_switch(&key(), CameraSlot::Main, &camera_cmd(CameraSlot::Main), T0)
            .unwrap();
        let rec = ack(&transport, CommandAck::error(t.request_id.clone(), "busy"), T0 + 100);
        mgr.apply_ack(&key(), &rec, T0 + 100);

        let again = mgr
            .request_switch(&key(), CameraSlot::Main, &camera_cmd(CameraSlot::Main), T0 + 200)
            .unwrap();
        assert!(!again.deduplicated);
        assert_ne!(again.request_id, t.request_id);
    }

    #[test]
    fn idle_when_nothing_requested() {
        let (_transport, mgr) = manager();
        assert_eq!(mgr.get_state(&key(), T0).status, SwitchStatus::Idle);
    }

    #[test]
    fn profile_requests_use_profile_owner() {
        let transport = CommandTransport::new();
        let mgr: SwitchRequestManager<QualityProfile> =
            SwitchRequestManager::new(transport.clone(), 0);
        let t = mgr
            .request_switch(
                &key(),
                QualityProfile::Sd480,
                &EdgeCommand::SetProfile {
                    profile: QualityProfile::Sd480,
                    origin: ProfileOrigin::Auto,
                },
                T0,
            )
            .unwrap();
        let rec = transport.record(&t.request_id, T0).unwrap();
        assert_eq!(rec.owner, CommandOwner::ProfileSwitch);
        assert_eq!(rec.params["origin"], "auto");
    }
}
