//! Cloud side of the command/ACK transport
//!
//! Commands go out on a per-vehicle broadcast feed the edge subscribes to
//! over the push channel. Delivery is fire-and-forget: the same envelope is
//! mirrored into the command ledger and the requester's own timeout covers
//! loss. ACKs come back out of band and are correlated through the ledger.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::command::{
    CommandAck, CommandEnvelope, CommandId, CommandOwner, CommandRecord, CommandStatus,
    EdgeCommand,
};
use crate::protocol::{COMMAND_RECORD_TTL_MS, PUSH_BUFFER_CAPACITY};
use crate::store::{KeyedStore, MemoryStore};
use crate::vehicle::VehicleKey;

/// Handle to the command transport. Cheap to clone.
#[derive(Clone)]
pub struct CommandTransport {
    inner: Arc<TransportInner>,
}

struct TransportInner {
    /// Outbound feeds, one per vehicle, created on first use from either side
    feeds: DashMap<VehicleKey, broadcast::Sender<CommandEnvelope>>,
    /// Correlation ledger
    records: Arc<dyn KeyedStore<CommandId, CommandRecord>>,
}

impl CommandTransport {
    /// Transport with an in-memory ledger using the standard record TTL.
    pub fn new() -> Self {
        Self::with_store(Arc::new(MemoryStore::with_ttl(COMMAND_RECORD_TTL_MS)))
    }

    pub fn with_store(records: Arc<dyn KeyedStore<CommandId, CommandRecord>>) -> Self {
        Self {
            inner: Arc::new(TransportInner {
                feeds: DashMap::new(),
                records,
            }),
        }
    }

    fn feed(&self, key: &VehicleKey) -> broadcast::Sender<CommandEnvelope> {
        self.inner
            .feeds
            .entry(key.clone())
            .or_insert_with(|| broadcast::channel(PUSH_BUFFER_CAPACITY).0)
            .clone()
    }

    /// Subscribe to a vehicle's outbound feed.
    ///
    /// Only commands issued after this call are seen; nothing is replayed.
    pub fn subscribe(&self, key: &VehicleKey) -> broadcast::Receiver<CommandEnvelope> {
        self.feed(key).subscribe()
    }

    /// Number of edge connections currently listening for a vehicle.
    pub fn listeners(&self, key: &VehicleKey) -> usize {
        self.inner
            .feeds
            .get(key)
            .map(|tx| tx.receiver_count())
            .unwrap_or(0)
    }

    /// Mint a command id and push the command.
    pub fn send(
        &self,
        key: &VehicleKey,
        command: &EdgeCommand,
        owner: CommandOwner,
        now_ms: u64,
    ) -> CommandId {
        let id = CommandId::generate();
        self.send_with_id(key, id.clone(), command, owner, now_ms);
        id
    }

    /// Push a command under a caller-minted id.
    ///
    /// The ledger entry is written before the push so an ACK can never
    /// arrive ahead of its record.
    pub fn send_with_id(
        &self,
        key: &VehicleKey,
        id: CommandId,
        command: &EdgeCommand,
        owner: CommandOwner,
        now_ms: u64,
    ) {
        let envelope = CommandEnvelope::new(id.clone(), command, now_ms);
        let record = CommandRecord::new(key.clone(), owner, &envelope);
        let mut pending = Some(record);
        self.inner.records.update(&id, now_ms, &mut |slot| {
            if slot.is_none() {
                *slot = pending.take();
            }
        });
        if pending.is_some() {
            warn!(command_id = %id, "Command id already in ledger, not re-sending");
            return;
        }

        match self.feed(key).send(envelope) {
            Ok(n) => info!(
                vehicle = %key,
                command_id = %id,
                command = command.verb(),
                listeners = n,
                "Pushed command to edge"
            ),
            Err(_) => warn!(
                vehicle = %key,
                command_id = %id,
                command = command.verb(),
                "No edge listening, command will time out unless it reconnects"
            ),
        }
    }

    /// Correlate an ACK against the ledger.
    ///
    /// Returns the resolved record the first time a live, pending record is
    /// acknowledged. ACKs for expired, unknown, timed-out or already
    /// resolved records are logged and dropped.
    pub fn receive_ack(&self, ack: &CommandAck, now_ms: u64) -> Option<CommandRecord> {
        let mut outcome: Result<CommandRecord, &'static str> = Err("unknown or expired");
        self.inner.records.update(&ack.command_id, now_ms, &mut |slot| {
            let Some(record) = slot.as_mut() else {
                return;
            };
            if record.status_at(now_ms) == CommandStatus::Timeout {
                record.status = CommandStatus::Timeout;
                outcome = Err("already timed out");
            } else if record.resolve(ack, now_ms) {
                outcome = Ok(record.clone());
            } else {
                outcome = Err("already resolved");
            }
        });

        match outcome {
            Ok(record) => {
                debug!(
                    vehicle = %record.vehicle,
                    command_id = %record.command_id,
                    status = ?record.status,
                    "ACK correlated"
                );
                Some(record)
            }
            Err(why) => {
                warn!(command_id = %ack.command_id, reason = why, "Dropping ACK");
                None
            }
        }
    }

    /// Ledger entry for a command, with lazy timeout applied.
    pub fn record(&self, id: &CommandId, now_ms: u64) -> Option<CommandRecord> {
        self.inner.records.get(id, now_ms).map(|mut record| {
            record.status = record.status_at(now_ms);
            record
        })
    }

    /// Drop expired ledger entries and feeds nobody listens to.
    pub fn purge(&self, now_ms: u64) -> usize {
        self.inner.feeds.retain(|_, tx| tx.receiver_count() > 0);
        self.inner.records.purge_expired(now_ms)
    }
}

impl Default for CommandTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::CameraSlot;
    use crate::protocol::COMMAND_TIMEOUT_MS;

    fn key() -> VehicleKey {
        VehicleKey::new("race-1", "car-7")
    }

    #[tokio::test]
    async fn subscriber_sees_command_and_ledger_mirrors_it() {
        let transport = CommandTransport::new();
        let mut rx = transport.subscribe(&key());
        assert_eq!(transport.listeners(&key()), 1);

        let cmd = EdgeCommand::SetActiveCamera {
            camera: CameraSlot::Chase,
        };
        let id = transport.send(&key(), &cmd, CommandOwner::CameraSwitch, 1_000);

        let env = rx.recv().await.unwrap();
        assert_eq!(env.command_id, id);
        assert_eq!(env.decode().unwrap(), cmd);

        let record = transport.record(&id, 1_000).unwrap();
        assert_eq!(record.status, CommandStatus::Pending);
        assert_eq!(record.owner, CommandOwner::CameraSwitch);
        assert_eq!(record.vehicle, key());
    }

    #[test]
    fn ack_resolves_exactly_once() {
        let transport = CommandTransport::new();
        let id = transport.send(&key(), &EdgeCommand::StopStream, CommandOwner::Stream, 0);

        let first = transport.receive_ack(&CommandAck::success(id.clone(), "ok"), 100);
        assert_eq!(first.unwrap().status, CommandStatus::Success);
        assert!(transport
            .receive_ack(&CommandAck::error(id.clone(), "dup"), 200)
            .is_none());
        assert_eq!(transport.record(&id, 300).unwrap().status, CommandStatus::Success);
    }

    #[test]
    fn unknown_and_late_acks_are_dropped() {
        let transport = CommandTransport::new();
        assert!(transport
            .receive_ack(&CommandAck::success("nope".into(), ""), 0)
            .is_none());

        let id = transport.send(&key(), &EdgeCommand::GetStatus, CommandOwner::Dispatch, 0);
        let late = COMMAND_TIMEOUT_MS + 1;
        assert_eq!(transport.record(&id, late).unwrap().status, CommandStatus::Timeout);
        assert!(transport
            .receive_ack(&CommandAck::success(id.clone(), "ok"), late)
            .is_none());
        assert_eq!(transport.record(&id, late).unwrap().status, CommandStatus::Timeout);
    }

    #[test]
    fn records_expire_after_ttl() {
        let transport = CommandTransport::new();
        let id = transport.send(&key(), &EdgeCommand::GetStatus, CommandOwner::Dispatch, 0);
        assert!(transport.record(&id, COMMAND_RECORD_TTL_MS - 1).is_some());
        assert!(transport.record(&id, COMMAND_RECORD_TTL_MS).is_none());
        assert!(transport
            .receive_ack(&CommandAck::success(id, ""), COMMAND_RECORD_TTL_MS)
            .is_none());
        assert_eq!(transport.purge(COMMAND_RECORD_TTL_MS), 1);
    }

    #[tokio::test]
    async fn no_replay_after_resubscribe() {
        let transport = CommandTransport::new();
        let early = transport.subscribe(&key());
        transport.send(&key(), &EdgeCommand::StopStream, CommandOwner::Stream, 0);
        drop(early);

        let mut late = transport.subscribe(&key());
        let id = transport.send(&key(), &EdgeCommand::GetStatus, CommandOwner::Dispatch, 1);
        assert_eq!(late.recv().await.unwrap().command_id, id);
    }
}
