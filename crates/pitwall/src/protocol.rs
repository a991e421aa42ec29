//! Protocol constants for Pitwall

use std::time::{SystemTime, UNIX_EPOCH};

/// How long a requester waits for an edge ACK before giving up (15s).
pub const COMMAND_TIMEOUT_MS: u64 = 15_000;

/// Heartbeat age at which an edge is considered disconnected (30s).
pub const HEARTBEAT_STALE_MS: u64 = 30_000;

/// Lifetime of a CommandRecord in the command store (60s).
pub const COMMAND_RECORD_TTL_MS: u64 = 60_000;

/// How often the edge posts a heartbeat (5s).
pub const HEARTBEAT_INTERVAL_MS: u64 = 5_000;

/// Header carrying the truck device token on edge → cloud calls.
pub const TRUCK_TOKEN_HEADER: &str = "x-truck-token";

/// Push event names (outbound, keyed by vehicle).
pub const EVENT_CAMERA_SWITCH: &str = "camera_switch";
pub const EVENT_FEATURED_VEHICLE: &str = "featured_vehicle";
pub const EVENT_STREAM_STATE_CHANGE: &str = "stream_state_change";
pub const EVENT_EDGE_COMMAND: &str = "edge_command";

/// Capacity of per-vehicle push feeds and the event bus.
pub const PUSH_BUFFER_CAPACITY: usize = 64;

/// Wall-clock milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
