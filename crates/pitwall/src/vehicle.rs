use serde::{Deserialize, Serialize};
use std::fmt;

/// Partition key for all per-vehicle state: one vehicle within one event.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VehicleKey {
    pub event_id: String,
    pub vehicle_id: String,
}

impl VehicleKey {
    pub fn new(event_id: impl Into<String>, vehicle_id: impl Into<String>) -> Self {
        Self {
            event_id: event_id.into(),
            vehicle_id: vehicle_id.into(),
        }
    }
}

impl fmt::Display for VehicleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.event_id, self.vehicle_id)
    }
}
