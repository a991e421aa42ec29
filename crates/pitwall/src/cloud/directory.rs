//! Vehicle registry and truck-token resolution
//!
//! Event and vehicle records live in an external store; the control plane
//! only needs to know whether a vehicle exists and which vehicle a device
//! token belongs to.

use std::collections::{HashMap, HashSet};

use anyhow::{bail, Result};

use crate::command::RedactedString;
use crate::vehicle::VehicleKey;

/// Read-only view of registered vehicles.
pub trait VehicleDirectory: Send + Sync {
    fn is_registered(&self, key: &VehicleKey) -> bool;

    /// Map a truck device token to the vehicle it authenticates.
    fn resolve_token(&self, token: &str) -> Option<VehicleKey>;
}

/// In-memory directory seeded from configuration.
#[derive(Default)]
pub struct StaticDirectory {
    vehicles: HashSet<VehicleKey>,
    tokens: HashMap<String, VehicleKey>,
}

impl StaticDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, key: VehicleKey, token: RedactedString) {
        if !token.is_empty() {
            self.tokens.insert(token.expose().to_string(), key.clone());
        }
        self.vehicles.insert(key);
    }

    /// Parse a `event:vehicle:token,...` list.
    ///
    /// The token part is optional; a vehicle without one can be controlled
    /// but its edge cannot authenticate.
    pub fn parse(spec: &str) -> Result<Self> {
        let mut dir = Self::new();
        for entry in spec.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            let mut parts = entry.splitn(3, ':');
            let event = parts.next().unwrap_or_default().trim();
            let vehicle = parts.next().unwrap_or_default().trim();
            let token = parts.next().unwrap_or_default().trim();
            if event.is_empty() || vehicle.is_empty() {
                bail!("Invalid vehicle entry '{}' (expected event:vehicle[:token])", entry);
            }
            dir.register(VehicleKey::new(event, vehicle), RedactedString::from(token));
        }
        Ok(dir)
    }

    pub fn len(&self) -> usize {
        self.vehicles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vehicles.is_empty()
    }
}

impl VehicleDirectory for StaticDirectory {
    fn is_registered(&self, key: &VehicleKey) -> bool {
        self.vehicles.contains(key)
    }

    fn resolve_token(&self, token: &str) -> Option<VehicleKey> {
        self.tokens.get(token).cloned()
    }
}
