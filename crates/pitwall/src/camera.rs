//! Camera slot naming
//!
//! Every vehicle exposes up to four canonical camera slots. Older edge builds
//! and dashboards still send legacy names, so every entry point runs names
//! through [`CameraSlot::normalize`] before validating them.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Canonical camera slot on a vehicle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CameraSlot {
    Main,
    Cockpit,
    Chase,
    Suspension,
}

/// Legacy name → canonical slot.
const LEGACY_ALIASES: &[(&str, CameraSlot)] = &[
    ("primary", CameraSlot::Main),
    ("default", CameraSlot::Main),
    ("pov", CameraSlot::Cockpit),
    ("driver", CameraSlot::Cockpit),
    ("interior", CameraSlot::Cockpit),
    ("dash", CameraSlot::Cockpit),
    ("roof", CameraSlot::Chase),
    ("exterior", CameraSlot::Chase),
    ("front", CameraSlot::Suspension),
    ("rear", CameraSlot::Suspension),
    ("wheel", CameraSlot::Suspension),
];

impl CameraSlot {
    pub const ALL: [CameraSlot; 4] = [
        CameraSlot::Main,
        CameraSlot::Cockpit,
        CameraSlot::Chase,
        CameraSlot::Suspension,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            CameraSlot::Main => "main",
            CameraSlot::Cockpit => "cockpit",
            CameraSlot::Chase => "chase",
            CameraSlot::Suspension => "suspension",
        }
    }

    /// Resolve a canonical or legacy camera name.
    ///
    /// Case, surrounding whitespace, `-`/space separators and a trailing
    /// `_cam` suffix are ignored.
    pub fn normalize(name: &str) -> Option<CameraSlot> {
        let cleaned = name.trim().to_ascii_lowercase().replace(['-', ' '], "_");
        let cleaned = cleaned.strip_suffix("_cam").unwrap_or(&cleaned);

        if let Some(slot) = Self::ALL.iter().find(|s| s.as_str() == cleaned) {
            return Some(*slot);
        }
        LEGACY_ALIASES
            .iter()
            .find(|(alias, _)| *alias == cleaned)
            .map(|(_, slot)| *slot)
    }
}

impl fmt::Display for CameraSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CameraSlot {
    type Err = crate::ControlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        CameraSlot::normalize(s).ok_or_else(|| crate::ControlError::InvalidCamera(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_names_resolve() {
        for slot in CameraSlot::ALL {
            assert_eq!(CameraSlot::normalize(slot.as_str()), Some(slot));
        }
    }

    #[test]
    fn legacy_aliases_resolve() {
        assert_eq!(CameraSlot::normalize("pov"), Some(CameraSlot::Cockpit));
        assert_eq!(CameraSlot::normalize("roof"), Some(CameraSlot::Chase));
        assert_eq!(CameraSlot::normalize("front"), Some(CameraSlot::Suspension));
        assert_eq!(CameraSlot::normalize("rear"), Some(CameraSlot::Suspension));
    }

    #[test]
    fn normalization_ignores_case_and_suffix() {
        assert_eq!(CameraSlot::normalize("  Chase "), Some(CameraSlot::Chase));
        assert_eq!(CameraSlot::normalize("ROOF-cam"), Some(CameraSlot::Chase));
        assert_eq!(CameraSlot::normalize("main_cam"), Some(CameraSlot::Main));
    }

    #[test]
    fn unknown_names_rejected() {
        assert_eq!(CameraSlot::normalize("thermal"), None);
        assert_eq!(CameraSlot::normalize(""), None);
        assert!("thermal".parse::<CameraSlot>().is_err());
    }

    #[test]
    fn serde_uses_lowercase() {
        let json = serde_json::to_string(&CameraSlot::Suspension).unwrap();
        assert_eq!(json, "\"suspension\"");
        let slot: CameraSlot = serde_json::from_str("\"cockpit\"").unwrap();
        assert_eq!(slot, CameraSlot::Cockpit);
    }
}
