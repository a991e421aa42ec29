//! Encoder quality profiles
//!
//! Profiles are totally ordered: `Ord` ranks worse profiles lower, so
//! `Hd1080 > Hd720 > Sd480 > Sd360`. Stepping always moves by one profile.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Named encoder preset (resolution + bitrate).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub enum QualityProfile {
    #[serde(rename = "360p")]
    Sd360,
    #[serde(rename = "480p")]
    Sd480,
    #[serde(rename = "720p")]
    #[default]
    Hd720,
    #[serde(rename = "1080p")]
    Hd1080,
}

impl QualityProfile {
    /// Best to worst.
    pub const LADDER: [QualityProfile; 4] = [
        QualityProfile::Hd1080,
        QualityProfile::Hd720,
        QualityProfile::Sd480,
        QualityProfile::Sd360,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            QualityProfile::Hd1080 => "1080p",
            QualityProfile::Hd720 => "720p",
            QualityProfile::Sd480 => "480p",
            QualityProfile::Sd360 => "360p",
        }
    }

    /// Encoder video bitrate in kbps.
    pub fn bitrate_kbps(self) -> u32 {
        match self {
            QualityProfile::Hd1080 => 6_000,
            QualityProfile::Hd720 => 3_500,
            QualityProfile::Sd480 => 1_800,
            QualityProfile::Sd360 => 900,
        }
    }

    pub fn resolution(self) -> (u32, u32) {
        match self {
            QualityProfile::Hd1080 => (1920, 1080),
            QualityProfile::Hd720 => (1280, 720),
            QualityProfile::Sd480 => (854, 480),
            QualityProfile::Sd360 => (640, 360),
        }
    }

    /// Next profile up, if any.
    pub fn higher(self) -> Option<QualityProfile> {
        match self {
            QualityProfile::Sd360 => Some(QualityProfile::Sd480),
            QualityProfile::Sd480 => Some(QualityProfile::Hd720),
            QualityProfile::Hd720 => Some(QualityProfile::Hd1080),
            QualityProfile::Hd1080 => None,
        }
    }

    /// Next profile down, if any.
    pub fn lower(self) -> Option<QualityProfile> {
        match self {
            QualityProfile::Hd1080 => Some(QualityProfile::Hd720),
            QualityProfile::Hd720 => Some(QualityProfile::Sd480),
            QualityProfile::Sd480 => Some(QualityProfile::Sd360),
            QualityProfile::Sd360 => None,
        }
    }
}

impl fmt::Display for QualityProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QualityProfile {
    type Err = crate::ControlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let cleaned = s.trim().to_ascii_lowercase();
        Self::LADDER
            .iter()
            .copied()
            .find(|p| p.as_str() == cleaned)
            .ok_or_else(|| crate::ControlError::InvalidProfile(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ladder_is_sorted_best_to_worst() {
        for pair in QualityProfile::LADDER.windows(2) {
            assert!(pair[0] > pair[1]);
            assert_eq!(pair[0].lower(), Some(pair[1]));
            assert_eq!(pair[1].higher(), Some(pair[0]));
        }
    }

    #[test]
    fn ends_of_ladder() {
        assert_eq!(QualityProfile::Hd1080.higher(), None);
        assert_eq!(QualityProfile::Sd360.lower(), None);
    }

    #[test]
    fn bitrate_decreases_down_the_ladder() {
        for pair in QualityProfile::LADDER.windows(2) {
            assert!(pair[0].bitrate_kbps() > pair[1].bitrate_kbps());
        }
    }

    #[test]
    fn parse_profiles() {
        assert_eq!("720p".parse::<QualityProfile>().unwrap(), QualityProfile::Hd720);
        assert_eq!(" 1080P ".parse::<QualityProfile>().unwrap(), QualityProfile::Hd1080);
        assert!("4k".parse::<QualityProfile>().is_err());
    }

    #[test]
    fn serde_names() {
        assert_eq!(serde_json::to_string(&QualityProfile::Sd480).unwrap(), "\"480p\"");
    }
}
