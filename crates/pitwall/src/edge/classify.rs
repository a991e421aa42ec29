//! Encoder failure classification
//!
//! Best-effort pattern matching on the encoder's exit status and tail of
//! stderr. The rules are tied to ffmpeg's wording and will misfire now and
//! then; the supervisor only depends on [`classify_failure`], so a structured
//! signal can replace them without touching the state machine.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Why the encoder process died.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureKind {
    /// Rejected credentials or stream key; retrying will not help
    Auth,
    /// Upstream unreachable or connection dropped
    Network,
    /// Camera missing, busy or unreadable
    Device,
    /// Anything else
    Crash,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FailureKind::Auth => "auth",
            FailureKind::Network => "network",
            FailureKind::Device => "device",
            FailureKind::Crash => "crash",
        };
        f.write_str(s)
    }
}

const AUTH_PATTERNS: &[&str] = &[
    "401 unauthorized",
    "403 forbidden",
    "unauthorized",
    "forbidden",
    "authentication failed",
    "invalid stream key",
    "access denied",
    "netstream.publish.badname",
];

const DEVICE_PATTERNS: &[&str] = &[
    "no such device",
    "device or resource busy",
    "cannot open video device",
    "not a video capture device",
    "inappropriate ioctl for device",
    "/dev/video",
    "no such file or directory",
];

const NETWORK_PATTERNS: &[&str] = &[
    "connection refused",
    "connection reset",
    "connection timed out",
    "network is unreachable",
    "no route to host",
    "broken pipe",
    "name or service not known",
    "temporary failure in name resolution",
    "failed to resolve hostname",
    "i/o error",
    "end of file",
    "handshake",
];

/// Classify an encoder exit from its status code and captured output.
///
/// `exit_code` is `None` when the process was killed by a signal.
pub fn classify_failure(exit_code: Option<i32>, output: &str) -> FailureKind {
    let text = output.to_ascii_lowercase();
    let matches = |patterns: &[&str]| patterns.iter().any(|p| text.contains(p));

    if matches(AUTH_PATTERNS) {
        FailureKind::Auth
    } else if matches(DEVICE_PATTERNS) {
        FailureKind::Device
    } else if matches(NETWORK_PATTERNS) {
        FailureKind::Network
    } else {
        match exit_code {
            // ffmpeg exits 0 when the remote closes the stream cleanly
            Some(0) => FailureKind::Network,
            _ => FailureKind::Crash,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_common_ffmpeg_failures() {
        assert_eq!(
            classify_failure(
                Some(1),
                "[rtmp @ 0x55] Server error: Authentication failed\nError opening output"
            ),
            FailureKind::Auth
        );
        assert_eq!(
            classify_failure(Some(1), "HTTP error 403 Forbidden"),
            FailureKind::Auth
        );
        assert_eq!(
            classify_failure(Some(1), "[video4linux2,v4l2 @ 0x1] Cannot open video device /dev/video2: No such device"),
            FailureKind::Device
        );
        assert_eq!(
            classify_failure(Some(1), "[tcp @ 0x2] Connection to tcp://a.rtmp.youtube.com:1935 failed: Connection refused"),
            FailureKind::Network
        );
        assert_eq!(
            classify_failure(None, "Segmentation fault"),
            FailureKind::Crash
        );
    }

    #[test]
    fn clean_exit_without_output_is_network() {
        assert_eq!(classify_failure(Some(0), ""), FailureKind::Network);
        assert_eq!(classify_failure(Some(139), ""), FailureKind::Crash);
    }

    #[test]
    fn auth_wins_over_network_wording() {
        assert_eq!(
            classify_failure(Some(1), "Connection reset after 401 Unauthorized"),
            FailureKind::Auth
        );
    }
}
