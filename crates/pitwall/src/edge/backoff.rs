//! Exponential backoff with jitter

use rand::Rng;
use std::time::Duration;

/// Exponential backoff: `base * 2^attempt`, capped at `ceiling`, plus jitter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub ceiling: Duration,
    /// Maximum jitter magnitude
    pub jitter: Duration,
    /// Jitter in `[-jitter, +jitter]` when true, `[0, +jitter]` otherwise
    pub symmetric: bool,
}

impl BackoffPolicy {
    /// Encoder restarts: 5s doubling to 120s, plus up to 3s.
    pub fn supervisor() -> Self {
        Self {
            base: Duration::from_secs(5),
            ceiling: Duration::from_secs(120),
            jitter: Duration::from_secs(3),
            symmetric: false,
        }
    }

    /// Push-channel reconnects: 5s doubling to 60s, ±3s.
    pub fn reconnect() -> Self {
        Self {
            base: Duration::from_secs(5),
            ceiling: Duration::from_secs(60),
            jitter: Duration::from_secs(3),
            symmetric: true,
        }
    }

    /// Deterministic part of the delay for a zero-based attempt number.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(16)).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.ceiling)
    }

    /// Delay for `attempt` with random jitter applied.
    pub fn delay(&self, attempt: u32) -> Duration {
        let jitter_ms = self.jitter.as_millis() as i64;
        let offset = if jitter_ms == 0 {
            0
        } else if self.symmetric {
            rand::rng().random_range(-jitter_ms..=jitter_ms)
        } else {
            rand::rng().random_range(0..=jitter_ms)
        };
        self.with_offset(attempt, offset)
    }

    fn with_offset(&self, attempt: u32, offset_ms: i64) -> Duration {
        let base = self.base_delay(attempt).as_millis() as i64;
        Duration::from_millis(base.saturating_add(offset_ms).max(0) as u64)
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::supervisor()
    }
}
