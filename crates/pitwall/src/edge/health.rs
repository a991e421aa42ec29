//! Health-driven automatic quality control
//!
//! Watches the encoder's throughput ratio (wall-clock encoding speed, 1.0 =
//! real time) and how often it restarts, and steps the quality profile one
//! notch at a time with hysteresis:
//! - Downshift after 20s continuously unhealthy
//! - Upshift after 120s continuously healthy, never above the manual ceiling
//!
//! "Unhealthy" means the 30s average ratio is below 0.90 or the encoder
//! restarted more than 3 times in the last 5 minutes.

use std::time::{Duration, Instant};
use tracing::{debug, info};

use super::window::{EventWindow, RatioWindow};
use crate::profile::QualityProfile;

/// Health controller tunables.
#[derive(Debug, Clone)]
pub struct HealthConfig {
    pub ratio_window: Duration,
    pub restart_window: Duration,
    /// Average ratio below this is unhealthy
    pub min_ratio: f64,
    /// More restarts than this in the restart window is unhealthy
    pub max_restarts: usize,
    pub downgrade_after: Duration,
    pub upgrade_after: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            ratio_window: Duration::from_secs(30),
            restart_window: Duration::from_secs(300),
            min_ratio: 0.90,
            max_restarts: 3,
            downgrade_after: Duration::from_secs(20),
            upgrade_after: Duration::from_secs(120),
        }
    }
}

/// What the health controller wants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthDecision {
    Hold,
    ChangeTo(QualityProfile),
}

/// Snapshot of the last evaluation, for status reporting.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HealthReading {
    pub average_ratio: Option<f64>,
    pub restarts: usize,
    pub healthy: Option<bool>,
}

pub struct HealthController {
    current: QualityProfile,
    /// Highest profile auto-quality may climb to
    ceiling: QualityProfile,
    ratios: RatioWindow,
    restarts: EventWindow,
    unhealthy_since: Option<Instant>,
    healthy_since: Option<Instant>,
    config: HealthConfig,
}

impl HealthController {
    /// Start at `profile`, which is also the initial ceiling.
    pub fn new(config: HealthConfig, profile: QualityProfile) -> Self {
        Self {
            current: profile,
            ceiling: profile,
            ratios: RatioWindow::new(config.ratio_window),
            restarts: EventWindow::new(config.restart_window),
            unhealthy_since: None,
            healthy_since: None,
            config,
        }
    }

    pub fn current(&self) -> QualityProfile {
        self.current
    }

    pub fn ceiling(&self) -> QualityProfile {
        self.ceiling
    }

    pub fn record_ratio(&mut self, at: Instant, ratio: f64) {
        self.ratios.record(at, ratio);
    }

    pub fn record_restart(&mut self, at: Instant) {
        self.restarts.record(at);
    }

    /// An operator picked a profile: it becomes the ceiling and the
    /// healthy timer starts over.
    pub fn set_manual(&mut self, profile: QualityProfile) {
        info!("Auto quality: manual profile {} (new ceiling)", profile);
        self.current = profile;
        self.ceiling = profile;
        self.healthy_since = None;
        self.unhealthy_since = None;
        self.ratios.clear();
    }

    /// Sync to the profile the encoder actually runs.
    pub fn observe(&mut self, profile: QualityProfile) {
        if profile != self.current {
            debug!("Auto quality: encoder now at {}", profile);
            self.current = profile;
            self.ratios.clear();
        }
    }

    pub fn reading(&mut self, now: Instant) -> HealthReading {
        let average_ratio = self.ratios.average(now);
        let restarts = self.restarts.count(now);
        let unhealthy = average_ratio.is_some_and(|a| a < self.config.min_ratio)
            || restarts > self.config.max_restarts;
        let healthy = if unhealthy {
            Some(false)
        } else if average_ratio.is_some() {
            Some(true)
        } else {
            None
        };
        HealthReading {
            average_ratio,
            restarts,
            healthy,
        }
    }

    /// Decide whether to step the profile. Call periodically.
    pub fn evaluate(&mut self, now: Instant) -> HealthDecision {
        let reading = self.reading(now);
        match reading.healthy {
            Some(false) => {
                self.healthy_since = None;
                let since = *self.unhealthy_since.get_or_insert(now);
                let held = now.saturating_duration_since(since);
                debug!(
                    "Auto quality: unhealthy for {:.1}s (ratio {:?}, restarts {})",
                    held.as_secs_f64(),
                    reading.average_ratio,
                    reading.restarts
                );
                if held >= self.config.downgrade_after {
                    if let Some(lower) = self.current.lower() {
                        info!(
                            "Auto quality: downshift {} -> {} (ratio {:?}, restarts {})",
                            self.current, lower, reading.average_ratio, reading.restarts
                        );
                        self.step_to(lower);
                        return HealthDecision::ChangeTo(lower);
                    }
                }
            }
            Some(true) => {
                self.unhealthy_since = None;
                let since = *self.healthy_since.get_or_insert(now);
                if now.saturating_duration_since(since) >= self.config.upgrade_after {
                    match self.current.higher() {
                        Some(higher) if higher <= self.ceiling => {
                            info!(
                                "Auto quality: upshift {} -> {} (ratio {:?})",
                                self.current, higher, reading.average_ratio
                            );
                            self.step_to(higher);
                            return HealthDecision::ChangeTo(higher);
                        }
                        _ => {}
                    }
                }
            }
            // No samples: nothing is encoding, so neither timer runs
            None => {
                self.unhealthy_since = None;
                self.healthy_since = None;
            }
        }
        HealthDecision::Hold
    }

    fn step_to(&mut self, profile: QualityProfile) {
        self.current = profile;
        self.unhealthy_since = None;
        self.healthy_since = None;
        self.ratios.clear();
    }
}
