//! Sliding sample windows for the health controller
//!
//! Both windows prune on every write and read, so their size is bounded by
//! the sample rate times the window length.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Trailing window of `(time, throughput ratio)` samples.
pub struct RatioWindow {
    samples: VecDeque<(Instant, f64)>,
    window: Duration,
}

impl RatioWindow {
    pub fn new(window: Duration) -> Self {
        Self {
            samples: VecDeque::new(),
            window,
        }
    }

    pub fn record(&mut self, at: Instant, ratio: f64) {
        if !ratio.is_finite() || ratio < 0.0 {
            return;
        }
        self.samples.push_back((at, ratio));
        self.prune(at);
    }

    /// Mean ratio over the window, `None` when empty.
    pub fn average(&mut self, now: Instant) -> Option<f64> {
        self.prune(now);
        if self.samples.is_empty() {
            return None;
        }
        let sum: f64 = self.samples.iter().map(|(_, r)| r).sum();
        Some(sum / self.samples.len() as f64)
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }

    fn prune(&mut self, now: Instant) {
        while let Some(&(t, _)) = self.samples.front() {
            if now.saturating_duration_since(t) > self.window {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }
}

/// Trailing window of event timestamps (encoder restarts).
pub struct EventWindow {
    events: VecDeque<Instant>,
    window: Duration,
}

impl EventWindow {
    pub fn new(window: Duration) -> Self {
        Self {
            events: VecDeque::new(),
            window,
        }
    }

    pub fn record(&mut self, at: Instant) {
        self.events.push_back(at);
        self.prune(at);
    }

    pub fn count(&mut self, now: Instant) -> usize {
        self.prune(now);
        self.events.len()
    }

    fn prune(&mut self, now: Instant) {
        while let Some(&t) = self.events.front() {
            if now.saturating_duration_since(t) > self.window {
                self.events.pop_front();
            } else {
                break;
            }
        }
    }
}
