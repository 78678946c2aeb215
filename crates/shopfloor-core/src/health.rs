//! # Connection Health
//!
//! A single number in `[0, 1]` summarizing how well the link is doing.
//!
//! ## Score Composition
//! ```text
//!   reliability = 1 - error_rate            (last N send/receive outcomes)
//!   latency     = 1 at <= good, 0 at >= bad, linear between
//!   freshness   = 1 while idle <= stale_after, 0 at 3 x stale_after
//!
//!   score = w_r * reliability + w_l * latency + w_f * freshness
//!         - missed_heartbeats * penalty
//!
//!   clamped to [0, 1]; NaN collapses to 0
//! ```
//!
//! The tracker is pure. Callers supply the idle time since the last
//! inbound frame so the math can be tested without a clock.

use std::collections::VecDeque;
use std::time::Duration;

/// Weights of the three score components. Normalized before use.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HealthWeights {
    pub reliability: f64,
    pub latency: f64,
    pub freshness: f64,
}

impl Default for HealthWeights {
    fn default() -> Self {
        HealthWeights {
            reliability: 0.4,
            latency: 0.3,
            freshness: 0.3,
        }
    }
}

impl HealthWeights {
    /// Scales the weights to sum to 1. Non-finite or non-positive sets
    /// fall back to the defaults.
    pub fn normalized(self) -> Self {
        let parts = [self.reliability, self.latency, self.freshness];
        if parts.iter().any(|w| !w.is_finite() || *w < 0.0) {
            return Self::default();
        }
        let sum: f64 = parts.iter().sum();
        if sum <= f64::EPSILON {
            return Self::default();
        }
        HealthWeights {
            reliability: self.reliability / sum,
            latency: self.latency / sum,
            freshness: self.freshness / sum,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HealthThresholds {
    /// Round trips at or below this score full marks.
    pub good_latency: Duration,
    /// Round trips at or above this score zero.
    pub bad_latency: Duration,
    /// Idle time before freshness starts to decay.
    pub stale_after: Duration,
    /// Subtracted per consecutive missed heartbeat.
    pub missed_heartbeat_penalty: f64,
    /// Number of outcomes kept for the error rate.
    pub window: usize,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        HealthThresholds {
            good_latency: Duration::from_millis(100),
            bad_latency: Duration::from_millis(2000),
            stale_after: Duration::from_secs(60),
            missed_heartbeat_penalty: 0.15,
            window: 50,
        }
    }
}

#[derive(Debug, Clone)]
pub struct HealthTracker {
    outcomes: VecDeque<bool>,
    latency: Option<Duration>,
    missed_heartbeats: u32,
    weights: HealthWeights,
    thresholds: HealthThresholds,
}

impl Default for HealthTracker {
    fn default() -> Self {
        Self::new(HealthWeights::default(), HealthThresholds::default())
    }
}

impl HealthTracker {
    pub fn new(weights: HealthWeights, thresholds: HealthThresholds) -> Self {
        let window = thresholds.window.max(1);
        HealthTracker {
            outcomes: VecDeque::with_capacity(window),
            latency: None,
            missed_heartbeats: 0,
            weights: weights.normalized(),
            thresholds: HealthThresholds { window, ..thresholds },
        }
    }

    fn push(&mut self, ok: bool) {
        if self.outcomes.len() == self.thresholds.window {
            self.outcomes.pop_front();
        }
        self.outcomes.push_back(ok);
    }

    pub fn record_success(&mut self) {
        self.push(true);
    }

    pub fn record_error(&mut self) {
        self.push(false);
    }

    pub fn record_latency(&mut self, rtt: Duration) {
        self.latency = Some(rtt);
    }

    pub fn latency(&self) -> Option<Duration> {
        self.latency
    }

    pub fn record_missed_heartbeat(&mut self) -> u32 {
        self.missed_heartbeats = self.missed_heartbeats.saturating_add(1);
        self.missed_heartbeats
    }

    pub fn reset_missed_heartbeats(&mut self) {
        self.missed_heartbeats = 0;
    }

    pub fn missed_heartbeats(&self) -> u32 {
        self.missed_heartbeats
    }

    /// Forgets everything. Used when a new session opens.
    pub fn reset(&mut self) {
        self.outcomes.clear();
        self.latency = None;
        self.missed_heartbeats = 0;
    }

    /// Fraction of failed outcomes in the window. Zero with no history.
    pub fn error_rate(&self) -> f64 {
        if self.outcomes.is_empty() {
            return 0.0;
        }
        let errors = self.outcomes.iter().filter(|ok| !**ok).count();
        errors as f64 / self.outcomes.len() as f64
    }

    fn latency_factor(&self) -> f64 {
        let Some(rtt) = self.latency else {
            return 1.0;
        };
        let good = self.thresholds.good_latency.as_secs_f64();
        let bad = self.thresholds.bad_latency.as_secs_f64();
        let rtt = rtt.as_secs_f64();
        if rtt <= good {
            1.0
        } else if rtt >= bad || bad <= good {
            0.0
        } else {
            1.0 - (rtt - good) / (bad - good)
        }
    }

    fn freshness_factor(&self, idle: Duration) -> f64 {
        let stale = self.thresholds.stale_after.as_secs_f64();
        let idle = idle.as_secs_f64();
        if idle <= stale {
            1.0
        } else if stale <= 0.0 {
            0.0
        } else {
            (1.0 - (idle - stale) / (2.0 * stale)).max(0.0)
        }
    }

    /// Current score given the time since the last inbound frame.
    pub fn score(&self, idle: Duration) -> f64 {
        let w = self.weights;
        let raw = w.reliability * (1.0 - self.error_rate())
            + w.latency * self.latency_factor()
            + w.freshness * self.freshness_factor(idle)
            - self.missed_heartbeats as f64 * self.thresholds.missed_heartbeat_penalty;

        if raw.is_nan() {
            0.0
        } else {
            raw.clamp(0.0, 1.0)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_tracker_is_healthy() {
        let tracker = HealthTracker::default();
        assert_eq!(tracker.score(Duration::ZERO), 1.0);
        assert_eq!(tracker.error_rate(), 0.0);
    }

    #[test]
    fn test_errors_lower_score() {
        let mut tracker = HealthTracker::default();
        for _ in 0..5 {
            tracker.record_success();
            tracker.record_error();
        }
        assert!((tracker.error_rate() - 0.5).abs() < 1e-9);
        assert!((tracker.score(Duration::ZERO) - 0.8).abs() < 1e-9);
    }

    #[test]
    fn test_window_forgets_old_outcomes() {
        let mut tracker = HealthTracker::new(
            HealthWeights::default(),
            HealthThresholds {
                window: 4,
                ..Default::default()
            },
        );
        for _ in 0..4 {
            tracker.record_error();
        }
        for _ in 0..4 {
            tracker.record_success();
        }
        assert_eq!(tracker.error_rate(), 0.0);
    }

    #[test]
    fn test_latency_is_linear_between_thresholds() {
        let mut tracker = HealthTracker::default();
        tracker.record_latency(Duration::from_millis(1050));
        // latency factor 0.5, weight 0.3
        assert!((tracker.score(Duration::ZERO) - 0.85).abs() < 1e-9);

        tracker.record_latency(Duration::from_secs(5));
        assert!((tracker.score(Duration::ZERO) - 0.7).abs() < 1e-9);
    }

    #[test]
    fn test_staleness_decays_to_zero() {
        let tracker = HealthTracker::default();
        assert_eq!(tracker.score(Duration::from_secs(60)), 1.0);
        assert!((tracker.score(Duration::from_secs(120)) - 0.85).abs() < 1e-9);
        assert!((tracker.score(Duration::from_secs(600)) - 0.7).abs() < 1e-9);
    }

    #[test]
    fn test_missed_heartbeats_penalize() {
        let mut tracker = HealthTracker::default();
        tracker.record_missed_heartbeat();
        tracker.record_missed_heartbeat();
        assert!((tracker.score(Duration::ZERO) - 0.7).abs() < 1e-9);

        tracker.reset_missed_heartbeats();
        assert_eq!(tracker.score(Duration::ZERO), 1.0);
    }

    #[test]
    fn test_bad_weights_fall_back() {
        let w = HealthWeights {
            reliability: f64::NAN,
            latency: 1.0,
            freshness: 1.0,
        }
        .normalized();
        assert_eq!(w, HealthWeights::default());

        let zero = HealthWeights {
            reliability: 0.0,
            latency: 0.0,
            freshness: 0.0,
        }
        .normalized();
        assert_eq!(zero, HealthWeights::default());
    }

    #[test]
    fn test_score_always_in_unit_interval() {
        // xorshift so the sequence is reproducible
        let mut seed: u64 = 0x9E37_79B9_7F4A_7C15;
        let mut next = || {
            seed ^= seed << 13;
            seed ^= seed >> 7;
            seed ^= seed << 17;
            seed
        };

        let mut tracker = HealthTracker::default();
        for _ in 0..2_000 {
            match next() % 5 {
                0 => tracker.record_error(),
                1 => tracker.record_success(),
                2 => tracker.record_latency(Duration::from_millis(next() % 10_000)),
                3 => {
                    tracker.record_missed_heartbeat();
                }
                _ => tracker.reset_missed_heartbeats(),
            }
            let score = tracker.score(Duration::from_millis(next() % 600_000));
            assert!((0.0..=1.0).contains(&score), "score out of range: {}", score);
        }
    }
}
