//! # Reconnect Backoff
//!
//! Delay schedule between reconnect attempts.
//!
//! ```text
//! delay(attempt) = min(base * 2^(attempt-1), cap) + jitter
//! jitter         ∈ [0, pre_jitter_delay * jitter_ratio]
//!
//! attempt   pre-jitter (base 1s, cap 30s)    with ratio 0.3
//! ───────   ─────────────────────────────    ──────────────
//!    1              1s                        1.0s .. 1.3s
//!    2              2s                        2.0s .. 2.6s
//!    3              4s                        4.0s .. 5.2s
//!    6             30s (cap)                 30.0s .. 39.0s
//! ```
//!
//! Jitter is drawn from a per-instance RNG so clients that lost the
//! same access point spread their reconnects instead of arriving together.

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::time::Duration;

use crate::config::ConnectionSettings;

#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    base: Duration,
    cap: Duration,
    jitter_ratio: f64,
    rng: StdRng,
}

impl ReconnectPolicy {
    pub fn new(base: Duration, cap: Duration, jitter_ratio: f64, seed: u64) -> Self {
        ReconnectPolicy {
            base,
            cap: cap.max(base),
            jitter_ratio: jitter_ratio.clamp(0.0, 1.0),
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Policy from connection settings with a random per-instance seed.
    pub fn from_settings(settings: &ConnectionSettings) -> Self {
        let seed: u64 = rand::random();
        Self::new(
            Duration::from_millis(settings.backoff_base_ms),
            Duration::from_millis(settings.backoff_cap_ms),
            settings.jitter_ratio,
            seed,
        )
    }

    fn schedule(&self) -> ExponentialBackoff {
        let mut schedule = ExponentialBackoff {
            current_interval: self.base,
            initial_interval: self.base,
            randomization_factor: 0.0,
            multiplier: 2.0,
            max_interval: self.cap,
            max_elapsed_time: None,
            ..Default::default()
        };
        schedule.reset();
        schedule
    }

    /// Delay before reconnect attempt `attempt` (1-based), without jitter.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let mut schedule = self.schedule();
        let mut delay = self.base;
        for _ in 0..attempt.max(1) {
            delay = schedule.next_backoff().unwrap_or(self.cap);
            if delay >= self.cap {
                break;
            }
        }
        // whole milliseconds: the schedule may round up by a nanosecond
        Duration::from_millis(delay.as_millis() as u64).min(self.cap)
    }

    /// Upper bound of the jitter for attempt `attempt`.
    pub fn jitter_span(&self, attempt: u32) -> Duration {
        let base_ms = self.base_delay(attempt).as_millis() as u64;
        Duration::from_millis((base_ms as f64 * self.jitter_ratio) as u64)
    }

    /// Draws the jitter for attempt `attempt`, uniform in `[0, span]`.
    pub fn jitter(&mut self, attempt: u32) -> Duration {
        let span = self.jitter_span(attempt).as_millis() as u64;
        if span == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(self.rng.random_range(0..=span))
    }

    pub fn delay(&mut self, attempt: u32) -> Duration {
        self.base_delay(attempt) + self.jitter(attempt)
    }
}
