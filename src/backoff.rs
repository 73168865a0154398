//! Reconnection backoff
//!
//! Exponential delay growth with symmetric jitter: each attempt doubles
//! the base delay up to a ceiling, then perturbs it by `±jitter` of its
//! value. The result is always clamped to `[0, max]`.

use std::time::Duration;

use rand::Rng;

/// Exponential backoff state for one reconnecting endpoint
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    jitter: f64,
    attempts: u32,
}

impl Backoff {
    /// Create a backoff starting at `base`, capped at `max`, with a
    /// fractional `jitter` in `[0, 1]`
    pub fn new(base: Duration, max: Duration, jitter: f64) -> Self {
        Self {
            base,
            max,
            jitter: jitter.clamp(0.0, 1.0),
            attempts: 0,
        }
    }

    /// Next delay to sleep before reconnecting; advances the attempt count
    pub fn duration(&mut self) -> Duration {
        let max_ms = self.max.as_millis() as f64;
        let doubled = self.base.as_millis() as f64 * 2f64.powi(self.attempts.min(31) as i32);
        self.attempts = self.attempts.saturating_add(1);

        let delay = doubled.min(max_ms);
        let spread = 1.0 + self.jitter * (rand::rng().random::<f64>() * 2.0 - 1.0);
        Duration::from_millis((delay * spread).clamp(0.0, max_ms) as u64)
    }

    /// Attempts made since the last reset
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Reset to the initial delay
    pub fn reset(&mut self) {
        self.attempts = 0;
    }
}
