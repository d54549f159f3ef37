//! Retry delay computation

use std::time::Duration;

use rand::Rng;
use relay_common::RetryPolicy;

/// Exponential backoff over a `RetryPolicy`
#[derive(Debug, Clone, Copy)]
pub struct Backoff<'a> {
    policy: &'a RetryPolicy,
}

impl<'a> Backoff<'a> {
    pub fn new(policy: &'a RetryPolicy) -> Self {
        Self { policy }
    }

    /// `min(max_interval, initial_interval * multiplier^(n-1))` for the
    /// attempt that just failed
    pub fn nominal_delay(&self, attempt_number: u32) -> Duration {
        let exponent = attempt_number.saturating_sub(1).min(i32::MAX as u32) as i32;
        let max = self.policy.max_interval_ms as f64;
        let raw = self.policy.initial_interval_ms as f64 * self.policy.multiplier.powi(exponent);
        let ms = if raw.is_finite() { raw.min(max) } else { max };
        Duration::from_millis(ms.max(0.0) as u64)
    }

    /// Nominal delay spread by up to `jitter` in either direction, still
    /// capped at `max_interval`
    pub fn delay(&self, attempt_number: u32) -> Duration {
        self.delay_with(attempt_number, &mut rand::thread_rng())
    }

    pub fn delay_with<R: Rng + ?Sized>(&self, attempt_number: u32, rng: &mut R) -> Duration {
        let nominal = self.nominal_delay(attempt_number).as_millis() as f64;
        let jitter = self.policy.jitter.clamp(0.0, 1.0);
        if jitter == 0.0 || nominal == 0.0 {
            return Duration::from_millis(nominal as u64);
        }
        let factor = 1.0 + rng.gen_range(-jitter..=jitter);
        let ms = (nominal * factor).clamp(0.0, self.policy.max_interval_ms as f64);
        Duration::from_millis(ms as u64)
    }
}
