use std::time;

#[derive(Copy, Clone, Debug)]
/// The backoff policy the readiness probe uses between port connection attempts.
pub struct Backoff {
    /// Coefficient to multiply initial_interval with for every past attempt.
    multiplier: f64,
    /// The interval after the first failed attempt.
    initial_interval: time::Duration,
    /// The maximum possible interval between attempts.
    maximum_interval: time::Duration,
}

impl Backoff {
    /// Calculate the time to wait after the given zero-based failed attempt.
    pub fn interval(&self, attempt: u32) -> time::Duration {
        // Past 32 attempts every sane configuration is pinned at the maximum anyway.
        let factor = self.multiplier.max(1.0).powi(attempt.min(32) as i32);
        let candidate = self.initial_interval.as_nanos() as f64 * factor;
        let maximum = self.maximum_interval.as_nanos() as f64;

        time::Duration::from_nanos(candidate.min(maximum) as u64)
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            multiplier: 1.5,
            initial_interval: time::Duration::from_millis(100),
            maximum_interval: time::Duration::from_secs(2),
        }
    }
}
