//! Exponential backoff schedule for re-enqueued delivery tasks

use rand::Rng;
use std::time::Duration;

/// Backoff parameters for per-inbox delivery retries.
#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    /// First retry delay; doubles per attempt.
    pub base: Duration,
    /// Upper bound on any single delay.
    pub cap: Duration,
    /// Attempts after which the task is surfaced and dropped.
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            base: Duration::from_secs(60),
            cap: Duration::from_secs(6 * 60 * 60),
            max_attempts: 8,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (0-based): `min(base * 2^attempt,
    /// cap)` plus up to 25% jitter so synchronized failures spread out.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = self
            .base
            .saturating_mul(2u32.saturating_pow(attempt.min(30)))
            .min(self.cap);
        let jitter = rand::thread_rng().gen_range(0.0..0.25);
        exp + exp.mul_f64(jitter)
    }
}
