//! Reconnect backoff: exponential growth from a base delay, capped.

use std::time::Duration;

/// Configuration for reconnect behavior.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    /// Reconnect attempts allowed after a failure (0 = fail on first error).
    pub max_retries: u32,
    /// Delay before the first reconnect attempt.
    pub base_delay: Duration,
    /// Maximum delay cap.
    pub max_delay: Duration,
    /// Growth factor applied per attempt.
    pub factor: f64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(10),
            factor: 2.0,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before reconnect attempt `attempt` (1-indexed).
    ///
    /// `min(base * factor^(attempt - 1), max_delay)`. Attempt 0 is treated as 1.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let max_nanos = self.max_delay.as_nanos().min(u64::MAX as u128) as u64;
        let grown_nanos = (self.base_delay.as_nanos() as f64 * self.factor.powi(exponent)).round();

        // Overflow to infinity (or NaN from a bad factor) lands on the cap
        if !grown_nanos.is_finite() || grown_nanos >= max_nanos as f64 {
            return Duration::from_nanos(max_nanos);
        }

        Duration::from_nanos(grown_nanos as u64)
    }

    /// Check if another reconnect attempt may follow `failed_attempts` failures.
    pub fn should_retry(&self, failed_attempts: u32) -> bool {
        failed_attempts < self.max_retries
    }
}
