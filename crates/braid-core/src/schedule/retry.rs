//! Retry policy: decides backoff delays.

use std::time::Duration;

/// Upper bound for one backoff delay.
pub const MAX_RETRY_DELAY: Duration = Duration::from_secs(24 * 60 * 60);

/// Backoff before a failed task is put back to Ready.
///
/// delay = base_delay * multiplier^(attempts - 1), capped at [`MAX_RETRY_DELAY`]
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub multiplier: f64,
}

impl RetryPolicy {
    pub fn new(base_delay: Duration, multiplier: f64) -> Self {
        Self {
            base_delay,
            multiplier,
        }
    }

    /// Retry on the next scheduling tick.
    pub fn immediate() -> Self {
        Self::new(Duration::ZERO, 1.0)
    }

    fn uncapped_secs(&self, attempts: u32) -> f64 {
        if self.base_delay.is_zero() {
            return 0.0;
        }
        let exponent = i32::try_from(attempts.saturating_sub(1)).unwrap_or(i32::MAX);
        self.base_delay.as_secs_f64() * self.multiplier.powi(exponent)
    }

    /// True if the delay after `attempts` attempts would be cut by the cap.
    pub fn exceeds_cap(&self, attempts: u32) -> bool {
        let secs = self.uncapped_secs(attempts);
        !secs.is_finite() || secs > MAX_RETRY_DELAY.as_secs_f64()
    }

    /// Delay after `attempts` attempts (1-indexed). `attempts = 0` uses the base delay.
    pub fn next_delay(&self, attempts: u32) -> Duration {
        let secs = self.uncapped_secs(attempts);
        if secs.is_nan() || secs < 0.0 {
            return MAX_RETRY_DELAY;
        }
        Duration::try_from_secs_f64(secs)
            .unwrap_or(MAX_RETRY_DELAY)
            .min(MAX_RETRY_DELAY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn immediate_policy_has_no_delay() {
        let policy = RetryPolicy::immediate();
        assert_eq!(policy.next_delay(1), Duration::ZERO);
        assert_eq!(policy.next_delay(4), Duration::ZERO);
    }

    #[test]
    fn exponential_backoff_increases() {
        let policy = RetryPolicy::new(Duration::from_secs(2), 2.0);

        let d1 = policy.next_delay(1);
        let d2 = policy.next_delay(2);
        let d3 = policy.next_delay(3);

        assert_eq!(d1, Duration::from_secs(2));
        assert_eq!(d2, Duration::from_secs(4));
        assert_eq!(d3, Duration::from_secs(8));
    }

    #[test]
    fn huge_exponents_are_capped() {
        let policy = RetryPolicy::new(Duration::from_secs(1), 10.0);
        assert_eq!(policy.next_delay(u32::MAX), MAX_RETRY_DELAY);
        assert!(policy.exceeds_cap(u32::MAX));
        assert!(!policy.exceeds_cap(3));
    }

    #[test]
    fn zero_base_never_exceeds_cap() {
        let policy = RetryPolicy::new(Duration::ZERO, 1e300);
        assert_eq!(policy.next_delay(5), Duration::ZERO);
        assert!(!policy.exceeds_cap(5));
    }
}
