//! Exponential backoff parameters for retried subprocess attempts.
//!
//! The delay before retry `n` (1-indexed, the first attempt never waits) is
//! `min(initial * multiplier^(n-1), max)`. The formula is exposed on its own
//! so custom retry loops can reuse it without going through
//! [`crate::retry::RetryExecutor`].

use std::time::Duration;

/// Immutable retry/backoff policy.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first attempt; total attempts are `max_retries + 1`.
    pub max_retries: u32,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Upper bound for any single delay.
    pub max_delay: Duration,
    /// Multiplicative growth factor between retries.
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Total number of attempts, counting the first one.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Backoff delay before retry `attempt` (1-indexed).
    ///
    /// `attempt == 0` is treated like `1`. Overflowing or non-finite values
    /// clamp to `max_delay`.
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let secs = self.initial_delay.as_secs_f64() * self.multiplier.powi(exp);
        let max_secs = self.max_delay.as_secs_f64();

        if !secs.is_finite() || secs < 0.0 || secs > max_secs {
            self.max_delay
        } else {
            Duration::from_secs_f64(secs)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_retries: 5,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
            multiplier: 2.0,
        }
    }

    #[test]
    fn delays_double_until_capped() {
        let p = policy();
        assert_eq!(p.calculate_delay(1), Duration::from_secs(1));
        assert_eq!(p.calculate_delay(2), Duration::from_secs(2));
        assert_eq!(p.calculate_delay(3), Duration::from_secs(4));
        assert_eq!(p.calculate_delay(4), Duration::from_secs(8));
        assert_eq!(p.calculate_delay(5), Duration::from_secs(10));
        assert_eq!(p.calculate_delay(6), Duration::from_secs(10));
    }

    #[test]
    fn matches_closed_form_for_many_attempts() {
        let p = policy();
        for n in 1..=20u32 {
            let expected = Duration::from_secs((1u64 << (n - 1).min(40)).min(10));
            assert_eq!(p.calculate_delay(n), expected, "attempt {n}");
        }
    }

    #[test]
    fn attempt_zero_behaves_like_first() {
        assert_eq!(policy().calculate_delay(0), Duration::from_secs(1));
    }

    #[test]
    fn huge_attempt_clamps_to_max() {
        assert_eq!(policy().calculate_delay(u32::MAX), Duration::from_secs(10));
    }

    #[test]
    fn max_attempts_counts_first_try() {
        assert_eq!(RetryPolicy::default().max_attempts(), 4);
    }
}
