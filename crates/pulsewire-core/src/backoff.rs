//! Bounded exponential backoff.
//!
//! Every client retries on the identical schedule. Deployments with many
//! clients against one server would want jitter layered on top of
//! [`delay`]; the schedule itself stays the contract.

use std::time::Duration;

/// `min(base * 2^attempt, max)`, saturating to `max` on overflow.
#[must_use]
pub fn delay(attempt: u32, base: Duration, max: Duration) -> Duration {
    2u32.checked_pow(attempt)
        .and_then(|factor| base.checked_mul(factor))
        .map_or(max, |d| d.min(max))
}

/// Retry schedule and attempt limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// Delay before the first retry.
    pub base: Duration,
    /// Upper bound for any single delay.
    pub max: Duration,
    /// Retries allowed before giving up; `0` retries forever.
    pub max_attempts: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(1_000),
            max: Duration::from_millis(30_000),
            max_attempts: 10,
        }
    }
}

impl BackoffPolicy {
    /// Delay to wait before the retry that follows `attempt` failures.
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        delay(attempt, self.base, self.max)
    }

    /// Whether a retry may be scheduled after `attempt` failed retries.
    #[must_use]
    pub const fn allows(&self, attempt: u32) -> bool {
        self.max_attempts == 0 || attempt < self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SEC: Duration = Duration::from_secs(1);

    #[test]
    fn test_doubles_until_ceiling() {
        let max = Duration::from_secs(30);
        let delays: Vec<u64> = (0..7).map(|a| delay(a, SEC, max).as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 30, 30]);
    }

    #[test]
    fn test_huge_attempt_saturates() {
        let max = Duration::from_secs(30);
        assert_eq!(delay(40, SEC, max), max);
        assert_eq!(delay(u32::MAX, SEC, max), max);
    }

    #[test]
    fn test_zero_base() {
        assert_eq!(delay(5, Duration::ZERO, SEC), Duration::ZERO);
    }

    #[test]
    fn test_policy_limits() {
        let policy = BackoffPolicy {
            max_attempts: 3,
            ..BackoffPolicy::default()
        };
        assert!(policy.allows(0));
        assert!(policy.allows(2));
        assert!(!policy.allows(3));

        let unlimited = BackoffPolicy {
            max_attempts: 0,
            ..BackoffPolicy::default()
        };
        assert!(unlimited.allows(u32::MAX));
    }

    #[test]
    fn test_default_schedule() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.delay_for(0), Duration::from_millis(1_000));
        assert_eq!(policy.delay_for(4), Duration::from_millis(16_000));
        assert_eq!(policy.delay_for(9), Duration::from_millis(30_000));
    }
}
