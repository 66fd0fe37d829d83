//! Retry policy: exponential backoff without jitter or cap.

use std::time::Duration;

/// Backoff policy for failed jobs.
///
/// The delay before attempt `n` may be retried is `base ^ n` seconds, where
/// `n` is the attempt count after the failure was recorded. With the default
/// base of 2 that yields 2 s, 4 s, 8 s, ... for the first, second and third
/// retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    base: u32,
}

impl RetryPolicy {
    /// Backoff base used when the `backoff_base` config key is unset.
    pub const DEFAULT_BASE: u32 = 2;

    /// Create a policy with the given backoff base.
    pub fn new(base: u32) -> Self {
        Self { base }
    }

    /// Delay before a job with the given attempt count becomes claimable
    /// again. Saturates instead of overflowing for absurd attempt counts.
    pub fn delay(&self, attempts: i64) -> Duration {
        let exponent = u32::try_from(attempts).unwrap_or(u32::MAX);
        Duration::from_secs(u64::from(self.base).saturating_pow(exponent))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(Self::DEFAULT_BASE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_base_doubles() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay(0), Duration::from_secs(1));
        assert_eq!(policy.delay(1), Duration::from_secs(2));
        assert_eq!(policy.delay(2), Duration::from_secs(4));
        assert_eq!(policy.delay(3), Duration::from_secs(8));
    }

    #[test]
    fn base_is_configurable() {
        let policy = RetryPolicy::new(3);
        assert_eq!(policy.delay(2), Duration::from_secs(9));
    }

    #[test]
    fn huge_attempt_counts_saturate() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay(i64::MAX), Duration::from_secs(u64::MAX));
        assert_eq!(policy.delay(-1), Duration::from_secs(u64::MAX));
    }
}
