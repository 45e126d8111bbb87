use std::time::Duration;

use rand::Rng;

/// Bounded retry with jittered exponential backoff.
///
/// Used by adapter clients for transient transport failures; fatal failures
/// are never retried.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Delay before the second attempt; doubles each retry.
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    /// No retries at all; the first failure surfaces.
    #[must_use]
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            base_delay: Duration::ZERO,
        }
    }

    /// Delay before retry number `attempt` (1-based), with ±50% uniform
    /// jitter so synchronized clients do not stampede a recovering backend.
    #[allow(clippy::cast_possible_truncation)]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = self.base_delay.as_millis() as u64 * (1u64 << attempt.saturating_sub(1).min(16));
        let jittered = rand::thread_rng().gen_range((exp / 2)..=(exp + exp / 2).max(exp / 2 + 1));
        Duration::from_millis(jittered)
    }

    /// Whether another attempt is allowed after `attempt` failures.
    pub fn should_retry(&self, failures: u32) -> bool {
        failures < self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_allows_three_attempts() {
        let policy = RetryPolicy::default();
        assert!(policy.should_retry(1));
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));
    }

    #[test]
    #[allow(clippy::cast_possible_truncation)]
    fn delay_grows_and_stays_jittered() {
        let policy = RetryPolicy {
            max_attempts: 4,
            base_delay: Duration::from_millis(100),
        };
        for attempt in 1..=3 {
            let base = 100u64 << (attempt - 1);
            let d = policy.delay_for(attempt).as_millis() as u64;
            assert!(d >= base / 2, "attempt {attempt}: {d} < {}", base / 2);
            assert!(d <= base + base / 2 + 1, "attempt {attempt}: {d} too large");
        }
    }

    #[test]
    fn none_never_retries() {
        assert!(!RetryPolicy::none().should_retry(1));
    }
}
