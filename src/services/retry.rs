use rand::Rng;
use std::time::Duration;

/// Exponential backoff with additive jitter, plus the retry-eligibility rule.
///
/// `backoff(attempt) = base^attempt + uniform(0, max_jitter)` seconds, where
/// `attempt` is the 0-indexed count of prior completed attempts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    base: f64,
    max_jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(2.0, 1.0)
    }
}

impl RetryPolicy {
    pub fn new(base: f64, max_jitter: f64) -> Self {
        Self {
            base: base.max(1.0),
            max_jitter: max_jitter.max(0.0),
        }
    }

    /// Deterministic part of the delay, in seconds.
    pub fn exponential_secs(&self, attempt: u32) -> f64 {
        self.base.powi(attempt.min(i32::MAX as u32) as i32)
    }

    pub fn backoff(&self, attempt: u32) -> Duration {
        self.backoff_with(attempt, &mut rand::thread_rng())
    }

    pub fn backoff_with<R: Rng>(&self, attempt: u32, rng: &mut R) -> Duration {
        let jitter = if self.max_jitter > 0.0 {
            rng.gen_range(0.0..=self.max_jitter)
        } else {
            0.0
        };
        let secs = self.exponential_secs(attempt) + jitter;
        Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
    }

    /// Whether a job that has now failed `attempts_after_failure` times gets another run.
    ///
    /// `max_retries` counts re-runs after the first attempt, so a job runs at
    /// most `max_retries + 1` times and `max_retries = 0` dead-letters on the
    /// first failure. A strict `<` here would run a job only `max_retries`
    /// times in total.
    pub fn should_retry(&self, attempts_after_failure: u32, max_retries: u32) -> bool {
        attempts_after_failure <= max_retries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_backoff_without_jitter_is_exact() {
        let policy = RetryPolicy::new(2.0, 0.0);
        assert_eq!(policy.backoff(0), Duration::from_secs(1));
        assert_eq!(policy.backoff(1), Duration::from_secs(2));
        assert_eq!(policy.backoff(3), Duration::from_secs(8));
    }

    #[test]
    fn test_jitter_is_additive_and_bounded() {
        let policy = RetryPolicy::default();
        let mut rng = StdRng::seed_from_u64(7);
        for attempt in 0..8 {
            for _ in 0..50 {
                let delay = policy.backoff_with(attempt, &mut rng).as_secs_f64();
                let floor = policy.exponential_secs(attempt);
                assert!(delay >= floor, "attempt {attempt}: {delay} < {floor}");
                assert!(delay <= floor + 1.0 + 1e-9, "attempt {attempt}: {delay} too large");
            }
        }
    }

    #[test]
    fn test_backoff_is_monotonic_in_floor() {
        let policy = RetryPolicy::default();
        let mut rng = StdRng::seed_from_u64(42);
        for attempt in 0..10u32 {
            let next = policy.backoff_with(attempt + 1, &mut rng).as_secs_f64();
            assert!(next >= 2f64.powi(attempt as i32 + 1));
        }
    }

    #[test]
    fn test_should_retry_boundary() {
        let policy = RetryPolicy::default();
        assert!(policy.should_retry(1, 3));
        assert!(policy.should_retry(3, 3));
        assert!(!policy.should_retry(4, 3));
        assert!(policy.should_retry(1, 1));
        assert!(!policy.should_retry(2, 1));
    }

    #[test]
    fn test_zero_retries_never_retries() {
        let policy = RetryPolicy::default();
        assert!(!policy.should_retry(1, 0));
    }

    #[test]
    fn test_huge_attempt_saturates() {
        let policy = RetryPolicy::new(10.0, 0.0);
        assert_eq!(policy.backoff(u32::MAX), Duration::MAX);
    }
}
