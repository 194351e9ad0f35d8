use std::time::Duration;

/// How many times a failed connect or bind is retried, and how long to wait
/// between attempts.
///
/// `max_attempts` counts retries after the first attempt: `0` disables
/// retrying, a negative value retries forever and `N > 0` allows at most `N`
/// retries (so `N + 1` attempts in total).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: i32,
    delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::disabled()
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: i32, delay: Duration) -> Self {
        Self {
            max_attempts,
            delay,
        }
    }

    pub fn disabled() -> Self {
        Self::new(0, crate::config::DEFAULT_RETRY_DELAY)
    }

    pub fn unbounded(delay: Duration) -> Self {
        Self::new(-1, delay)
    }

    pub fn max_attempts(&self) -> i32 {
        self.max_attempts
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    pub fn is_enabled(&self) -> bool {
        self.max_attempts != 0
    }

    pub fn is_unbounded(&self) -> bool {
        self.max_attempts < 0
    }

    /// Whether another attempt is allowed after `retries` retries already
    /// happened.
    pub fn should_retry(&self, retries: u32) -> bool {
        self.is_unbounded() || i64::from(retries) < i64::from(self.max_attempts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_never_retries() {
        let policy = RetryPolicy::disabled();
        assert!(!policy.is_enabled());
        assert!(!policy.should_retry(0));
    }

    #[test]
    fn bounded_allows_exactly_n_retries() {
        let policy = RetryPolicy::new(2, Duration::from_millis(5));
        assert!(policy.should_retry(0));
        assert!(policy.should_retry(1));
        assert!(!policy.should_retry(2));
    }

    #[test]
    fn unbounded_keeps_going() {
        let policy = RetryPolicy::unbounded(Duration::from_millis(5));
        assert!(policy.is_unbounded());
        assert!(policy.should_retry(u32::MAX));
    }
}
