use std::time::Duration;
use uuid::Uuid;

/// Exponential backoff shared by the batch reporter and the client HTTP path
///
/// A failure at attempt `a` (the first delivery is attempt 0) is retried
/// after `base_delay * 2^a` while `a < max_retries`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
        }
    }

    /// Backoff after a failure at `attempt`
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor)
    }

    /// Delay before the next attempt, or `None` once retries are exhausted
    pub fn next_delay(&self, attempt: u32) -> Option<Duration> {
        (attempt < self.max_retries).then(|| self.delay_for(attempt))
    }
}

/// Bookkeeping for a batch waiting on a retry timer
#[derive(Debug, Clone)]
pub struct RetryState {
    pub batch_id: Uuid,
    /// Attempt number the pending retry will run as
    pub attempt: u32,
    pub next_delay: Duration,
    /// Sinks that still have to accept the batch
    pub sinks: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delays_double() {
        let policy = RetryPolicy::new(3, Duration::from_millis(1000));
        assert_eq!(policy.next_delay(0), Some(Duration::from_millis(1000)));
        assert_eq!(policy.next_delay(1), Some(Duration::from_millis(2000)));
        assert_eq!(policy.next_delay(2), Some(Duration::from_millis(4000)));
        assert_eq!(policy.next_delay(3), None);
    }

    #[test]
    fn test_zero_retries() {
        let policy = RetryPolicy::new(0, Duration::from_millis(10));
        assert_eq!(policy.next_delay(0), None);
    }

    #[test]
    fn test_large_attempt_saturates() {
        let policy = RetryPolicy::new(u32::MAX, Duration::from_secs(1));
        assert_eq!(policy.delay_for(40), Duration::from_secs(u32::MAX as u64));
    }
}
