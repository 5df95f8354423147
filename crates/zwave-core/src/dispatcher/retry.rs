//! Retry and backoff policy for serial API transactions.

use std::time::Duration;

/// Exponential backoff: `initial * 2^attempt`, capped at `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExponentialBackoff {
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl ExponentialBackoff {
    pub fn new(initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            initial_delay,
            max_delay,
        }
    }

    /// Delay before retry number `attempt` (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.initial_delay.saturating_mul(factor).min(self.max_delay)
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new(Duration::from_millis(100), Duration::from_millis(2000))
    }
}

/// How long to wait for each reply and how often to resend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total transmissions per transaction, including the first.
    pub max_attempts: u32,
    /// Wait for the controller's ACK byte.
    pub ack_timeout: Duration,
    /// Wait for each expected reply frame after the ACK.
    pub reply_timeout: Duration,
    pub backoff: ExponentialBackoff,
}

impl RetryPolicy {
    /// Whether another transmission is allowed after `attempts` sends.
    pub fn should_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }

    /// Delay after the `attempts`-th failed send.
    pub fn delay_after(&self, attempts: u32) -> Duration {
        self.backoff.delay(attempts.saturating_sub(1))
    }

    /// Upper bound on the time one transaction can occupy the link.
    pub fn worst_case(&self) -> Duration {
        (0..self.max_attempts.max(1)).fold(Duration::ZERO, |total, attempt| {
            total + self.ack_timeout + self.reply_timeout + self.backoff.delay(attempt)
        })
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            ack_timeout: Duration::from_millis(1000),
            reply_timeout: Duration::from_millis(5000),
            backoff: ExponentialBackoff::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_delay() {
        let backoff = ExponentialBackoff::new(Duration::from_millis(100), Duration::from_millis(1000));
        assert_eq!(backoff.delay(0), Duration::from_millis(100));
        assert_eq!(backoff.delay(1), Duration::from_millis(200));
        assert_eq!(backoff.delay(3), Duration::from_millis(800));
        assert_eq!(backoff.delay(4), Duration::from_millis(1000));
        assert_eq!(backoff.delay(40), Duration::from_millis(1000));
    }

    #[test]
    fn test_attempt_budget() {
        let policy = RetryPolicy::default();
        assert!(policy.should_retry(1));
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));
        assert_eq!(policy.delay_after(1), Duration::from_millis(100));
        assert_eq!(policy.delay_after(2), Duration::from_millis(200));
    }
}
