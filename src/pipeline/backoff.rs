//! Exponential retry delay for a single stream.

use std::time::Duration;

use crate::config::PollPolicy;

/// Doubling delay from `retry_base`, capped at `retry_max`.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    attempt: u32,
}

impl Backoff {
    /// Creates a backoff from the retry half of `policy`.
    #[must_use]
    pub fn new(policy: &PollPolicy) -> Self {
        Self {
            base: policy.retry_base,
            max: policy.retry_max,
            attempt: 0,
        }
    }

    /// Returns the delay before the next retry and counts the attempt.
    pub fn next_delay(&mut self) -> Duration {
        let factor = 2u32.saturating_pow(self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        self.base.saturating_mul(factor).min(self.max)
    }

    /// Forgets past failures after a successful step.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Failures since the last reset.
    #[must_use]
    pub const fn attempts(&self) -> u32 {
        self.attempt
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> PollPolicy {
        PollPolicy {
            idle_interval: Duration::from_millis(100),
            retry_base: Duration::from_millis(500),
            retry_max: Duration::from_secs(3),
        }
    }

    #[test]
    fn delay_doubles_until_cap() {
        let mut backoff = Backoff::new(&policy());
        let delays: Vec<u128> = (0..6).map(|_| backoff.next_delay().as_millis()).collect();
        assert_eq!(delays, vec![500, 1000, 2000, 3000, 3000, 3000]);
        assert_eq!(backoff.attempts(), 6);
    }

    #[test]
    fn reset_starts_over() {
        let mut backoff = Backoff::new(&policy());
        backoff.next_delay();
        backoff.next_delay();
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(500));
    }

    #[test]
    fn huge_attempt_counts_saturate() {
        let mut backoff = Backoff::new(&policy());
        for _ in 0..100 {
            backoff.next_delay();
        }
        assert_eq!(backoff.next_delay(), Duration::from_secs(3));
    }
}
