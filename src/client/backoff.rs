// ABOUTME: Retry pacing for workers connecting to the broker front address
// ABOUTME: Doubles the wait after each failed attempt, capped and bounded by a deadline

use std::time::{Duration, Instant};

/// Exponential delay between connection attempts, bounded by an overall deadline.
#[derive(Debug, Clone)]
pub struct ConnectBackoff {
    base: Duration,
    max: Duration,
    attempt: u32,
    deadline: Instant,
}

impl ConnectBackoff {
    /// Start pacing attempts that must finish within `budget`.
    #[must_use]
    pub fn new(base: Duration, max: Duration, budget: Duration) -> Self {
        Self {
            base,
            max,
            attempt: 0,
            deadline: Instant::now() + budget,
        }
    }

    /// Delay before the next attempt, or `None` once the deadline has passed.
    ///
    /// Returns `min(base * 2^attempt, max)`, shortened so it never sleeps past
    /// the deadline.
    pub fn next_delay(&mut self) -> Option<Duration> {
        let remaining = self.deadline.checked_duration_since(Instant::now())?;
        if remaining.is_zero() {
            return None;
        }

        let multiplier = 2u32.saturating_pow(self.attempt);
        let delay = self.base.saturating_mul(multiplier).min(self.max);
        self.attempt = self.attempt.saturating_add(1);

        Some(delay.min(remaining))
    }

    /// Number of delays handed out so far
    #[must_use]
    pub const fn attempts(&self) -> u32 {
        self.attempt
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delays_double_then_cap() {
        let mut backoff = ConnectBackoff::new(
            Duration::from_millis(10),
            Duration::from_millis(50),
            Duration::from_secs(60),
        );

        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(10)));
        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(20)));
        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(40)));
        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(50)));
        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(50)));
        assert_eq!(backoff.attempts(), 5);
    }

    #[test]
    fn test_zero_budget_gives_up_immediately() {
        let mut backoff =
            ConnectBackoff::new(Duration::from_millis(10), Duration::from_secs(1), Duration::ZERO);
        assert_eq!(backoff.next_delay(), None);
    }

    #[test]
    fn test_delay_never_exceeds_remaining_budget() {
        let mut backoff = ConnectBackoff::new(
            Duration::from_secs(10),
            Duration::from_secs(10),
            Duration::from_millis(200),
        );
        let delay = backoff.next_delay().unwrap();
        assert!(delay <= Duration::from_millis(200));
    }

    #[test]
    fn test_huge_attempt_count_saturates() {
        let mut backoff = ConnectBackoff::new(
            Duration::from_millis(1),
            Duration::from_millis(5),
            Duration::from_secs(60),
        );
        for _ in 0..100 {
            assert!(backoff.next_delay().unwrap() <= Duration::from_millis(5));
        }
    }
}
