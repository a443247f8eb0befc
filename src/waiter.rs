//! Politeness delays between requests to the same host.

use std::time::Duration;

use rand::Rng;

/// Delay calculator for one host.
///
/// `get()` returns the pause before the next request; a retryable failure
/// raises it on a capped-exponential curve and a success resets it.
#[derive(Debug, Clone)]
pub struct Waiter {
    wait: Duration,
    random: bool,
    max_retry_wait: Duration,
    failures: u32,
}

impl Waiter {
    pub fn new(wait: Duration, random: bool, max_retry_wait: Duration) -> Self {
        Self {
            wait,
            random,
            max_retry_wait,
            failures: 0,
        }
    }

    /// Current delay, jittered into [0.5w, 1.5w] when `--random-wait` is on.
    pub fn get(&self) -> Duration {
        let base = if self.failures > 0 {
            self.backoff()
        } else {
            self.wait
        };

        if self.random && !base.is_zero() {
            let factor = rand::thread_rng().gen_range(0.5..1.5);
            base.mul_f64(factor)
        } else {
            base
        }
    }

    /// min(2^failures, waitretry) seconds, never below the base wait.
    fn backoff(&self) -> Duration {
        let exp = Duration::from_secs(1u64 << self.failures.min(16));
        exp.min(self.max_retry_wait).max(self.wait)
    }

    /// Register a retryable failure.
    pub fn increment(&mut self) {
        self.failures = self.failures.saturating_add(1);
    }

    /// Back to the configured base delay.
    pub fn reset(&mut self) {
        self.failures = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_wait() {
        let waiter = Waiter::new(Duration::from_secs(2), false, Duration::from_secs(10));
        assert_eq!(waiter.get(), Duration::from_secs(2));
    }

    #[test]
    fn test_exponential_backoff_capped() {
        let mut waiter = Waiter::new(Duration::ZERO, false, Duration::from_secs(10));

        waiter.increment();
        assert_eq!(waiter.get(), Duration::from_secs(2));
        waiter.increment();
        assert_eq!(waiter.get(), Duration::from_secs(4));
        waiter.increment();
        assert_eq!(waiter.get(), Duration::from_secs(8));
        waiter.increment();
        // Capped at waitretry.
        assert_eq!(waiter.get(), Duration::from_secs(10));

        waiter.reset();
        assert_eq!(waiter.get(), Duration::ZERO);
    }

    #[test]
    fn test_random_wait_bounds() {
        let waiter = Waiter::new(Duration::from_secs(4), true, Duration::from_secs(10));
        for _ in 0..50 {
            let delay = waiter.get();
            assert!(delay >= Duration::from_secs(2));
            assert!(delay <= Duration::from_secs(6));
        }
    }
}
