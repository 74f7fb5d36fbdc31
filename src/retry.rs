//! Reconnection backoff for backend servers.
//!
//! A backend that just failed should not be hammered: the first retry waits
//! the configured retry timeout, subsequent consecutive failures double the
//! wait up to a cap, with a little jitter so several workers do not reconnect
//! in lockstep. Any successful connect resets the policy.

use std::time::Duration;

use rand::Rng;

pub trait RetryPolicy {
    /// Delay to apply before the next attempt, `None` for "go now".
    fn current_delay(&self) -> Option<Duration>;
    fn fail(&mut self);
    fn succeed(&mut self);
    fn consecutive_failures(&self) -> usize;
}

#[derive(Debug, Clone)]
pub struct ExponentialBackoffPolicy {
    base: Duration,
    cap: Duration,
    failures: usize,
}

impl ExponentialBackoffPolicy {
    pub fn new(base: Duration) -> Self {
        ExponentialBackoffPolicy {
            base,
            cap: Duration::from_secs(60),
            failures: 0,
        }
    }

    pub fn with_cap(base: Duration, cap: Duration) -> Self {
        ExponentialBackoffPolicy {
            base,
            cap,
            failures: 0,
        }
    }
}

impl RetryPolicy for ExponentialBackoffPolicy {
    fn current_delay(&self) -> Option<Duration> {
        if self.failures == 0 {
            return None;
        }
        let exponent = (self.failures - 1).min(16) as u32;
        let raw = self
            .base
            .saturating_mul(2u32.saturating_pow(exponent))
            .min(self.cap);
        // +/- 10% jitter
        let jitter = rand::thread_rng().gen_range(0.9..1.1);
        Some(raw.mul_f64(jitter).min(self.cap))
    }

    fn fail(&mut self) {
        self.failures += 1;
    }

    fn succeed(&mut self) {
        self.failures = 0;
    }

    fn consecutive_failures(&self) -> usize {
        self.failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_delay_before_first_failure() {
        let policy = ExponentialBackoffPolicy::new(Duration::from_secs(5));
        assert_eq!(policy.current_delay(), None);
    }

    #[test]
    fn delay_grows_and_caps() {
        let mut policy =
            ExponentialBackoffPolicy::with_cap(Duration::from_secs(5), Duration::from_secs(60));
        policy.fail();
        let first = policy.current_delay().unwrap();
        assert!(first >= Duration::from_millis(4500) && first <= Duration::from_millis(5500));

        for _ in 0..10 {
            policy.fail();
        }
        assert!(policy.current_delay().unwrap() <= Duration::from_secs(60));
    }

    #[test]
    fn success_resets() {
        let mut policy = ExponentialBackoffPolicy::new(Duration::from_secs(5));
        policy.fail();
        policy.fail();
        assert_eq!(policy.consecutive_failures(), 2);
        policy.succeed();
        assert_eq!(policy.current_delay(), None);
    }
}
