//! Retry policy with exponential backoff and jitter.

use rand::Rng;
use std::time::Duration;

use crate::config::RetryConfig;

/// Hard ceiling on a single backoff delay.
const MAX_DELAY: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub backoff_factor: f64,
    /// Fractional jitter band, e.g. 0.2 for +/-20%.
    pub jitter: f64,
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay: Duration::from_millis(config.base_delay_ms),
            backoff_factor: config.backoff_factor,
            jitter: config.jitter,
        }
    }
}

impl RetryPolicy {
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            base_delay: Duration::ZERO,
            backoff_factor: 2.0,
            jitter: 0.0,
        }
    }

    /// Backoff before retry number `retry` (1-based). Retry 1 waits the base
    /// delay, retry 2 twice that, and so on, capped at [`MAX_DELAY`].
    /// `deterministic` disables the jitter band.
    pub fn delay_for_retry(&self, retry: u32, deterministic: bool) -> Duration {
        if retry == 0 {
            return Duration::ZERO;
        }
        let base = self.base_delay.as_secs_f64() * self.backoff_factor.powi(retry as i32 - 1);
        let capped = base.min(MAX_DELAY.as_secs_f64());

        let final_delay = if deterministic || self.jitter <= 0.0 {
            capped
        } else {
            let factor = 1.0 + rand::thread_rng().gen_range(-self.jitter..=self.jitter);
            capped * factor.max(0.0)
        };
        Duration::from_secs_f64(final_delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deterministic_backoff_doubles() {
        let policy = RetryPolicy {
            max_retries: 2,
            base_delay: Duration::from_millis(200),
            backoff_factor: 2.0,
            jitter: 0.2,
        };
        assert_eq!(policy.delay_for_retry(0, true), Duration::ZERO);
        assert_eq!(policy.delay_for_retry(1, true), Duration::from_millis(200));
        assert_eq!(policy.delay_for_retry(2, true), Duration::from_millis(400));
        assert_eq!(policy.delay_for_retry(3, true), Duration::from_millis(800));
    }

    #[test]
    fn jitter_stays_within_band() {
        let policy = RetryPolicy {
            max_retries: 2,
            base_delay: Duration::from_millis(1000),
            backoff_factor: 2.0,
            jitter: 0.2,
        };
        for _ in 0..100 {
            let d = policy.delay_for_retry(1, false).as_secs_f64();
            assert!((0.8..=1.2).contains(&d), "delay {} outside band", d);
        }
    }

    #[test]
    fn delay_is_capped() {
        let policy = RetryPolicy {
            max_retries: 10,
            base_delay: Duration::from_secs(10),
            backoff_factor: 10.0,
            jitter: 0.0,
        };
        assert_eq!(policy.delay_for_retry(5, true), MAX_DELAY);
    }
}
