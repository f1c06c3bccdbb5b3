//! # Backoff Calculator
//!
//! Re-enqueue delays for retries: exponential growth from the configured
//! base with a cap and optional jitter, so correlated failures do not
//! re-enqueue in lockstep.

use rand::Rng;
use std::time::Duration;

use crate::config::BackoffConfig;

#[derive(Debug, Clone)]
pub struct BackoffCalculator {
    config: BackoffConfig,
}

impl BackoffCalculator {
    pub fn new(config: BackoffConfig) -> Self {
        Self { config }
    }

    /// Delay before re-enqueueing the given attempt (1-based). Attempt 1
    /// waits the base delay; each further attempt multiplies it, capped at
    /// `max_delay_seconds`, with up to `max_jitter` added on top.
    pub fn delay_for_attempt(&self, attempt: i32) -> Duration {
        let exponent = attempt.max(1) - 1;
        let raw = self.config.retry_delay_seconds as f64 * self.config.multiplier.powi(exponent);
        let capped = raw.min(self.config.max_delay_seconds as f64);
        let jittered = if self.config.jitter_enabled {
            self.apply_jitter(capped)
        } else {
            capped
        };
        Duration::from_secs_f64(jittered)
    }

    fn apply_jitter(&self, delay_seconds: f64) -> f64 {
        let jitter_range = delay_seconds * self.config.max_jitter;
        if jitter_range <= 0.0 {
            return delay_seconds;
        }
        let mut rng = rand::thread_rng();
        delay_seconds + rng.gen_range(0.0..=jitter_range)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn calculator(jitter: bool) -> BackoffCalculator {
        BackoffCalculator::new(BackoffConfig {
            retry_delay_seconds: 5,
            max_delay_seconds: 300,
            multiplier: 2.0,
            jitter_enabled: jitter,
            max_jitter: 0.1,
        })
    }

    #[test]
    fn grows_exponentially_without_jitter() {
        let backoff = calculator(false);
        assert_eq!(backoff.delay_for_attempt(1), Duration::from_secs(5));
        assert_eq!(backoff.delay_for_attempt(2), Duration::from_secs(10));
        assert_eq!(backoff.delay_for_attempt(3), Duration::from_secs(20));
        assert_eq!(backoff.delay_for_attempt(4), Duration::from_secs(40));
    }

    #[test]
    fn caps_at_max_delay() {
        let backoff = calculator(false);
        assert_eq!(backoff.delay_for_attempt(30), Duration::from_secs(300));
    }

    #[test]
    fn nonsense_attempt_clamps_to_base() {
        let backoff = calculator(false);
        assert_eq!(backoff.delay_for_attempt(0), Duration::from_secs(5));
        assert_eq!(backoff.delay_for_attempt(-3), Duration::from_secs(5));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let backoff = calculator(true);
        for _ in 0..100 {
            let delay = backoff.delay_for_attempt(2).as_secs_f64();
            assert!((10.0..=11.0).contains(&delay), "delay {delay} out of bounds");
        }
    }
}
