//! Retry policy for provider calls
//!
//! Instead of a blocking retry loop, the policy is an explicit state machine:
//! the caller starts an attempt, reports its failure, and receives either a
//! backoff delay or a decision to give up. This composes with bulkhead waits
//! and cancellation because the caller owns every suspension point.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::config::defaults::*;
use crate::config::duration_serde::duration;

/// Configuration for retry behavior
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first one
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Delay after the first failed attempt
    #[serde(default = "default_base_delay", with = "duration")]
    pub base_delay: Duration,
    /// Upper bound for any single delay
    #[serde(default = "default_max_delay", with = "duration")]
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,
    /// Scale each delay by a uniform factor in [0.5, 1.0]
    #[serde(default = "default_jitter")]
    pub jitter: bool,
}

fn default_max_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}

fn default_base_delay() -> Duration {
    Duration::from_millis(DEFAULT_BASE_DELAY_MS)
}

fn default_max_delay() -> Duration {
    Duration::from_millis(DEFAULT_MAX_DELAY_MS)
}

fn default_backoff_factor() -> f64 {
    DEFAULT_BACKOFF_FACTOR
}

fn default_jitter() -> bool {
    true
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay: default_base_delay(),
            max_delay: default_max_delay(),
            backoff_factor: default_backoff_factor(),
            jitter: default_jitter(),
        }
    }
}

impl RetryConfig {
    /// A single attempt and no backoff
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            jitter: false,
            ..Self::default()
        }
    }

    /// Un-jittered delay after `failed_attempt` (1-based):
    /// `min(base_delay * backoff_factor^(failed_attempt - 1), max_delay)`
    pub fn delay_for_attempt(&self, failed_attempt: u32) -> Duration {
        let exponent = failed_attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let delay_secs = self.base_delay.as_secs_f64() * self.backoff_factor.powi(exponent);
        let capped = delay_secs.min(self.max_delay.as_secs_f64());

        if capped.is_finite() && capped >= 0.0 {
            Duration::from_secs_f64(capped)
        } else {
            self.max_delay
        }
    }

    fn apply_jitter(&self, delay: Duration) -> Duration {
        if !self.jitter || delay.is_zero() {
            return delay;
        }
        let factor: f64 = rand::rng().random_range(0.5..=1.0);
        delay.mul_f64(factor)
    }
}

/// What the caller should do after a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Sleep for the delay, then start another attempt
    RetryAfter(Duration),
    /// Stop; the failure just reported is final
    GiveUp,
}

/// Per-call retry state: how many attempts have started and what comes next
#[derive(Debug, Clone)]
pub struct RetrySchedule {
    config: RetryConfig,
    attempts: u32,
}

impl RetrySchedule {
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config,
            attempts: 0,
        }
    }

    /// Begin the next attempt and return its 1-based number
    pub fn start_attempt(&mut self) -> u32 {
        self.attempts += 1;
        self.attempts
    }

    /// Number of attempts started so far
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn max_attempts(&self) -> u32 {
        self.config.max_attempts
    }

    /// Report that the current attempt failed
    pub fn on_failure(&mut self, retryable: bool) -> RetryDecision {
        if !retryable || self.attempts >= self.config.max_attempts {
            return RetryDecision::GiveUp;
        }
        let delay = self.config.delay_for_attempt(self.attempts);
        RetryDecision::RetryAfter(self.config.apply_jitter(delay))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixed_config() -> RetryConfig {
        RetryConfig {
            max_attempts: 4,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(5),
            backoff_factor: 2.0,
            jitter: false,
        }
    }

    #[test]
    fn test_exponential_delays_are_capped() {
        let config = fixed_config();
        assert_eq!(config.delay_for_attempt(1), Duration::from_secs(1));
        assert_eq!(config.delay_for_attempt(2), Duration::from_secs(2));
        assert_eq!(config.delay_for_attempt(3), Duration::from_secs(4));
        assert_eq!(config.delay_for_attempt(4), Duration::from_secs(5));
        assert_eq!(config.delay_for_attempt(40), Duration::from_secs(5));
    }

    #[test]
    fn test_schedule_gives_up_after_max_attempts() {
        let mut schedule = RetrySchedule::new(fixed_config());
        let mut delays = Vec::new();

        loop {
            schedule.start_attempt();
            match schedule.on_failure(true) {
                RetryDecision::RetryAfter(delay) => delays.push(delay),
                RetryDecision::GiveUp => break,
            }
        }

        assert_eq!(schedule.attempts(), 4);
        assert_eq!(
            delays,
            vec![
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(4)
            ]
        );
    }

    #[test]
    fn test_non_retryable_failure_stops_immediately() {
        let mut schedule = RetrySchedule::new(fixed_config());
        schedule.start_attempt();
        assert_eq!(schedule.on_failure(false), RetryDecision::GiveUp);
        assert_eq!(schedule.attempts(), 1);
    }

    #[test]
    fn test_jitter_stays_within_half_to_full_delay() {
        let config = RetryConfig {
            jitter: true,
            ..fixed_config()
        };
        for _ in 0..200 {
            let mut schedule = RetrySchedule::new(config.clone());
            schedule.start_attempt();
            schedule.start_attempt();
            match schedule.on_failure(true) {
                RetryDecision::RetryAfter(delay) => {
                    assert!(delay >= Duration::from_secs(1));
                    assert!(delay <= Duration::from_secs(2));
                }
                RetryDecision::GiveUp => panic!("expected a retry"),
            }
        }
    }

    #[test]
    fn test_no_retry_config() {
        let mut schedule = RetrySchedule::new(RetryConfig::no_retry());
        schedule.start_attempt();
        assert_eq!(schedule.on_failure(true), RetryDecision::GiveUp);
    }
}
