//! Exponential backoff for broker reconnection.
//!
//! Each failed attempt multiplies the delay by `multiplier` until it reaches
//! `max_delay`, after which it stays flat:
//!
//! ```text
//! reconnect_delay = 1, multiplier = 2, max = 30
//! attempt: 1   2   3   4   5    6    7 ...
//! sleep:   1s  2s  4s  8s  16s  30s  30s
//! ```
//!
//! A successful CONNACK resets the sequence. With an attempt limit set, the
//! attempt after the limit yields `BackoffError::MaxAttemptLimitError` and the
//! connection kernel gives up.

use std::time::Duration;

use thiserror::Error;

use super::config::Config;

#[derive(Debug, Error)]
pub enum BackoffError {
    #[error("Maximum number of attempts exceeded: {0}")]
    MaxAttemptLimitError(u32),
}

#[derive(Debug, Clone)]
pub struct Backoff {
    initial_delay: Duration,
    current_delay: Duration,
    max_delay: Duration,
    multiplier: f64,
    attempt: u32,
    /// `None` retries forever.
    max_attempts: Option<u32>,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration, multiplier: f64) -> Self {
        Self {
            initial_delay: initial,
            current_delay: initial,
            max_delay: max.max(initial),
            multiplier,
            attempt: 0,
            max_attempts: None,
        }
    }

    /// Builds the policy from the transport settings.
    ///
    /// `max_reconnect_attempts = 0` means unlimited.
    pub fn from_config(config: &Config) -> Self {
        let mut backoff = Self::new(
            Duration::from_secs(config.reconnect_delay),
            Duration::from_secs(config.max_reconnect_delay),
            config.reconnect_backoff_multiplier,
        );
        if config.max_reconnect_attempts > 0 {
            backoff.set_max_attempts(config.max_reconnect_attempts);
        }
        backoff
    }

    /// Number of attempts after which the delay stops growing.
    ///
    /// Solves `initial * multiplier^n >= max` for `n`.
    pub fn attempts_to_saturate(&self) -> u32 {
        if self.initial_delay >= self.max_delay || self.multiplier <= 1.0 {
            return 1;
        }
        let ratio = self.max_delay.as_secs_f64() / self.initial_delay.as_secs_f64();
        ratio.log(self.multiplier).ceil() as u32 + 1
    }

    pub fn set_max_attempts(&mut self, max: u32) {
        self.max_attempts = Some(max);
    }

    pub fn reset(&mut self) {
        self.current_delay = self.initial_delay;
        self.attempt = 0;
    }

    pub fn next_sleep(&mut self) -> Result<Duration, BackoffError> {
        self.attempt = self.attempt.saturating_add(1);

        if let Some(max) = self.max_attempts {
            if self.attempt > max {
                return Err(BackoffError::MaxAttemptLimitError(max));
            }
        }

        let sleep = self.current_delay;

        let next = self.current_delay.as_secs_f64() * self.multiplier.max(1.0);
        self.current_delay = Duration::from_secs_f64(next).min(self.max_delay);

        Ok(sleep)
    }

    pub fn max_delay(&self) -> Duration {
        self.max_delay
    }

    pub fn max_attempts(&self) -> Option<u32> {
        self.max_attempts
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn current_delay(&self) -> Duration {
        self.current_delay
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(60), 1.1)
    }
}
