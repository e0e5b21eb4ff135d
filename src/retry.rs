use std::fmt;
use std::time::Duration;

use rand::Rng;
use serde::Deserialize;

use crate::config::duration_ms;

/// Decides whether and when a failed put is attempted again.
pub trait RetryStrategy: fmt::Debug + Send + Sync + 'static {
    /// The pause before the next attempt, after `failures` failed attempts.
    /// `None` gives up.
    fn next_delay(&self, failures: u32) -> Option<Duration>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backoff {
    /// Always wait `interval`.
    #[default]
    Fixed,
    /// Double the wait after every failure, up to `max_interval`.
    Exponential,
}

/// Bounded attempts with a fixed or exponential pause in between.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    #[serde(rename = "interval_ms", with = "duration_ms")]
    pub interval: Duration,
    pub backoff: Backoff,
    #[serde(rename = "max_interval_ms", with = "duration_ms")]
    pub max_interval: Duration,
    /// Scale every pause by a random factor in `[0.5, 1.5)`.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            interval: Duration::from_secs(1),
            backoff: Backoff::Fixed,
            max_interval: Duration::from_secs(30),
            jitter: false,
        }
    }
}

impl RetryPolicy {
    pub fn fixed(max_attempts: u32, interval: Duration) -> Self {
        Self {
            max_attempts,
            interval,
            ..Default::default()
        }
    }

    pub fn exponential(max_attempts: u32, interval: Duration, max_interval: Duration) -> Self {
        Self {
            max_attempts,
            interval,
            backoff: Backoff::Exponential,
            max_interval,
            jitter: false,
        }
    }

    pub fn with_jitter(mut self) -> Self {
        self.jitter = true;
        self
    }

    fn base_delay(&self, failures: u32) -> Duration {
        match self.backoff {
            Backoff::Fixed => self.interval,
            Backoff::Exponential => {
                let factor = 1u32.checked_shl(failures.saturating_sub(1)).unwrap_or(u32::MAX);
                self.interval
                    .checked_mul(factor)
                    .unwrap_or(self.max_interval)
                    .min(self.max_interval)
            }
        }
    }
}

impl RetryStrategy for RetryPolicy {
    fn next_delay(&self, failures: u32) -> Option<Duration> {
        if failures >= self.max_attempts {
            return None;
        }
        let delay = self.base_delay(failures);
        if !self.jitter || delay.is_zero() {
            return Some(delay);
        }
        let factor = rand::rng().random_range(0.5..1.5);
        Some(delay.mul_f64(factor))
    }
}
