//! Retry policy with exponential backoff and full jitter

use std::time::Duration;

use rand::Rng;

use crate::config::RetryConfig;

/// Retry settings for upstream calls
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Deadline for a single attempt
    pub attempt_timeout: Duration,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: config.base_delay(),
            max_delay: config.max_delay(),
            attempt_timeout: config.attempt_timeout(),
            jitter: config.jitter,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    /// Start a fresh backoff sequence for one call
    pub fn backoff(&self) -> Backoff {
        Backoff {
            policy: self.clone(),
            attempts: 0,
        }
    }

    /// Upper bound of the delay after the given (1-based) failed attempt
    ///
    /// `base * 2^(attempt-1)`, capped at `max_delay`.
    pub fn ceiling(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Backoff state for a single call: attempts made and the next delay
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: RetryPolicy,
    attempts: u32,
}

impl Backoff {
    /// Record the start of an attempt, returning its 1-based number
    pub fn begin_attempt(&mut self) -> u32 {
        self.attempts += 1;
        self.attempts
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn can_retry(&self) -> bool {
        self.attempts < self.policy.max_attempts
    }

    /// Delay before the next attempt, or `None` once attempts are exhausted
    ///
    /// With jitter the delay is uniform in `[0, ceiling]`. An upstream
    /// `retry_after` hint raises the delay, still bounded by `max_delay`.
    pub fn next_delay(&mut self, retry_after: Option<Duration>) -> Option<Duration> {
        if !self.can_retry() {
            return None;
        }

        let ceiling = self.policy.ceiling(self.attempts.max(1));
        let delay = if self.policy.jitter {
            full_jitter(ceiling)
        } else {
            ceiling
        };

        let delay = match retry_after {
            Some(hint) => delay.max(hint.min(self.policy.max_delay)),
            None => delay,
        };
        Some(delay)
    }
}

/// Uniform random duration in `[0, ceiling]`
fn full_jitter(ceiling: Duration) -> Duration {
    let max_ms = u64::try_from(ceiling.as_millis()).unwrap_or(u64::MAX);
    if max_ms == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::thread_rng().gen_range(0..=max_ms))
}
