//! Retry shape: capped exponential backoff with additive jitter, and the
//! dead-letter threshold.
//!
//! `delay(n) = min(max, base * 2^(n-1)) + uniform(0, jitter)`
//!
//! This is the only place retry timing is defined; the dispatcher asks the
//! policy and never computes delays itself.

use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;

use herald_common::config::OutboxConfig;
use herald_common::error::AppError;

/// Doubling stops growing past this exponent; the cap is reached long before.
const MAX_EXPONENT: u32 = 20;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackoffPolicy {
    base: Duration,
    max: Duration,
    jitter: Duration,
    max_attempts: u32,
}

impl BackoffPolicy {
    pub fn new(
        base: Duration,
        max: Duration,
        jitter: Duration,
        max_attempts: u32,
    ) -> Result<Self, AppError> {
        if base.is_zero() {
            return Err(AppError::Config("backoff base must be greater than zero".into()));
        }
        if max < base {
            return Err(AppError::Config(
                "backoff cap must not be smaller than the base delay".into(),
            ));
        }
        if max_attempts == 0 {
            return Err(AppError::Config("max_attempts must be at least 1".into()));
        }
        Ok(Self {
            base,
            max,
            jitter,
            max_attempts,
        })
    }

    pub fn from_config(config: &OutboxConfig) -> Result<Self, AppError> {
        Self::new(
            Duration::from_millis(config.base_backoff_ms),
            Duration::from_millis(config.max_backoff_ms),
            Duration::from_millis(config.jitter_ms),
            config.max_attempts,
        )
    }

    /// Delay before the retry that follows attempt number `attempts` (1-based).
    pub fn next_delay(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1).min(MAX_EXPONENT);
        let exponential = self.base.saturating_mul(2_u32.saturating_pow(exponent));
        let capped = exponential.min(self.max);
        capped + self.sample_jitter()
    }

    /// `now + next_delay(attempts)`.
    pub fn next_eligible_at(&self, attempts: u32, now: DateTime<Utc>) -> DateTime<Utc> {
        chrono::Duration::from_std(self.next_delay(attempts))
            .ok()
            .and_then(|delay| now.checked_add_signed(delay))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// True once the event has used up its attempt budget.
    pub fn is_exhausted(&self, attempts: u32) -> bool {
        attempts >= self.max_attempts
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Largest value `next_delay` can return.
    pub fn upper_bound(&self) -> Duration {
        self.max + self.jitter
    }

    fn sample_jitter(&self) -> Duration {
        let jitter_ms = self.jitter.as_millis() as u64;
        if jitter_ms == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::rng().random_range(0..=jitter_ms))
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        let config = OutboxConfig::default();
        Self {
            base: Duration::from_millis(config.base_backoff_ms),
            max: Duration::from_millis(config.max_backoff_ms),
            jitter: Duration::from_millis(config.jitter_ms),
            max_attempts: config.max_attempts,
        }
    }
}
