//! Retry policy for failed stage executions.
//!
//! Implements exponential backoff with configurable parameters.

use super::models::StageError;
use crate::config::PipelineSettings;

/// Retry policy implementing exponential backoff.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Attempts allowed per stage, first execution included.
    pub max_attempts: u32,
    /// Initial backoff duration in seconds.
    pub initial_backoff_secs: u64,
    /// Maximum backoff duration in seconds (cap for exponential growth).
    pub max_backoff_secs: u64,
    /// Multiplier applied to backoff after each retry.
    pub backoff_multiplier: f64,
}

impl RetryPolicy {
    /// Create a new RetryPolicy from configuration settings.
    pub fn new(config: &PipelineSettings) -> Self {
        Self {
            max_attempts: config.max_attempts,
            initial_backoff_secs: config.initial_backoff_secs,
            max_backoff_secs: config.max_backoff_secs,
            backoff_multiplier: config.backoff_multiplier,
        }
    }

    /// Unix timestamp of the next attempt after `failed_attempts` failures.
    ///
    /// Uses exponential backoff: `initial_backoff * multiplier^(failed_attempts - 1)`,
    /// capped at `max_backoff_secs`.
    pub fn next_retry_at(&self, failed_attempts: u32) -> i64 {
        chrono::Utc::now().timestamp() + self.backoff_secs(failed_attempts) as i64
    }

    /// Check if a stage should run again after `failed_attempts` failures,
    /// the one described by `error` included.
    pub fn should_retry(&self, error: &StageError, failed_attempts: u32) -> bool {
        error.is_retryable() && failed_attempts < self.max_attempts
    }

    /// Backoff in seconds before the attempt following `failed_attempts` failures.
    pub fn backoff_secs(&self, failed_attempts: u32) -> u64 {
        let exponent = failed_attempts.saturating_sub(1).min(i32::MAX as u32) as i32;
        let backoff = self.initial_backoff_secs as f64 * self.backoff_multiplier.powi(exponent);
        backoff.min(self.max_backoff_secs as f64) as u64
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_secs: 5,
            max_backoff_secs: 300,
            backoff_multiplier: 2.0,
        }
    }
}
