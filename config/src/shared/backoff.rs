use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::shared::ValidationError;

/// Exponential backoff schedule for retryable source errors.
///
/// Delays grow as `initial_delay_ms * multiplier^(attempt - 1)` and never exceed
/// `max_delay_ms`. Once `max_attempts` retries have been spent the error is surfaced.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct BackoffConfig {
    /// Default: 100ms
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    /// Must be >= 1.0. Default: 1.3
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    /// Default: 60000ms
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Retry budget per operation. Default: 10
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

fn default_initial_delay_ms() -> u64 {
    100
}

fn default_multiplier() -> f64 {
    1.3
}

fn default_max_delay_ms() -> u64 {
    60_000
}

fn default_max_attempts() -> u32 {
    10
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: default_initial_delay_ms(),
            multiplier: default_multiplier(),
            max_delay_ms: default_max_delay_ms(),
            max_attempts: default_max_attempts(),
        }
    }
}

impl BackoffConfig {
    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            return Err(ValidationError::InvalidFieldValue {
                field: "backoff.multiplier".to_string(),
                constraint: "must be a finite number >= 1.0".to_string(),
            });
        }

        if self.initial_delay_ms > self.max_delay_ms {
            return Err(ValidationError::InvalidFieldValue {
                field: "backoff.initial_delay_ms".to_string(),
                constraint: "must not exceed backoff.max_delay_ms".to_string(),
            });
        }

        Ok(())
    }
}
