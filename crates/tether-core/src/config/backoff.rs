//! Reconnection backoff configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::duration_secs;
use crate::error::ConfigError;

/// Backoff configuration for reconnection attempts.
///
/// The defaults describe a fixed 10 second wait: `initial == max` with a
/// multiplier of 1 and no jitter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    /// Initial delay
    #[serde(with = "duration_secs")]
    pub initial: Duration,

    /// Maximum delay
    #[serde(with = "duration_secs")]
    pub max: Duration,

    /// Multiplier for each retry
    pub multiplier: f64,

    /// Jitter factor (0.0 to 1.0), only ever added on top of the delay
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(10),
            max: Duration::from_secs(10),
            multiplier: 1.0,
            jitter: 0.0,
        }
    }
}

impl BackoffConfig {
    /// Reject schedules that would retry without waiting or cannot be computed
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.initial.is_zero() || self.max.is_zero() {
            return Err(ConfigError::Invalid(
                "backoff initial and max delays must be greater than zero".to_string(),
            ));
        }
        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            return Err(ConfigError::Invalid(format!(
                "backoff multiplier must be a finite number >= 1, got {}",
                self.multiplier
            )));
        }
        if !(0.0..=1.0).contains(&self.jitter) {
            return Err(ConfigError::Invalid(format!(
                "backoff jitter must be between 0 and 1, got {}",
                self.jitter
            )));
        }
        Ok(())
    }

    /// A fixed delay between attempts
    pub fn fixed(delay: Duration) -> Self {
        Self {
            initial: delay,
            max: delay,
            multiplier: 1.0,
            jitter: 0.0,
        }
    }
}
