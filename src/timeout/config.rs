//! Timeout configuration per job type.

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Options accepted by [`TimeoutHandler::wrap`](super::TimeoutHandler::wrap).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeoutOptions {
    /// Hard timeout before any adaptation.
    pub timeout_ms: u64,
    /// Retune the timeout from observed latency.
    #[serde(default)]
    pub adaptive: bool,
    /// Lower bound for adaptive timeouts.
    #[serde(default)]
    pub floor_ms: Option<u64>,
    /// Upper bound for adaptive timeouts.
    #[serde(default)]
    pub ceiling_ms: Option<u64>,
}

impl TimeoutOptions {
    /// Fixed timeout.
    pub fn fixed(timeout_ms: u64) -> Self {
        Self {
            timeout_ms,
            adaptive: false,
            floor_ms: None,
            ceiling_ms: None,
        }
    }

    /// Adaptive timeout starting at `timeout_ms`, kept within `[floor_ms, ceiling_ms]`.
    pub fn adaptive(timeout_ms: u64, floor_ms: u64, ceiling_ms: u64) -> Self {
        Self {
            timeout_ms,
            adaptive: true,
            floor_ms: Some(floor_ms),
            ceiling_ms: Some(ceiling_ms),
        }
    }
}

/// Timeout settings for one job type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeoutConfig {
    pub job_type: String,
    pub base_timeout_ms: u64,
    #[serde(default)]
    pub adaptive: bool,
    /// Defaults to a tenth of the base timeout.
    #[serde(default)]
    pub floor_ms: Option<u64>,
    /// Defaults to ten times the base timeout.
    #[serde(default)]
    pub ceiling_ms: Option<u64>,
}

impl TimeoutConfig {
    pub fn new(job_type: impl Into<String>, base_timeout_ms: u64) -> Self {
        Self {
            job_type: job_type.into(),
            base_timeout_ms,
            adaptive: false,
            floor_ms: None,
            ceiling_ms: None,
        }
    }

    pub fn from_options(job_type: impl Into<String>, options: TimeoutOptions) -> Self {
        Self {
            job_type: job_type.into(),
            base_timeout_ms: options.timeout_ms,
            adaptive: options.adaptive,
            floor_ms: options.floor_ms,
            ceiling_ms: options.ceiling_ms,
        }
    }

    /// Enables adaptive tuning within `[floor_ms, ceiling_ms]`.
    pub fn with_adaptive(mut self, floor_ms: u64, ceiling_ms: u64) -> Self {
        self.adaptive = true;
        self.floor_ms = Some(floor_ms);
        self.ceiling_ms = Some(ceiling_ms);
        self
    }

    pub fn floor(&self) -> u64 {
        self.floor_ms.unwrap_or((self.base_timeout_ms / 10).max(1))
    }

    pub fn ceiling(&self) -> u64 {
        self.ceiling_ms
            .unwrap_or_else(|| self.base_timeout_ms.saturating_mul(10))
    }

    /// Clamps a candidate timeout into this config's bounds.
    pub fn clamp(&self, timeout_ms: u64) -> u64 {
        timeout_ms.clamp(self.floor(), self.ceiling())
    }

    /// # Errors
    ///
    /// Returns `ConfigError::InvalidTimeoutConfig` for a zero timeout, a zero
    /// floor, or a floor above the ceiling.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |reason: String| ConfigError::InvalidTimeoutConfig {
            job_type: self.job_type.clone(),
            reason,
        };

        if self.job_type.trim().is_empty() {
            return Err(invalid("job_type must not be empty".to_string()));
        }
        if self.base_timeout_ms == 0 {
            return Err(invalid("base_timeout_ms must be greater than 0".to_string()));
        }
        if self.floor() == 0 {
            return Err(invalid("floor_ms must be greater than 0".to_string()));
        }
        if self.floor() > self.ceiling() {
            return Err(invalid(format!(
                "floor_ms ({}) must be <= ceiling_ms ({})",
                self.floor(),
                self.ceiling()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_bounds() {
        let config = TimeoutConfig::new("email", 30_000);
        assert_eq!(config.floor(), 3_000);
        assert_eq!(config.ceiling(), 300_000);
        assert_eq!(config.clamp(100), 3_000);
        assert_eq!(config.clamp(1_000_000), 300_000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation() {
        assert!(TimeoutConfig::new("email", 0).validate().is_err());
        assert!(TimeoutConfig::new("", 10).validate().is_err());

        let inverted = TimeoutConfig::new("pdf", 1_000).with_adaptive(5_000, 200);
        let err = inverted.validate().unwrap_err();
        assert!(err.to_string().contains("floor_ms"));
    }

    #[test]
    fn test_from_options() {
        let config = TimeoutConfig::from_options("pdf", TimeoutOptions::adaptive(1_000, 200, 5_000));
        assert!(config.adaptive);
        assert_eq!(config.floor(), 200);
        assert_eq!(config.ceiling(), 5_000);
    }
}
