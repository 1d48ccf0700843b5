//! Rate limit rule definitions.

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Admission algorithm used by a rule.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitAlgorithm {
    /// Count admitted calls in a trailing window of `window_ms`.
    #[default]
    SlidingWindow,
    /// Refill `max_requests` tokens continuously over `window_ms`.
    TokenBucket,
}

/// A named outbound rate limit, e.g. "at most 100 Stripe calls per second".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitRule {
    /// Rule name used by callers in `check_limit`.
    pub name: String,
    /// Maximum admitted calls per window (bucket capacity for token buckets).
    pub max_requests: u32,
    /// Window length in milliseconds.
    pub window_ms: u64,
    /// When set, a denied key stays blocked for this long.
    #[serde(default)]
    pub block_duration_ms: Option<u64>,
    #[serde(default)]
    pub algorithm: RateLimitAlgorithm,
}

impl RateLimitRule {
    /// Creates a sliding-window rule.
    pub fn new(name: impl Into<String>, max_requests: u32, window_ms: u64) -> Self {
        Self {
            name: name.into(),
            max_requests,
            window_ms,
            block_duration_ms: None,
            algorithm: RateLimitAlgorithm::SlidingWindow,
        }
    }

    /// Sets the block duration applied after a denial.
    pub fn with_block_duration_ms(mut self, block_ms: u64) -> Self {
        self.block_duration_ms = Some(block_ms);
        self
    }

    /// Sets the admission algorithm.
    pub fn with_algorithm(mut self, algorithm: RateLimitAlgorithm) -> Self {
        self.algorithm = algorithm;
        self
    }

    /// Tokens refilled per millisecond (token bucket only).
    pub fn refill_per_ms(&self) -> f64 {
        self.max_requests as f64 / self.window_ms as f64
    }

    /// Checks the rule is usable.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidRateLimitRule` for an empty name, a zero
    /// request budget or a zero window.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |reason: &str| ConfigError::InvalidRateLimitRule {
            rule: self.name.clone(),
            reason: reason.to_string(),
        };

        if self.name.trim().is_empty() {
            return Err(invalid("name must not be empty"));
        }
        if self.max_requests == 0 {
            return Err(invalid("max_requests must be greater than 0"));
        }
        if self.window_ms == 0 {
            return Err(invalid("window_ms must be greater than 0"));
        }
        Ok(())
    }
}
