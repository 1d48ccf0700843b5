//! Scaling policies and decisions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Depth and latency band.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Thresholds {
    pub depth: u64,
    pub latency_ms: u64,
}

impl Thresholds {
    pub fn new(depth: u64, latency_ms: u64) -> Self {
        Self { depth, latency_ms }
    }
}

/// How one queue's worker count may move.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScalingPolicy {
    pub queue_name: String,
    pub min_workers: u32,
    pub max_workers: u32,
    /// Scale up when depth or latency reaches this band.
    pub scale_up: Thresholds,
    /// Scale down when depth and latency are both within this band.
    pub scale_down: Thresholds,
    #[serde(default = "default_scale_up_cooldown_ms")]
    pub scale_up_cooldown_ms: u64,
    #[serde(default = "default_scale_down_cooldown_ms")]
    pub scale_down_cooldown_ms: u64,
}

fn default_scale_up_cooldown_ms() -> u64 {
    60_000
}

fn default_scale_down_cooldown_ms() -> u64 {
    300_000
}

impl ScalingPolicy {
    pub fn new(
        queue_name: impl Into<String>,
        min_workers: u32,
        max_workers: u32,
        scale_up: Thresholds,
        scale_down: Thresholds,
    ) -> Self {
        Self {
            queue_name: queue_name.into(),
            min_workers,
            max_workers,
            scale_up,
            scale_down,
            scale_up_cooldown_ms: default_scale_up_cooldown_ms(),
            scale_down_cooldown_ms: default_scale_down_cooldown_ms(),
        }
    }

    pub fn with_cooldowns(mut self, scale_up_ms: u64, scale_down_ms: u64) -> Self {
        self.scale_up_cooldown_ms = scale_up_ms;
        self.scale_down_cooldown_ms = scale_down_ms;
        self
    }

    /// True when the scale-down band reaches past the scale-up band, so both
    /// rules can match the same snapshot.
    pub fn has_overlapping_bands(&self) -> bool {
        self.scale_down.depth >= self.scale_up.depth
            || self.scale_down.latency_ms >= self.scale_up.latency_ms
    }

    /// # Errors
    ///
    /// Returns `ConfigError::InvalidScalingPolicy` for an empty queue name,
    /// `max_workers == 0`, `min_workers > max_workers` or zero scale-up
    /// thresholds.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |reason: &str| ConfigError::InvalidScalingPolicy {
            queue: self.queue_name.clone(),
            reason: reason.to_string(),
        };

        if self.queue_name.trim().is_empty() {
            return Err(invalid("queue_name must not be empty"));
        }
        if self.max_workers == 0 {
            return Err(invalid("max_workers must be greater than 0"));
        }
        if self.min_workers > self.max_workers {
            return Err(invalid("min_workers must be <= max_workers"));
        }
        if self.scale_up.depth == 0 || self.scale_up.latency_ms == 0 {
            return Err(invalid("scale_up thresholds must be greater than 0"));
        }
        Ok(())
    }
}

/// Queue state the decision is made from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScalingSnapshot {
    pub depth: u64,
    pub latency_ms: u64,
    pub current_workers: u32,
}

impl ScalingSnapshot {
    pub fn new(depth: u64, latency_ms: u64, current_workers: u32) -> Self {
        Self {
            depth,
            latency_ms,
            current_workers,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScalingAction {
    ScaleUp,
    ScaleDown,
    None,
}

impl ScalingAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ScaleUp => "scale_up",
            Self::ScaleDown => "scale_down",
            Self::None => "none",
        }
    }
}

impl std::fmt::Display for ScalingAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one evaluation, published to the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScalingDecision {
    pub timestamp: DateTime<Utc>,
    pub queue_name: String,
    pub action: ScalingAction,
    pub current_workers: u32,
    pub target_workers: u32,
    pub reason: String,
}

impl ScalingDecision {
    pub fn is_change(&self) -> bool {
        self.action != ScalingAction::None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> ScalingPolicy {
        ScalingPolicy::new("emails", 2, 20, Thresholds::new(100, 30_000), Thresholds::new(10, 1_000))
    }

    #[test]
    fn test_validate() {
        assert!(policy().validate().is_ok());

        let mut p = policy();
        p.min_workers = 30;
        assert!(p.validate().is_err());

        let mut p = policy();
        p.max_workers = 0;
        p.min_workers = 0;
        assert!(p.validate().is_err());
    }

    #[test]
    fn test_overlapping_bands() {
        assert!(!policy().has_overlapping_bands());

        let mut p = policy();
        p.scale_down.depth = 500;
        assert!(p.has_overlapping_bands());
        assert!(p.validate().is_ok());
    }

    #[test]
    fn test_yaml_defaults() {
        let yaml = r#"
queue_name: reports
min_workers: 1
max_workers: 8
scale_up: { depth: 50, latency_ms: 10000 }
scale_down: { depth: 5, latency_ms: 500 }
"#;
        let p: ScalingPolicy = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(p.scale_up_cooldown_ms, 60_000);
        assert_eq!(p.scale_down_cooldown_ms, 300_000);
    }

    #[test]
    fn test_action_serde() {
        let json = serde_json::to_string(&ScalingAction::ScaleUp).unwrap();
        assert_eq!(json, "\"scale_up\"");
    }
}
