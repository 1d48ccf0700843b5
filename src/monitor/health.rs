//! Queue health classification.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::alerts::{AlertSeverity, AlertType};
use crate::backend::QueueStats;
use crate::error::ConfigError;
use crate::scaling::ScalingPolicy;

/// Warning and critical bands for one queue.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HealthThresholds {
    pub depth_warning: u64,
    pub depth_critical: u64,
    pub latency_warning_ms: u64,
    pub latency_critical_ms: u64,
    pub error_rate_warning: f64,
    pub error_rate_critical: f64,
}

impl HealthThresholds {
    /// Warning at the policy's scale-up band, critical at twice it, error
    /// rate at 5% and 15%.
    pub fn from_policy(policy: &ScalingPolicy) -> Self {
        Self {
            depth_warning: policy.scale_up.depth,
            depth_critical: policy.scale_up.depth.saturating_mul(2),
            latency_warning_ms: policy.scale_up.latency_ms,
            latency_critical_ms: policy.scale_up.latency_ms.saturating_mul(2),
            error_rate_warning: 0.05,
            error_rate_critical: 0.15,
        }
    }

    /// # Errors
    ///
    /// Returns `ConfigError::InvalidValue` when a warning band exceeds its
    /// critical band or an error rate falls outside `[0, 1]`.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |key: &str, message: &str| ConfigError::InvalidValue {
            key: key.to_string(),
            message: message.to_string(),
        };

        if self.depth_warning > self.depth_critical {
            return Err(invalid("depth_warning", "must be <= depth_critical"));
        }
        if self.latency_warning_ms > self.latency_critical_ms {
            return Err(invalid("latency_warning_ms", "must be <= latency_critical_ms"));
        }
        let in_unit = |v: f64| (0.0..=1.0).contains(&v);
        if !in_unit(self.error_rate_warning) || !in_unit(self.error_rate_critical) {
            return Err(invalid("error_rate", "must be between 0 and 1"));
        }
        if self.error_rate_warning > self.error_rate_critical {
            return Err(invalid("error_rate_warning", "must be <= error_rate_critical"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Warning,
    Critical,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Warning => "warning",
            Self::Critical => "critical",
        }
    }
}

impl From<Option<AlertSeverity>> for HealthStatus {
    fn from(severity: Option<AlertSeverity>) -> Self {
        match severity {
            None => Self::Healthy,
            Some(AlertSeverity::Warning) => Self::Warning,
            Some(AlertSeverity::Critical) => Self::Critical,
        }
    }
}

/// Classified state of a queue at one poll.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueHealthSnapshot {
    pub queue_name: String,
    pub depth: u64,
    pub latency_ms: u64,
    pub error_rate: f64,
    pub jobs_per_minute: f64,
    pub status: HealthStatus,
    pub issues: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

/// One metric's band, with a description when out of band.
#[derive(Debug, Clone, PartialEq)]
pub struct Breach {
    pub alert_type: AlertType,
    pub severity: Option<AlertSeverity>,
    pub message: Option<String>,
}

fn band<T: PartialOrd + Copy>(value: T, warning: T, critical: T) -> Option<AlertSeverity> {
    if value >= critical {
        Some(AlertSeverity::Critical)
    } else if value >= warning {
        Some(AlertSeverity::Warning)
    } else {
        None
    }
}

/// Per-metric bands for depth, latency and error rate, in that order.
pub fn breaches(stats: &QueueStats, thresholds: &HealthThresholds) -> [Breach; 3] {
    let depth = band(stats.depth, thresholds.depth_warning, thresholds.depth_critical);
    let latency = band(
        stats.latency_ms,
        thresholds.latency_warning_ms,
        thresholds.latency_critical_ms,
    );
    let error_rate = band(
        stats.error_rate,
        thresholds.error_rate_warning,
        thresholds.error_rate_critical,
    );

    [
        Breach {
            alert_type: AlertType::QueueDepth,
            severity: depth,
            message: depth.map(|s| {
                format!(
                    "{} queue depth {} (threshold {})",
                    s,
                    stats.depth,
                    if s == AlertSeverity::Critical {
                        thresholds.depth_critical
                    } else {
                        thresholds.depth_warning
                    }
                )
            }),
        },
        Breach {
            alert_type: AlertType::Latency,
            severity: latency,
            message: latency.map(|s| {
                format!(
                    "{} latency {}ms (threshold {}ms)",
                    s,
                    stats.latency_ms,
                    if s == AlertSeverity::Critical {
                        thresholds.latency_critical_ms
                    } else {
                        thresholds.latency_warning_ms
                    }
                )
            }),
        },
        Breach {
            alert_type: AlertType::ErrorRate,
            severity: error_rate,
            message: error_rate.map(|s| {
                format!(
                    "{} error rate {:.1}% (threshold {:.1}%)",
                    s,
                    stats.error_rate * 100.0,
                    if s == AlertSeverity::Critical {
                        thresholds.error_rate_critical * 100.0
                    } else {
                        thresholds.error_rate_warning * 100.0
                    }
                )
            }),
        },
    ]
}

/// Classifies `stats` into a snapshot. Status is the worst metric band.
pub fn classify(
    queue_name: &str,
    stats: &QueueStats,
    thresholds: &HealthThresholds,
    timestamp: DateTime<Utc>,
) -> QueueHealthSnapshot {
    let breaches = breaches(stats, thresholds);
    let worst = breaches.iter().filter_map(|b| b.severity).max();

    QueueHealthSnapshot {
        queue_name: queue_name.to_string(),
        depth: stats.depth,
        latency_ms: stats.latency_ms,
        error_rate: stats.error_rate,
        jobs_per_minute: stats.jobs_per_minute,
        status: HealthStatus::from(worst),
        issues: breaches.into_iter().filter_map(|b| b.message).collect(),
        timestamp,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scaling::Thresholds;

    fn thresholds() -> HealthThresholds {
        let policy = ScalingPolicy::new("q", 1, 10, Thresholds::new(100, 10_000), Thresholds::new(5, 500));
        HealthThresholds::from_policy(&policy)
    }

    #[test]
    fn test_defaults_from_policy() {
        let t = thresholds();
        assert_eq!(t.depth_warning, 100);
        assert_eq!(t.depth_critical, 200);
        assert_eq!(t.latency_critical_ms, 20_000);
        assert!(t.validate().is_ok());
    }

    #[test]
    fn test_classify_healthy() {
        let snapshot = classify("q", &QueueStats::new(10, 100), &thresholds(), Utc::now());
        assert_eq!(snapshot.status, HealthStatus::Healthy);
        assert!(snapshot.issues.is_empty());
    }

    #[test]
    fn test_classify_worst_band_wins() {
        let stats = QueueStats::new(150, 25_000).with_error_rate(0.01);
        let snapshot = classify("q", &stats, &thresholds(), Utc::now());
        assert_eq!(snapshot.status, HealthStatus::Critical);
        assert_eq!(snapshot.issues.len(), 2);
        assert!(snapshot.issues[0].starts_with("warning queue depth 150"));
        assert!(snapshot.issues[1].starts_with("critical latency"));
    }

    #[test]
    fn test_error_rate_band() {
        let stats = QueueStats::new(0, 0).with_error_rate(0.2);
        let snapshot = classify("q", &stats, &thresholds(), Utc::now());
        assert_eq!(snapshot.status, HealthStatus::Critical);
        assert!(snapshot.issues[0].contains("20.0%"));
    }

    #[test]
    fn test_invalid_thresholds() {
        let mut t = thresholds();
        t.error_rate_warning = 0.5;
        t.error_rate_critical = 0.2;
        assert!(t.validate().is_err());
    }
}
