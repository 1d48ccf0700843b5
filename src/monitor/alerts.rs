//! Edge-triggered, deduplicated alerts.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::MonitorError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertType {
    QueueDepth,
    Latency,
    ErrorRate,
    MonitoringFault,
}

impl AlertType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::QueueDepth => "queue_depth",
            Self::Latency => "latency",
            Self::ErrorRate => "error_rate",
            Self::MonitoringFault => "monitoring_fault",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    Warning,
    Critical,
}

impl AlertSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Warning => "warning",
            Self::Critical => "critical",
        }
    }
}

impl std::fmt::Display for AlertSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Alert {
    pub id: Uuid,
    pub queue_name: String,
    pub alert_type: AlertType,
    pub severity: AlertSeverity,
    pub message: String,
    pub created_at: DateTime<Utc>,
    pub acknowledged_at: Option<DateTime<Utc>>,
    pub last_seen_at: DateTime<Utc>,
    /// Breaches folded into this alert, including the first.
    pub occurrences: u32,
}

/// What [`AlertBook::observe`] did with a condition level.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AlertTransition {
    /// No edge: the level is unchanged, lower, or clear.
    Quiet,
    /// A new alert was opened.
    Raised(Alert),
    /// An active alert was reused for a repeated breach.
    Deduplicated(Alert),
    /// An active alert was reused and its severity raised.
    Escalated(Alert),
}

impl AlertTransition {
    /// Alert observers should hear about, if any.
    pub fn notifiable(&self) -> Option<&Alert> {
        match self {
            Self::Raised(alert) | Self::Escalated(alert) => Some(alert),
            Self::Quiet | Self::Deduplicated(_) => None,
        }
    }
}

type AlertKey = (String, AlertType);

/// Active alerts, acknowledged history and the last seen level per
/// `(queue, alert type)`.
#[derive(Debug)]
pub struct AlertBook {
    dedupe_window: Duration,
    levels: HashMap<AlertKey, AlertSeverity>,
    active: Vec<Alert>,
    history: Vec<Alert>,
}

impl AlertBook {
    pub fn new(dedupe_window: Duration) -> Self {
        Self {
            dedupe_window,
            levels: HashMap::new(),
            active: Vec::new(),
            history: Vec::new(),
        }
    }

    /// Feeds the current level of one condition.
    ///
    /// Only a rise (clear to warning/critical, or warning to critical)
    /// counts as an edge. An edge reuses an active alert for the same key
    /// created within the dedupe window, otherwise it opens a new one.
    pub fn observe(
        &mut self,
        queue: &str,
        alert_type: AlertType,
        level: Option<AlertSeverity>,
        message: &str,
        now: DateTime<Utc>,
    ) -> AlertTransition {
        let key = (queue.to_string(), alert_type);

        let Some(severity) = level else {
            self.levels.remove(&key);
            return AlertTransition::Quiet;
        };

        let previous = self.levels.insert(key, severity);
        if previous.is_some_and(|p| p >= severity) {
            return AlertTransition::Quiet;
        }

        let window_start = now - self.dedupe_window;
        let existing = self.active.iter_mut().rev().find(|a| {
            a.queue_name == queue && a.alert_type == alert_type && a.created_at >= window_start
        });

        if let Some(alert) = existing {
            alert.occurrences += 1;
            alert.last_seen_at = now;
            if severity > alert.severity {
                alert.severity = severity;
                alert.message = message.to_string();
                return AlertTransition::Escalated(alert.clone());
            }
            return AlertTransition::Deduplicated(alert.clone());
        }

        let alert = Alert {
            id: Uuid::new_v4(),
            queue_name: queue.to_string(),
            alert_type,
            severity,
            message: message.to_string(),
            created_at: now,
            acknowledged_at: None,
            last_seen_at: now,
            occurrences: 1,
        };
        self.active.push(alert.clone());
        AlertTransition::Raised(alert)
    }

    /// Moves an active alert to history.
    ///
    /// # Errors
    ///
    /// Returns `MonitorError::AlertNotFound` if no active alert has this id.
    pub fn acknowledge(&mut self, id: Uuid, now: DateTime<Utc>) -> Result<Alert, MonitorError> {
        let index = self
            .active
            .iter()
            .position(|a| a.id == id)
            .ok_or(MonitorError::AlertNotFound(id))?;

        let mut alert = self.active.remove(index);
        alert.acknowledged_at = Some(now);
        self.history.push(alert.clone());
        Ok(alert)
    }

    /// Active alerts, oldest first.
    pub fn active(&self) -> &[Alert] {
        &self.active
    }

    /// Acknowledged alerts, in acknowledgement order.
    pub fn history(&self) -> &[Alert] {
        &self.history
    }
}
