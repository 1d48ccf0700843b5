//! Error types for queue-governor operations.
//!
//! Defines the error taxonomy shared by all subsystems:
//! - Configuration and registration failures
//! - Rate limit denials
//! - Job timeouts versus job handler failures
//! - Memory backpressure rejections
//! - Queue backend monitoring faults
//! - Registry lookups (scaling, monitoring)

use thiserror::Error;

/// Invalid rule, policy or configuration. Registration is rejected.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid rate limit rule '{rule}': {reason}")]
    InvalidRateLimitRule { rule: String, reason: String },

    #[error("Invalid timeout config for job type '{job_type}': {reason}")]
    InvalidTimeoutConfig { job_type: String, reason: String },

    #[error("Invalid scaling policy for queue '{queue}': {reason}")]
    InvalidScalingPolicy { queue: String, reason: String },

    #[error("Invalid memory config: {0}")]
    InvalidMemoryConfig(String),

    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to read configuration from '{path}': {message}")]
    Unreadable { path: String, message: String },

    #[error("Failed to parse configuration: {0}")]
    Parse(String),
}

/// A rate-limited call was denied. The caller decides when to retry.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Rate limit '{rule}' exceeded for key '{key}', retry after {retry_after_ms}ms")]
pub struct RateLimitExceeded {
    pub rule: String,
    pub key: String,
    pub retry_after_ms: u64,
}

/// Errors returned by the rate limiter.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RateLimitError {
    #[error("Rate limit rule '{0}' is not registered")]
    UnknownRule(String),

    #[error(transparent)]
    Exceeded(#[from] RateLimitExceeded),

    #[error("Failed to reschedule rate-limited job: {0}")]
    RequeueFailed(#[from] MonitoringFault),
}

/// Failure of a job run under the timeout handler.
///
/// Timeouts are kept distinct from handler errors so retry policies can tell
/// them apart. Handler errors are passed through unchanged.
#[derive(Debug, Error)]
pub enum JobError<E> {
    #[error("Job '{job_type}' timed out after {elapsed_ms}ms (timeout {timeout_ms}ms)")]
    TimedOut {
        job_type: String,
        timeout_ms: u64,
        elapsed_ms: u64,
    },

    #[error("Job handler failed: {0}")]
    Handler(E),
}

impl<E> JobError<E> {
    /// Returns true when the job hit its hard timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::TimedOut { .. })
    }

    /// Returns the handler's own error, if that is what failed.
    pub fn into_handler_error(self) -> Option<E> {
        match self {
            Self::Handler(e) => Some(e),
            Self::TimedOut { .. } => None,
        }
    }
}

/// Work rejected because running it would push memory past the critical threshold.
#[derive(Debug, Clone, Error, PartialEq)]
#[error(
    "Backpressure on '{label}': {current_mb:.1}MB used + {expected_mb:.1}MB expected exceeds critical threshold {threshold_mb:.1}MB"
)]
pub struct BackpressureError {
    pub label: String,
    pub current_mb: f64,
    pub expected_mb: f64,
    pub threshold_mb: f64,
}

/// A queue backend call failed. The affected queue's tick is skipped.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Monitoring fault on queue '{queue}': {message}")]
pub struct MonitoringFault {
    pub queue: String,
    pub message: String,
}

impl MonitoringFault {
    pub fn new(queue: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
            message: message.into(),
        }
    }
}

/// Errors returned by the scaling manager.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ScalingError {
    #[error("Queue '{0}' has no registered scaling policy")]
    UnknownQueue(String),
}

/// Errors stopping a background task.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TaskError {
    #[error("Background task '{task}' did not stop within {timeout:?}")]
    ShutdownTimeout {
        task: &'static str,
        timeout: std::time::Duration,
    },

    #[error("Background task '{task}' panicked: {message}")]
    Panicked { task: &'static str, message: String },
}

/// Errors returned by the queue monitor.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MonitorError {
    #[error("Alert '{0}' not found among active alerts")]
    AlertNotFound(uuid::Uuid),

    #[error("Queue '{0}' is not monitored")]
    UnknownQueue(String),

    #[error("Monitoring loop is already running")]
    AlreadyRunning,

    #[error(transparent)]
    Config(#[from] ConfigError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_error_distinguishes_timeout() {
        let timeout: JobError<String> = JobError::TimedOut {
            job_type: "email".to_string(),
            timeout_ms: 1000,
            elapsed_ms: 1001,
        };
        assert!(timeout.is_timeout());
        assert!(timeout.to_string().contains("email"));
        assert!(timeout.into_handler_error().is_none());

        let handler: JobError<String> = JobError::Handler("smtp down".to_string());
        assert!(!handler.is_timeout());
        assert_eq!(handler.into_handler_error().as_deref(), Some("smtp down"));
    }

    #[test]
    fn test_rate_limit_error_from_exceeded() {
        let err: RateLimitError = RateLimitExceeded {
            rule: "stripe".to_string(),
            key: "acct-1".to_string(),
            retry_after_ms: 800,
        }
        .into();
        assert!(err.to_string().contains("800ms"));
    }

    #[test]
    fn test_backpressure_display() {
        let err = BackpressureError {
            label: "pdf".to_string(),
            current_mb: 800.0,
            expected_mb: 200.0,
            threshold_mb: 900.0,
        };
        let msg = err.to_string();
        assert!(msg.contains("pdf"));
        assert!(msg.contains("900.0MB"));
    }
}
