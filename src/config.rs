//! Governor configuration.
//!
//! Configuration is read from a YAML file and then overridden by
//! `GOVERNOR_*` environment variables:
//!
//! - `GOVERNOR_REDIS_URL`: queue backend connection URL
//! - `GOVERNOR_POLL_INTERVAL_MS`: queue monitor tick
//! - `GOVERNOR_MAX_HEAP_MB`: process memory budget
//! - `GOVERNOR_MEMORY_WARNING_PERCENT` / `GOVERNOR_MEMORY_CRITICAL_PERCENT`
//! - `GOVERNOR_SAMPLE_INTERVAL_MS`: memory sampler tick
//! - `GOVERNOR_MAX_JOBS_PER_WORKER`: recycle workers after this many jobs
//! - `GOVERNOR_DEFAULT_TIMEOUT_MS`: timeout for unconfigured job types

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::backend::QueueBackend;
use crate::clock::{system_clock, Clock};
use crate::error::{ConfigError, MonitorError};
use crate::governor::Governor;
use crate::memory::{MemoryConfig, MemoryMonitor, MemoryProbe};
use crate::monitor::{HealthThresholds, MonitorSettings, QueueMonitor};
use crate::rate_limit::{RateLimitRule, RateLimiter};
use crate::scaling::{ScalingManager, ScalingPolicy};
use crate::timeout::{TimeoutConfig, TimeoutHandler, TimeoutSettings};

/// One monitored queue: its scaling policy plus optional health bands.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueConfig {
    #[serde(flatten)]
    pub policy: ScalingPolicy,
    /// Derived from the scaling policy when absent.
    #[serde(default)]
    pub health: Option<HealthThresholds>,
}

/// Queue monitor settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub poll_interval_ms: u64,
    pub redis_url: Option<String>,
    /// Health snapshots kept per queue.
    pub history_capacity: usize,
    /// Scaling decisions kept per queue.
    pub scaling_history_capacity: usize,
    pub fault_alert_threshold: u32,
    pub dedupe_window_ms: u64,
    pub decision_channel_capacity: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        let settings = MonitorSettings::default();
        Self {
            poll_interval_ms: 10_000,
            redis_url: None,
            history_capacity: settings.history_capacity,
            scaling_history_capacity: crate::scaling::DEFAULT_HISTORY_CAPACITY,
            fault_alert_threshold: settings.fault_alert_threshold,
            dedupe_window_ms: settings.dedupe_window.as_millis() as u64,
            decision_channel_capacity: settings.decision_channel_capacity,
        }
    }
}

impl MonitorConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn settings(&self) -> MonitorSettings {
        MonitorSettings {
            history_capacity: self.history_capacity,
            fault_alert_threshold: self.fault_alert_threshold,
            dedupe_window: Duration::from_millis(self.dedupe_window_ms),
            decision_channel_capacity: self.decision_channel_capacity,
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let must_be_positive = |key: &str, value: u64| {
            if value == 0 {
                Err(ConfigError::InvalidValue {
                    key: key.to_string(),
                    message: "must be greater than 0".to_string(),
                })
            } else {
                Ok(())
            }
        };

        must_be_positive("monitor.poll_interval_ms", self.poll_interval_ms)?;
        must_be_positive("monitor.history_capacity", self.history_capacity as u64)?;
        must_be_positive(
            "monitor.scaling_history_capacity",
            self.scaling_history_capacity as u64,
        )?;
        must_be_positive(
            "monitor.fault_alert_threshold",
            u64::from(self.fault_alert_threshold),
        )?;
        must_be_positive("monitor.dedupe_window_ms", self.dedupe_window_ms)?;
        must_be_positive(
            "monitor.decision_channel_capacity",
            self.decision_channel_capacity as u64,
        )
    }
}

/// Everything needed to assemble a [`Governor`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GovernorConfig {
    pub queues: Vec<QueueConfig>,
    pub rate_limits: Vec<RateLimitRule>,
    pub timeouts: Vec<TimeoutConfig>,
    pub timeout_settings: TimeoutSettings,
    pub memory: MemoryConfig,
    pub monitor: MonitorConfig,
}

impl GovernorConfig {
    /// Loads configuration from a YAML file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Unreadable {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        Self::from_yaml_str(&content)
    }

    pub fn from_yaml_str(content: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Default configuration with environment overrides applied.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Reads `path` if given, applies environment overrides and validates.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides_from(|key| std::env::var(key).ok())
    }

    /// Applies `GOVERNOR_*` overrides read through `lookup`.
    pub fn apply_overrides_from<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(val) = lookup("GOVERNOR_REDIS_URL") {
            self.monitor.redis_url = Some(val);
        }

        if let Some(val) = lookup("GOVERNOR_POLL_INTERVAL_MS") {
            self.monitor.poll_interval_ms = parse_env_value(&val, "GOVERNOR_POLL_INTERVAL_MS")?;
        }

        // Memory settings
        if let Some(val) = lookup("GOVERNOR_MAX_HEAP_MB") {
            self.memory.max_heap_mb = parse_env_value(&val, "GOVERNOR_MAX_HEAP_MB")?;
        }

        if let Some(val) = lookup("GOVERNOR_MEMORY_WARNING_PERCENT") {
            self.memory.warning_percent =
                parse_env_value(&val, "GOVERNOR_MEMORY_WARNING_PERCENT")?;
        }

        if let Some(val) = lookup("GOVERNOR_MEMORY_CRITICAL_PERCENT") {
            self.memory.critical_percent =
                parse_env_value(&val, "GOVERNOR_MEMORY_CRITICAL_PERCENT")?;
        }

        if let Some(val) = lookup("GOVERNOR_SAMPLE_INTERVAL_MS") {
            self.memory.sample_interval_ms = parse_env_value(&val, "GOVERNOR_SAMPLE_INTERVAL_MS")?;
        }

        if let Some(val) = lookup("GOVERNOR_MAX_JOBS_PER_WORKER") {
            self.memory.max_jobs_per_worker =
                Some(parse_env_value(&val, "GOVERNOR_MAX_JOBS_PER_WORKER")?);
        }

        // Timeout settings
        if let Some(val) = lookup("GOVERNOR_DEFAULT_TIMEOUT_MS") {
            self.timeout_settings.default_timeout_ms =
                parse_env_value(&val, "GOVERNOR_DEFAULT_TIMEOUT_MS")?;
        }

        Ok(())
    }

    /// Validates every section and rejects duplicate queue, rule or job type
    /// names.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.monitor.validate()?;
        self.memory.validate()?;
        self.timeout_settings.validate()?;

        let mut queues = HashSet::new();
        for queue in &self.queues {
            queue.policy.validate()?;
            if let Some(health) = &queue.health {
                health.validate()?;
            }
            if !queues.insert(queue.policy.queue_name.as_str()) {
                return Err(ConfigError::InvalidScalingPolicy {
                    queue: queue.policy.queue_name.clone(),
                    reason: "queue is configured more than once".to_string(),
                });
            }
        }

        let mut rules = HashSet::new();
        for rule in &self.rate_limits {
            rule.validate()?;
            if !rules.insert(rule.name.as_str()) {
                return Err(ConfigError::InvalidRateLimitRule {
                    rule: rule.name.clone(),
                    reason: "rule is configured more than once".to_string(),
                });
            }
        }

        let mut job_types = HashSet::new();
        for timeout in &self.timeouts {
            timeout.validate()?;
            if !job_types.insert(timeout.job_type.as_str()) {
                return Err(ConfigError::InvalidTimeoutConfig {
                    job_type: timeout.job_type.clone(),
                    reason: "job type is configured more than once".to_string(),
                });
            }
        }

        Ok(())
    }

    /// Assembles a governor on the system clock.
    pub fn build(
        &self,
        backend: Arc<dyn QueueBackend>,
        probe: Arc<dyn MemoryProbe>,
    ) -> Result<Governor, ConfigError> {
        self.build_with_clock(backend, probe, system_clock())
    }

    /// Assembles a governor, registering every configured queue, rule and
    /// job type.
    ///
    /// # Errors
    ///
    /// Returns the first validation error; nothing is started.
    pub fn build_with_clock(
        &self,
        backend: Arc<dyn QueueBackend>,
        probe: Arc<dyn MemoryProbe>,
        clock: Arc<dyn Clock>,
    ) -> Result<Governor, ConfigError> {
        self.validate()?;

        let rate_limiter = Arc::new(RateLimiter::with_clock(clock.clone()));
        for rule in &self.rate_limits {
            rate_limiter.register_rule(rule.clone())?;
        }

        let timeouts = Arc::new(TimeoutHandler::with_clock(self.timeout_settings, clock.clone()));
        for timeout in &self.timeouts {
            timeouts.configure(timeout.clone())?;
        }

        let memory = Arc::new(MemoryMonitor::with_clock(self.memory.clone(), probe, clock.clone())?);
        let scaling = Arc::new(
            ScalingManager::with_clock(clock.clone())
                .with_history_capacity(self.monitor.scaling_history_capacity),
        );

        let monitor = QueueMonitor::new(backend, scaling, memory, timeouts, rate_limiter)
            .with_settings(self.monitor.settings())
            .with_clock(clock);

        for queue in &self.queues {
            monitor
                .register_queue(queue.policy.clone(), queue.health)
                .map_err(|e| match e {
                    MonitorError::Config(config) => config,
                    other => ConfigError::InvalidScalingPolicy {
                        queue: queue.policy.queue_name.clone(),
                        reason: other.to_string(),
                    },
                })?;
        }

        Ok(Governor::new(
            Arc::new(monitor),
            self.monitor.poll_interval(),
            Duration::from_millis(self.memory.sample_interval_ms),
        ))
    }
}

/// Parse an environment variable value with proper error handling.
fn parse_env_value<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("could not parse '{}'", value),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::InMemoryQueueBackend;
    use crate::memory::ScriptedMemoryProbe;
    use crate::rate_limit::RateLimitAlgorithm;
    use std::collections::HashMap;
    use std::io::Write;

    const SAMPLE: &str = r#"
monitor:
  poll_interval_ms: 5000
  fault_alert_threshold: 5
queues:
  - queue_name: emails
    min_workers: 2
    max_workers: 20
    scale_up: { depth: 100, latency_ms: 30000 }
    scale_down: { depth: 10, latency_ms: 1000 }
  - queue_name: reports
    min_workers: 1
    max_workers: 4
    scale_up: { depth: 50, latency_ms: 60000 }
    scale_down: { depth: 5, latency_ms: 5000 }
    scale_up_cooldown_ms: 30000
    health:
      depth_warning: 40
      depth_critical: 200
      latency_warning_ms: 60000
      latency_critical_ms: 120000
      error_rate_warning: 0.1
      error_rate_critical: 0.3
rate_limits:
  - name: stripe
    max_requests: 100
    window_ms: 1000
    algorithm: token_bucket
  - name: sendgrid
    max_requests: 5
    window_ms: 1000
    block_duration_ms: 10000
timeouts:
  - job_type: pdf
    base_timeout_ms: 60000
    adaptive: true
    floor_ms: 5000
memory:
  max_heap_mb: 2048
  max_jobs_per_worker: 500
"#;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = GovernorConfig::default();
        assert!(config.queues.is_empty());
        assert_eq!(config.monitor.poll_interval_ms, 10_000);
        assert_eq!(config.monitor.fault_alert_threshold, 3);
        assert_eq!(config.monitor.dedupe_window_ms, 3_600_000);
        assert_eq!(config.timeout_settings.default_timeout_ms, 30_000);
        assert_eq!(config.memory.max_heap_mb, 1024.0);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_yaml() {
        let config = GovernorConfig::from_yaml_str(SAMPLE).unwrap();
        assert_eq!(config.monitor.poll_interval_ms, 5000);
        assert_eq!(config.monitor.fault_alert_threshold, 5);
        assert_eq!(config.monitor.history_capacity, 60);

        assert_eq!(config.queues.len(), 2);
        let emails = &config.queues[0];
        assert_eq!(emails.policy.queue_name, "emails");
        assert_eq!(emails.policy.scale_up_cooldown_ms, 60_000);
        assert!(emails.health.is_none());
        let reports = &config.queues[1];
        assert_eq!(reports.policy.scale_up_cooldown_ms, 30_000);
        assert_eq!(reports.health.unwrap().depth_critical, 200);

        assert_eq!(config.rate_limits[0].algorithm, RateLimitAlgorithm::TokenBucket);
        assert_eq!(config.rate_limits[1].block_duration_ms, Some(10_000));
        assert!(config.timeouts[0].adaptive);
        assert_eq!(config.memory.max_jobs_per_worker, Some(500));
        assert_eq!(config.memory.warning_percent, 80.0);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();

        let config = GovernorConfig::from_file(file.path()).unwrap();
        assert_eq!(config.queues.len(), 2);
    }

    #[test]
    fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let result = GovernorConfig::from_file(&dir.path().join("absent.yaml"));
        assert!(matches!(result, Err(ConfigError::Unreadable { .. })));
    }

    #[test]
    fn test_malformed_yaml() {
        let result = GovernorConfig::from_yaml_str("queues: [ {queue_name: ");
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_env_overrides() {
        let mut config = GovernorConfig::from_yaml_str(SAMPLE).unwrap();
        config
            .apply_overrides_from(lookup(&[
                ("GOVERNOR_REDIS_URL", "redis://cache:6379"),
                ("GOVERNOR_POLL_INTERVAL_MS", "2500"),
                ("GOVERNOR_MAX_HEAP_MB", "4096"),
                ("GOVERNOR_MEMORY_CRITICAL_PERCENT", "90"),
                ("GOVERNOR_MAX_JOBS_PER_WORKER", "1000"),
                ("GOVERNOR_DEFAULT_TIMEOUT_MS", "45000"),
            ]))
            .unwrap();

        assert_eq!(config.monitor.redis_url.as_deref(), Some("redis://cache:6379"));
        assert_eq!(config.monitor.poll_interval_ms, 2500);
        assert_eq!(config.memory.max_heap_mb, 4096.0);
        assert_eq!(config.memory.critical_percent, 90.0);
        assert_eq!(config.memory.max_jobs_per_worker, Some(1000));
        assert_eq!(config.timeout_settings.default_timeout_ms, 45_000);
        // Untouched values survive
        assert_eq!(config.memory.warning_percent, 80.0);
    }

    #[test]
    fn test_invalid_env_value() {
        let mut config = GovernorConfig::default();
        let result = config.apply_overrides_from(lookup(&[("GOVERNOR_POLL_INTERVAL_MS", "soon")]));
        match result {
            Err(ConfigError::InvalidValue { key, .. }) => {
                assert_eq!(key, "GOVERNOR_POLL_INTERVAL_MS");
            }
            other => panic!("expected InvalidValue, got {:?}", other),
        }
    }

    #[test]
    fn test_validation_duplicate_queue() {
        let mut config = GovernorConfig::from_yaml_str(SAMPLE).unwrap();
        let duplicate = config.queues[0].clone();
        config.queues.push(duplicate);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidScalingPolicy { .. })
        ));
    }

    #[test]
    fn test_validation_duplicate_rule() {
        let mut config = GovernorConfig::default();
        config.rate_limits.push(RateLimitRule::new("stripe", 10, 1000));
        config.rate_limits.push(RateLimitRule::new("stripe", 20, 1000));
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidRateLimitRule { .. })
        ));
    }

    #[test]
    fn test_validation_zero_poll_interval() {
        let mut config = GovernorConfig::default();
        config.monitor.poll_interval_ms = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_validation_memory_thresholds() {
        let mut config = GovernorConfig::default();
        config.memory.warning_percent = 99.0;
        config.memory.critical_percent = 90.0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidMemoryConfig(_))
        ));
    }

    #[test]
    fn test_build_registers_everything() {
        let config = GovernorConfig::from_yaml_str(SAMPLE).unwrap();
        let governor = config
            .build(
                Arc::new(InMemoryQueueBackend::new()),
                Arc::new(ScriptedMemoryProbe::constant(100.0)),
            )
            .unwrap();

        assert_eq!(governor.monitor().queue_names(), vec!["emails", "reports"]);
        assert!(governor.scaling().policy("reports").is_some());
        assert_eq!(governor.rate_limiter().rule_names().len(), 2);
        assert_eq!(governor.timeouts().effective_timeout("pdf"), 60_000);
        assert_eq!(governor.memory().config().max_heap_mb, 2048.0);
        assert_eq!(governor.poll_interval(), Duration::from_millis(5000));
        assert_eq!(governor.sample_interval(), Duration::from_millis(5000));
    }

    #[test]
    fn test_build_rejects_invalid_policy() {
        let mut config = GovernorConfig::from_yaml_str(SAMPLE).unwrap();
        config.queues[0].policy.min_workers = 50;
        let result = config.build(
            Arc::new(InMemoryQueueBackend::new()),
            Arc::new(ScriptedMemoryProbe::constant(100.0)),
        );
        assert!(matches!(
            result,
            Err(ConfigError::InvalidScalingPolicy { .. })
        ));
    }
}
