//! Metric recording helpers.
//!
//! `MetricsCollector` wraps the raw Prometheus metrics and gives each
//! subsystem one call per event. Every method is a no-op until
//! `init_metrics()` has run, so library users who do not export metrics pay
//! nothing.

use super::prometheus::{
    ACTIVE_ALERTS, ALERTS_RAISED_TOTAL, BACKPRESSURE_REJECTIONS, EFFECTIVE_TIMEOUT, JOB_DURATION,
    JOB_EXECUTIONS_TOTAL, MEMORY_USED_MB, QUEUE_DEPTH, QUEUE_LATENCY, RATE_LIMIT_DECISIONS,
    RECYCLE_SIGNALS, SCALING_DECISIONS_TOTAL, SOFT_TIMEOUTS_TOTAL, TARGET_WORKERS,
};

/// Metrics collector for recording queue-governor operational metrics.
#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsCollector;

impl MetricsCollector {
    /// Create a new MetricsCollector instance.
    pub fn new() -> Self {
        Self
    }

    /// Record a rate limit check.
    pub fn record_rate_limit(&self, rule: &str, allowed: bool) {
        let result = if allowed { "allowed" } else { "denied" };
        if let Some(decisions) = RATE_LIMIT_DECISIONS.get() {
            decisions.with_label_values(&[rule, result]).inc();
        }
    }

    /// Record a finished job execution.
    ///
    /// # Arguments
    ///
    /// * `job_type` - Job type label
    /// * `outcome` - "success", "timeout" or "error"
    /// * `duration_secs` - Wall time spent in the handler
    pub fn record_execution(&self, job_type: &str, outcome: &str, duration_secs: f64) {
        if let Some(executions) = JOB_EXECUTIONS_TOTAL.get() {
            executions.with_label_values(&[job_type, outcome]).inc();
        }

        if let Some(duration) = JOB_DURATION.get() {
            duration.with_label_values(&[job_type]).observe(duration_secs);
        }

        tracing::trace!(
            job_type = job_type,
            outcome = outcome,
            duration_secs = duration_secs,
            "Recorded job execution metric"
        );
    }

    pub fn record_soft_timeout(&self, job_type: &str) {
        if let Some(soft) = SOFT_TIMEOUTS_TOTAL.get() {
            soft.with_label_values(&[job_type]).inc();
        }
    }

    pub fn update_effective_timeout(&self, job_type: &str, timeout_ms: u64) {
        if let Some(gauge) = EFFECTIVE_TIMEOUT.get() {
            gauge
                .with_label_values(&[job_type])
                .set(timeout_ms as f64 / 1000.0);
        }
    }

    pub fn update_memory_used(&self, used_mb: f64) {
        if let Some(gauge) = MEMORY_USED_MB.get() {
            gauge.set(used_mb);
        }
    }

    pub fn record_backpressure(&self, label: &str) {
        if let Some(rejections) = BACKPRESSURE_REJECTIONS.get() {
            rejections.with_label_values(&[label]).inc();
        }
    }

    pub fn record_recycle_signal(&self, reason: &str) {
        if let Some(signals) = RECYCLE_SIGNALS.get() {
            signals.with_label_values(&[reason]).inc();
        }
    }

    /// Update depth and latency gauges for a queue.
    pub fn update_queue(&self, queue_name: &str, depth: u64, latency_ms: u64) {
        if let Some(queue_depth) = QUEUE_DEPTH.get() {
            queue_depth
                .with_label_values(&[queue_name])
                .set(depth as f64);
        }

        if let Some(queue_latency) = QUEUE_LATENCY.get() {
            queue_latency
                .with_label_values(&[queue_name])
                .set(latency_ms as f64 / 1000.0);
        }

        tracing::trace!(
            queue_name = queue_name,
            depth = depth,
            latency_ms = latency_ms,
            "Updated queue metrics"
        );
    }

    /// Record a scaling decision and its target worker count.
    pub fn record_scaling_decision(&self, queue_name: &str, action: &str, target_workers: u32) {
        if let Some(decisions) = SCALING_DECISIONS_TOTAL.get() {
            decisions.with_label_values(&[queue_name, action]).inc();
        }

        if let Some(target) = TARGET_WORKERS.get() {
            target
                .with_label_values(&[queue_name])
                .set(target_workers as f64);
        }
    }

    pub fn record_alert(&self, alert_type: &str, severity: &str) {
        if let Some(alerts) = ALERTS_RAISED_TOTAL.get() {
            alerts.with_label_values(&[alert_type, severity]).inc();
        }
    }

    pub fn update_active_alerts(&self, count: usize) {
        if let Some(active) = ACTIVE_ALERTS.get() {
            active.set(count as f64);
        }
    }
}
