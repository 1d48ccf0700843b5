//! Prometheus metrics registration and export.
//!
//! This module defines all Prometheus metrics used by queue-governor and
//! provides functions for initializing, registering, and exporting metrics.

use prometheus::{
    CounterVec, Encoder, Gauge, GaugeVec, HistogramVec, Opts, Registry, TextEncoder,
};
use std::sync::OnceLock;

/// Global Prometheus registry for all queue-governor metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Rate limit checks, labeled by rule and result (allowed/denied).
pub static RATE_LIMIT_DECISIONS: OnceLock<CounterVec> = OnceLock::new();

/// Job executions, labeled by job type and outcome (success/timeout/error).
pub static JOB_EXECUTIONS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Job execution duration in seconds, labeled by job type.
pub static JOB_DURATION: OnceLock<HistogramVec> = OnceLock::new();

/// Soft timeout warnings, labeled by job type.
pub static SOFT_TIMEOUTS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Current effective timeout in seconds, labeled by job type.
pub static EFFECTIVE_TIMEOUT: OnceLock<GaugeVec> = OnceLock::new();

/// Most recent sampled memory usage in megabytes.
pub static MEMORY_USED_MB: OnceLock<Gauge> = OnceLock::new();

/// Work rejected by memory backpressure, labeled by worker label.
pub static BACKPRESSURE_REJECTIONS: OnceLock<CounterVec> = OnceLock::new();

/// Worker recycle signals, labeled by reason.
pub static RECYCLE_SIGNALS: OnceLock<CounterVec> = OnceLock::new();

/// Number of jobs waiting, labeled by queue name.
pub static QUEUE_DEPTH: OnceLock<GaugeVec> = OnceLock::new();

/// Age of the oldest waiting job in seconds, labeled by queue name.
pub static QUEUE_LATENCY: OnceLock<GaugeVec> = OnceLock::new();

/// Scaling decisions, labeled by queue name and action.
pub static SCALING_DECISIONS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Target worker count from the latest decision, labeled by queue name.
pub static TARGET_WORKERS: OnceLock<GaugeVec> = OnceLock::new();

/// Alerts raised, labeled by alert type and severity.
pub static ALERTS_RAISED_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Number of unacknowledged alerts.
pub static ACTIVE_ALERTS: OnceLock<Gauge> = OnceLock::new();

/// Initialize all metrics and register them with the registry.
///
/// Call once at startup. Subsequent calls are harmless: the first set of
/// metrics stays in place.
///
/// # Errors
///
/// Returns a `prometheus::Error` if metric registration fails, typically due to
/// duplicate metric names or invalid metric configurations.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    let registry = Registry::new();

    // Rate limiting
    let rate_limit_decisions = CounterVec::new(
        Opts::new(
            "queue_governor_rate_limit_decisions_total",
            "Rate limit checks by result",
        ),
        &["rule", "result"],
    )?;

    // Job execution
    let job_executions_total = CounterVec::new(
        Opts::new(
            "queue_governor_job_executions_total",
            "Job executions by outcome",
        ),
        &["job_type", "outcome"],
    )?;

    let job_duration = HistogramVec::new(
        prometheus::HistogramOpts::new(
            "queue_governor_job_duration_seconds",
            "Job execution duration in seconds",
        )
        .buckets(vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 300.0]),
        &["job_type"],
    )?;

    let soft_timeouts_total = CounterVec::new(
        Opts::new(
            "queue_governor_soft_timeouts_total",
            "Jobs that crossed their soft timeout",
        ),
        &["job_type"],
    )?;

    let effective_timeout = GaugeVec::new(
        Opts::new(
            "queue_governor_effective_timeout_seconds",
            "Current effective hard timeout per job type",
        ),
        &["job_type"],
    )?;

    // Memory
    let memory_used_mb = Gauge::new(
        "queue_governor_memory_used_mb",
        "Most recent sampled memory usage in MB",
    )?;

    let backpressure_rejections = CounterVec::new(
        Opts::new(
            "queue_governor_backpressure_rejections_total",
            "Work rejected by memory backpressure",
        ),
        &["label"],
    )?;

    let recycle_signals = CounterVec::new(
        Opts::new(
            "queue_governor_recycle_signals_total",
            "Worker recycle signals by reason",
        ),
        &["reason"],
    )?;

    // Queues and scaling
    let queue_depth = GaugeVec::new(
        Opts::new("queue_governor_queue_depth", "Number of jobs waiting"),
        &["queue_name"],
    )?;

    let queue_latency = GaugeVec::new(
        Opts::new(
            "queue_governor_queue_latency_seconds",
            "Age of the oldest waiting job",
        ),
        &["queue_name"],
    )?;

    let scaling_decisions_total = CounterVec::new(
        Opts::new(
            "queue_governor_scaling_decisions_total",
            "Scaling decisions by action",
        ),
        &["queue_name", "action"],
    )?;

    let target_workers = GaugeVec::new(
        Opts::new(
            "queue_governor_target_workers",
            "Target worker count from the latest decision",
        ),
        &["queue_name"],
    )?;

    // Alerts
    let alerts_raised_total = CounterVec::new(
        Opts::new("queue_governor_alerts_raised_total", "Alerts raised"),
        &["alert_type", "severity"],
    )?;

    let active_alerts = Gauge::new(
        "queue_governor_active_alerts",
        "Number of unacknowledged alerts",
    )?;

    registry.register(Box::new(rate_limit_decisions.clone()))?;
    registry.register(Box::new(job_executions_total.clone()))?;
    registry.register(Box::new(job_duration.clone()))?;
    registry.register(Box::new(soft_timeouts_total.clone()))?;
    registry.register(Box::new(effective_timeout.clone()))?;
    registry.register(Box::new(memory_used_mb.clone()))?;
    registry.register(Box::new(backpressure_rejections.clone()))?;
    registry.register(Box::new(recycle_signals.clone()))?;
    registry.register(Box::new(queue_depth.clone()))?;
    registry.register(Box::new(queue_latency.clone()))?;
    registry.register(Box::new(scaling_decisions_total.clone()))?;
    registry.register(Box::new(target_workers.clone()))?;
    registry.register(Box::new(alerts_raised_total.clone()))?;
    registry.register(Box::new(active_alerts.clone()))?;

    // If any of these fail, metrics were already initialized (idempotent)
    let _ = REGISTRY.set(registry);
    let _ = RATE_LIMIT_DECISIONS.set(rate_limit_decisions);
    let _ = JOB_EXECUTIONS_TOTAL.set(job_executions_total);
    let _ = JOB_DURATION.set(job_duration);
    let _ = SOFT_TIMEOUTS_TOTAL.set(soft_timeouts_total);
    let _ = EFFECTIVE_TIMEOUT.set(effective_timeout);
    let _ = MEMORY_USED_MB.set(memory_used_mb);
    let _ = BACKPRESSURE_REJECTIONS.set(backpressure_rejections);
    let _ = RECYCLE_SIGNALS.set(recycle_signals);
    let _ = QUEUE_DEPTH.set(queue_depth);
    let _ = QUEUE_LATENCY.set(queue_latency);
    let _ = SCALING_DECISIONS_TOTAL.set(scaling_decisions_total);
    let _ = TARGET_WORKERS.set(target_workers);
    let _ = ALERTS_RAISED_TOTAL.set(alerts_raised_total);
    let _ = ACTIVE_ALERTS.set(active_alerts);

    tracing::info!("Prometheus metrics initialized successfully");

    Ok(())
}

/// Export all registered metrics in Prometheus text format.
///
/// If the registry has not been initialized or encoding fails, the returned
/// string is a Prometheus comment describing the problem.
pub fn export_metrics() -> String {
    let Some(registry) = REGISTRY.get() else {
        return "# Metrics not initialized. Call init_metrics() first.\n".to_string();
    };

    let encoder = TextEncoder::new();
    let metric_families = registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return format!("# Error encoding metrics: {}\n", e);
    }

    String::from_utf8(buffer)
        .unwrap_or_else(|e| format!("# Error converting metrics to UTF-8: {}\n", e))
}
