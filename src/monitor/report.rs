//! Read-only views for dashboards and status endpoints.

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::health::{HealthStatus, QueueHealthSnapshot};
use crate::memory::{MemoryLimitStatus, RecycleReason, WorkerMemoryStat};
use crate::rate_limit::RuleStats;
use crate::timeout::ExecutionStats;

/// Totals across all monitored queues.
///
/// Status counts and averages cover queues with at least one successful
/// poll; `total_queues` counts every registered queue.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DashboardSummary {
    pub total_queues: usize,
    pub healthy: usize,
    pub warning: usize,
    pub critical: usize,
    pub active_alerts: usize,
    pub total_depth: u64,
    pub avg_jobs_per_minute: f64,
    pub avg_error_rate: f64,
    pub timestamp: DateTime<Utc>,
}

impl DashboardSummary {
    pub(crate) fn from_snapshots(
        total_queues: usize,
        snapshots: &[QueueHealthSnapshot],
        active_alerts: usize,
        timestamp: DateTime<Utc>,
    ) -> Self {
        let count_status =
            |status: HealthStatus| snapshots.iter().filter(|s| s.status == status).count();
        let polled = snapshots.len().max(1) as f64;

        Self {
            total_queues,
            healthy: count_status(HealthStatus::Healthy),
            warning: count_status(HealthStatus::Warning),
            critical: count_status(HealthStatus::Critical),
            active_alerts,
            total_depth: snapshots.iter().map(|s| s.depth).sum(),
            avg_jobs_per_minute: snapshots.iter().map(|s| s.jobs_per_minute).sum::<f64>() / polled,
            avg_error_rate: snapshots.iter().map(|s| s.error_rate).sum::<f64>() / polled,
            timestamp,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkerHealth {
    pub worker_id: String,
    pub job_type: String,
    pub jobs_processed: u64,
    pub latest_memory_mb: Option<f64>,
    pub recycle_reason: Option<RecycleReason>,
}

impl From<WorkerMemoryStat> for WorkerHealth {
    fn from(stat: WorkerMemoryStat) -> Self {
        Self {
            latest_memory_mb: stat.latest().map(|s| s.heap_used_mb),
            worker_id: stat.worker_id,
            job_type: stat.job_type,
            jobs_processed: stat.jobs_processed,
            recycle_reason: stat.recycle_reason,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobTypeHealth {
    pub job_type: String,
    pub effective_timeout_ms: u64,
    pub stats: Option<ExecutionStats>,
}

/// Snapshot served by an external status endpoint.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthReport {
    /// False if any queue is critical, memory is above its critical
    /// threshold or a worker awaits recycling.
    pub healthy: bool,
    pub timestamp: DateTime<Utc>,
    pub queues: Vec<QueueHealthSnapshot>,
    pub workers: Vec<WorkerHealth>,
    pub memory: Option<MemoryLimitStatus>,
    pub job_types: Vec<JobTypeHealth>,
    pub rate_limits: Vec<RuleStats>,
}
