//! Queue health monitoring and alerting.
//!
//! - **QueueMonitor**: polling loop tying the backend, scaling and alerts
//!   together
//! - **AlertBook**: edge-triggered, deduplicated alert state
//! - **HealthThresholds**: warning and critical bands per queue

pub mod alerts;
pub mod health;
pub mod queue_monitor;
pub mod report;

pub use alerts::{Alert, AlertBook, AlertSeverity, AlertTransition, AlertType};
pub use health::{classify, HealthStatus, HealthThresholds, QueueHealthSnapshot};
pub use queue_monitor::{MonitorSettings, PollSummary, QueueMonitor};
pub use report::{DashboardSummary, HealthReport, JobTypeHealth, WorkerHealth};
