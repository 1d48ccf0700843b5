//! Metrics module for Prometheus-based monitoring.
//!
//! Covers rate limit decisions, job executions and timeouts, memory pressure,
//! queue depth/latency, scaling decisions and alerts.
//!
//! # Example
//!
//! ```ignore
//! use queue_governor::metrics::{init_metrics, export_metrics, MetricsCollector};
//!
//! init_metrics().expect("Failed to initialize metrics");
//!
//! let collector = MetricsCollector::new();
//! collector.record_execution("email", "success", 0.42);
//!
//! let metrics_text = export_metrics();
//! ```

pub mod collectors;
pub mod prometheus;

pub use collectors::MetricsCollector;
pub use prometheus::{export_metrics, init_metrics};
