//! Job timeouts.
//!
//! - **TimeoutHandler**: runs jobs under soft/hard timeouts and records
//!   their outcome
//! - **ExecutionHistory**: bounded per-job-type latency history
//! - **TimeoutConfig**: fixed or adaptive timeout per job type
//!
//! Adaptive job types retune their hard timeout to `p95 * 1.5`, clamped to
//! the configured floor and ceiling, every ten completions.

pub mod config;
pub mod handler;
pub mod history;

pub use config::{TimeoutConfig, TimeoutOptions};
pub use handler::{JobContext, SoftTimeoutEvent, TimeoutHandler, TimeoutSettings, WrappedJob};
pub use history::{percentile, ExecutionOutcome, ExecutionRecord, ExecutionStats};
