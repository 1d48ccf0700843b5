//! queue-governor: scaling and resource control for background job queues.
//!
//! The governor sits beside a job queue and its workers. It never runs jobs
//! itself; it tells callers whether and how they may run them:
//!
//! - [`rate_limit`]: per-key admission against named outbound limits
//! - [`timeout`]: soft and hard timeouts with adaptive per-job-type tuning
//! - [`memory`]: backpressure and worker recycle signals
//! - [`scaling`]: worker count decisions from queue depth and latency
//! - [`monitor`]: the polling loop, health classification and alerts
//!
//! [`config::GovernorConfig`] assembles all of them into a [`Governor`].

pub mod backend;
pub mod cli;
pub mod clock;
pub mod config;
pub mod error;
pub mod governor;
pub mod memory;
pub mod metrics;
pub mod monitor;
pub mod observer;
pub mod rate_limit;
pub mod scaling;
pub mod task;
pub mod timeout;

pub use config::GovernorConfig;
pub use error::{
    BackpressureError, ConfigError, JobError, MonitorError, MonitoringFault, RateLimitError,
    RateLimitExceeded, ScalingError, TaskError,
};
pub use governor::{Governor, GovernorHandle};
