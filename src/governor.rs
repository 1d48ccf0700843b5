//! The assembled governor and its background loops.

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::error::{MonitorError, TaskError};
use crate::memory::MemoryMonitor;
use crate::monitor::QueueMonitor;
use crate::rate_limit::RateLimiter;
use crate::scaling::ScalingManager;
use crate::task::MonitorHandle;
use crate::timeout::TimeoutHandler;

/// All five components wired to one queue backend.
///
/// The queue monitor owns the shared handles; the accessors here return the
/// same instances it uses.
pub struct Governor {
    monitor: Arc<QueueMonitor>,
    poll_interval: Duration,
    sample_interval: Duration,
}

impl Governor {
    pub fn new(monitor: Arc<QueueMonitor>, poll_interval: Duration, sample_interval: Duration) -> Self {
        Self {
            monitor,
            poll_interval,
            sample_interval,
        }
    }

    pub fn monitor(&self) -> &Arc<QueueMonitor> {
        &self.monitor
    }

    pub fn rate_limiter(&self) -> &Arc<RateLimiter> {
        self.monitor.rate_limiter()
    }

    pub fn timeouts(&self) -> &Arc<TimeoutHandler> {
        self.monitor.timeouts()
    }

    pub fn memory(&self) -> &Arc<MemoryMonitor> {
        self.monitor.memory()
    }

    pub fn scaling(&self) -> &Arc<ScalingManager> {
        self.monitor.scaling()
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    pub fn sample_interval(&self) -> Duration {
        self.sample_interval
    }

    /// Starts the memory sampler and the queue monitoring loop.
    ///
    /// # Errors
    ///
    /// Returns `MonitorError::AlreadyRunning` if the monitoring loop is
    /// already running. The sampler is not left behind in that case.
    pub async fn start(&self) -> Result<GovernorHandle, MonitorError> {
        let sampler = self.memory().start(self.sample_interval);
        let monitor = match self.monitor.start_monitoring(self.poll_interval) {
            Ok(handle) => handle,
            Err(e) => {
                // The monitor error is the one worth reporting.
                let _ = sampler.shutdown(Duration::from_secs(1)).await;
                return Err(e);
            }
        };

        info!(
            queues = self.monitor.queue_names().len(),
            poll_interval_ms = self.poll_interval.as_millis() as u64,
            sample_interval_ms = self.sample_interval.as_millis() as u64,
            "Governor started"
        );

        Ok(GovernorHandle { sampler, monitor })
    }
}

/// Running background loops of a [`Governor`].
pub struct GovernorHandle {
    sampler: MonitorHandle,
    monitor: MonitorHandle,
}

impl GovernorHandle {
    /// Stops the monitoring loop, then the sampler, each within `timeout`.
    ///
    /// # Errors
    ///
    /// Returns the first task error; both loops are asked to stop regardless.
    pub async fn shutdown(self, timeout: Duration) -> Result<(), TaskError> {
        let monitor = self.monitor.shutdown(timeout).await;
        let sampler = self.sampler.shutdown(timeout).await;
        info!("Governor stopped");
        monitor.and(sampler)
    }
}
