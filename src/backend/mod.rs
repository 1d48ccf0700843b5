//! Queue backend seam.
//!
//! The governor never owns the queue. It reads per-queue statistics from a
//! [`QueueBackend`] and asks it to take rate-limited jobs back with a delay.
//!
//! - **RedisQueueBackend**: reads list-based Redis queues
//! - **InMemoryQueueBackend**: scripted backend for tests and local runs

pub mod memory;
pub mod redis_queue;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::MonitoringFault;

pub use self::memory::InMemoryQueueBackend;
pub use self::redis_queue::RedisQueueBackend;

/// Point-in-time statistics reported by the queue backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct QueueStats {
    /// Jobs waiting to be picked up.
    pub depth: u64,
    /// Age of the oldest waiting job in milliseconds.
    pub latency_ms: u64,
    /// Failed / (completed + failed), between 0.0 and 1.0.
    pub error_rate: f64,
    /// Recent throughput.
    pub jobs_per_minute: f64,
}

impl QueueStats {
    pub fn new(depth: u64, latency_ms: u64) -> Self {
        Self {
            depth,
            latency_ms,
            ..Default::default()
        }
    }

    pub fn with_error_rate(mut self, error_rate: f64) -> Self {
        self.error_rate = error_rate;
        self
    }

    pub fn with_jobs_per_minute(mut self, jobs_per_minute: f64) -> Self {
        self.jobs_per_minute = jobs_per_minute;
        self
    }
}

/// Source of queue statistics and sink for delayed requeues.
///
/// Implementations must not block the runtime: all I/O goes through `.await`.
#[async_trait]
pub trait QueueBackend: Send + Sync {
    /// Fetches the current statistics for `queue`.
    async fn get_queue_snapshot(&self, queue: &str) -> Result<QueueStats, MonitoringFault>;

    /// Makes `job_id` available again on `queue` after `delay_ms`.
    async fn requeue_with_delay(
        &self,
        queue: &str,
        job_id: &str,
        delay_ms: u64,
    ) -> Result<(), MonitoringFault>;
}
