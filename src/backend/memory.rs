//! In-process queue backend.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;

use super::{QueueBackend, QueueStats};
use crate::error::MonitoringFault;

#[derive(Debug, Default)]
struct State {
    stats: HashMap<String, QueueStats>,
    delayed: HashMap<String, Vec<(String, u64)>>,
    pending_failures: HashMap<String, u32>,
    fetches: u64,
}

/// Backend whose statistics are set by hand.
///
/// Fetching an unknown queue is a [`MonitoringFault`], as is any fetch
/// scheduled to fail with [`fail_next`](Self::fail_next).
#[derive(Debug, Default)]
pub struct InMemoryQueueBackend {
    state: Mutex<State>,
}

impl InMemoryQueueBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Sets the statistics returned for `queue`.
    pub fn set_stats(&self, queue: impl Into<String>, stats: QueueStats) {
        self.lock().stats.insert(queue.into(), stats);
    }

    /// Makes the next `count` fetches of `queue` fail.
    pub fn fail_next(&self, queue: impl Into<String>, count: u32) {
        self.lock().pending_failures.insert(queue.into(), count);
    }

    /// Jobs handed back through `requeue_with_delay`, in call order.
    pub fn delayed_jobs(&self, queue: &str) -> Vec<(String, u64)> {
        self.lock().delayed.get(queue).cloned().unwrap_or_default()
    }

    /// Number of snapshot fetches served or failed so far.
    pub fn fetch_count(&self) -> u64 {
        self.lock().fetches
    }
}

#[async_trait]
impl QueueBackend for InMemoryQueueBackend {
    async fn get_queue_snapshot(&self, queue: &str) -> Result<QueueStats, MonitoringFault> {
        let mut state = self.lock();
        state.fetches += 1;

        if let Some(remaining) = state.pending_failures.get_mut(queue) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(MonitoringFault::new(queue, "injected backend failure"));
            }
        }

        state
            .stats
            .get(queue)
            .copied()
            .ok_or_else(|| MonitoringFault::new(queue, "queue not found"))
    }

    async fn requeue_with_delay(
        &self,
        queue: &str,
        job_id: &str,
        delay_ms: u64,
    ) -> Result<(), MonitoringFault> {
        self.lock()
            .delayed
            .entry(queue.to_string())
            .or_default()
            .push((job_id.to_string(), delay_ms));
        Ok(())
    }
}
