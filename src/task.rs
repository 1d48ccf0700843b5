//! Periodic background tasks with graceful shutdown.

use std::future::Future;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use crate::error::TaskError;

/// Handle to a running background loop.
///
/// Dropping the handle without calling [`shutdown`](Self::shutdown) also
/// stops the loop at its next tick, since the shutdown channel closes.
pub struct MonitorHandle {
    task: &'static str,
    shutdown_tx: broadcast::Sender<()>,
    handle: JoinHandle<()>,
}

impl MonitorHandle {
    /// Spawns `tick` every `interval` until shutdown.
    ///
    /// The first tick runs immediately. A tick that overruns the interval
    /// delays the next one instead of bursting.
    pub fn spawn<F, Fut>(task: &'static str, interval: Duration, mut tick: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (shutdown_tx, mut shutdown_rx) = broadcast::channel(1);

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(task, interval_ms = interval.as_millis() as u64, "Background task started");

            loop {
                tokio::select! {
                    biased;
                    _ = shutdown_rx.recv() => {
                        // Ok, Closed and Lagged all mean stop.
                        debug!(task, "Background task received shutdown signal");
                        break;
                    }
                    _ = ticker.tick() => tick().await,
                }
            }

            info!(task, "Background task stopped");
        });

        Self {
            task,
            shutdown_tx,
            handle,
        }
    }

    pub fn task(&self) -> &'static str {
        self.task
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Signals the loop to stop and waits for the current tick to finish.
    ///
    /// # Errors
    ///
    /// - `TaskError::ShutdownTimeout` if the loop did not stop within `timeout`
    /// - `TaskError::Panicked` if the loop panicked
    pub async fn shutdown(self, timeout: Duration) -> Result<(), TaskError> {
        let task = self.task;
        // The loop may already have stopped.
        let _ = self.shutdown_tx.send(());

        match tokio::time::timeout(timeout, self.handle).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(TaskError::Panicked {
                task,
                message: e.to_string(),
            }),
            Err(_) => Err(TaskError::ShutdownTimeout { task, timeout }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_ticks_until_shutdown() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ticks);

        let handle = MonitorHandle::spawn("ticker", Duration::from_millis(100), move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        tokio::time::sleep(Duration::from_millis(350)).await;
        handle.shutdown(Duration::from_secs(1)).await.unwrap();

        // Ticks at 0, 100, 200 and 300ms.
        assert_eq!(ticks.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_times_out_on_stuck_tick() {
        let handle = MonitorHandle::spawn("stuck", Duration::from_millis(10), || async {
            tokio::time::sleep(Duration::from_secs(3_600)).await;
        });
        tokio::time::sleep(Duration::from_millis(1)).await;

        let err = handle.shutdown(Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, TaskError::ShutdownTimeout { task: "stuck", .. }));
    }
}
