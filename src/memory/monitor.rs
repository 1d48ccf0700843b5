//! Process memory monitoring, backpressure and recycle signals.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::clock::{system_clock, Clock};
use crate::error::{BackpressureError, ConfigError};
use crate::metrics::MetricsCollector;
use crate::task::MonitorHandle;

use super::probe::{MemoryProbe, MemoryReading, MemorySample};
use super::worker::{RecycleReason, WorkerMemoryStat};

/// Memory limits and detection tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Memory budget of the process.
    pub max_heap_mb: f64,
    /// Warning threshold as a percentage of `max_heap_mb`.
    pub warning_percent: f64,
    /// Critical threshold as a percentage of `max_heap_mb`.
    pub critical_percent: f64,
    /// Samples used for leak slope estimation.
    pub leak_window: usize,
    /// Growth per sample above which a worker is suspected of leaking.
    pub leak_slope_threshold_mb: f64,
    /// Jobs after which a worker is recycled regardless of memory.
    pub max_jobs_per_worker: Option<u64>,
    pub sample_interval_ms: u64,
    /// Process samples kept in memory.
    pub history_capacity: usize,
    /// Samples kept per worker.
    pub worker_sample_capacity: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            max_heap_mb: 1024.0,
            warning_percent: 80.0,
            critical_percent: 95.0,
            leak_window: 10,
            leak_slope_threshold_mb: 5.0,
            max_jobs_per_worker: None,
            sample_interval_ms: 5_000,
            history_capacity: 120,
            worker_sample_capacity: 50,
        }
    }
}

impl MemoryConfig {
    pub fn warning_mb(&self) -> f64 {
        self.max_heap_mb * self.warning_percent / 100.0
    }

    pub fn critical_mb(&self) -> f64 {
        self.max_heap_mb * self.critical_percent / 100.0
    }

    /// # Errors
    ///
    /// Returns `ConfigError::InvalidMemoryConfig` for a non-positive budget,
    /// thresholds outside `0 < warning <= critical <= 100`, or a leak window
    /// shorter than two samples.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.max_heap_mb > 0.0) {
            return Err(ConfigError::InvalidMemoryConfig(
                "max_heap_mb must be greater than 0".to_string(),
            ));
        }
        if !(self.warning_percent > 0.0
            && self.warning_percent <= self.critical_percent
            && self.critical_percent <= 100.0)
        {
            return Err(ConfigError::InvalidMemoryConfig(format!(
                "thresholds must satisfy 0 < warning ({}) <= critical ({}) <= 100",
                self.warning_percent, self.critical_percent
            )));
        }
        if self.leak_window < 2 {
            return Err(ConfigError::InvalidMemoryConfig(
                "leak_window must be at least 2".to_string(),
            ));
        }
        if self.sample_interval_ms == 0 {
            return Err(ConfigError::InvalidMemoryConfig(
                "sample_interval_ms must be greater than 0".to_string(),
            ));
        }
        if self.max_jobs_per_worker == Some(0) {
            return Err(ConfigError::InvalidMemoryConfig(
                "max_jobs_per_worker must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Current usage against the configured thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MemoryLimitStatus {
    pub used_mb: f64,
    pub max_heap_mb: f64,
    pub usage_percent: f64,
    pub exceeds_warning: bool,
    pub exceeds_critical: bool,
}

/// Samples process memory, rejects work that would exceed the critical
/// threshold and flags workers that should be restarted.
///
/// Detection only: the monitor never restarts anything itself. Callers poll
/// [`workers_needing_recycle`](Self::workers_needing_recycle), restart the
/// worker and call [`clear_recycle`](Self::clear_recycle).
pub struct MemoryMonitor {
    config: MemoryConfig,
    probe: Arc<dyn MemoryProbe>,
    clock: Arc<dyn Clock>,
    history: Mutex<VecDeque<MemorySample>>,
    workers: RwLock<HashMap<String, Arc<Mutex<WorkerMemoryStat>>>>,
    metrics: MetricsCollector,
}

impl MemoryMonitor {
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidMemoryConfig` if the config fails validation.
    pub fn new(config: MemoryConfig, probe: Arc<dyn MemoryProbe>) -> Result<Self, ConfigError> {
        Self::with_clock(config, probe, system_clock())
    }

    /// # Errors
    ///
    /// Returns `ConfigError::InvalidMemoryConfig` if the config fails validation.
    pub fn with_clock(
        config: MemoryConfig,
        probe: Arc<dyn MemoryProbe>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            history: Mutex::new(VecDeque::with_capacity(config.history_capacity)),
            config,
            probe,
            clock,
            workers: RwLock::new(HashMap::new()),
            metrics: MetricsCollector::new(),
        })
    }

    pub fn config(&self) -> &MemoryConfig {
        &self.config
    }

    /// Takes a sample and appends it to the history.
    ///
    /// A failed probe read repeats the previous sample with a fresh
    /// timestamp, or reads zero if there is none.
    pub fn sample(&self) -> MemorySample {
        // Reading memory may hit the filesystem; do it before taking the lock.
        let probed = self.probe.read();

        let mut history = self.history.lock().unwrap_or_else(PoisonError::into_inner);
        let reading = probed.unwrap_or_else(|| {
            warn!("Memory probe returned no reading");
            history
                .back()
                .map(|last| MemoryReading {
                    heap_used_mb: last.heap_used_mb,
                    heap_total_mb: last.heap_total_mb,
                    rss_mb: last.rss_mb,
                })
                .unwrap_or_default()
        });
        let sample = MemorySample::new(self.clock.now(), reading);

        if history.len() >= self.config.history_capacity.max(1) {
            history.pop_front();
        }
        history.push_back(sample);
        drop(history);

        self.metrics.update_memory_used(sample.heap_used_mb);
        sample
    }

    /// Retained samples, oldest first.
    pub fn history(&self) -> Vec<MemorySample> {
        self.history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .copied()
            .collect()
    }

    pub fn latest_sample(&self) -> Option<MemorySample> {
        self.history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .back()
            .copied()
    }

    fn status_of(&self, used_mb: f64) -> MemoryLimitStatus {
        MemoryLimitStatus {
            used_mb,
            max_heap_mb: self.config.max_heap_mb,
            usage_percent: used_mb / self.config.max_heap_mb * 100.0,
            exceeds_warning: used_mb >= self.config.warning_mb(),
            exceeds_critical: used_mb >= self.config.critical_mb(),
        }
    }

    /// Samples now and compares usage with the thresholds.
    pub fn check_memory_limits(&self) -> MemoryLimitStatus {
        let sample = self.sample();
        let status = self.status_of(sample.heap_used_mb);

        if status.exceeds_critical {
            warn!(
                used_mb = status.used_mb,
                usage_percent = status.usage_percent,
                "Memory above critical threshold"
            );
        } else if status.exceeds_warning {
            warn!(
                used_mb = status.used_mb,
                usage_percent = status.usage_percent,
                "Memory above warning threshold"
            );
        }
        status
    }

    /// Runs `work` unless it would push memory past the critical threshold.
    ///
    /// On rejection `work` is dropped without being polled. Otherwise the
    /// worker registered as `label` (created on first use) gets a
    /// post-execution sample and one more processed job, and its recycle
    /// state is re-evaluated.
    ///
    /// # Errors
    ///
    /// Returns `BackpressureError` when current usage plus `expected_mb`
    /// exceeds the critical threshold.
    pub async fn execute_with_memory_check<T, Fut>(
        &self,
        label: &str,
        expected_mb: f64,
        work: Fut,
    ) -> Result<T, BackpressureError>
    where
        Fut: Future<Output = T>,
    {
        let before = self.sample();
        let threshold_mb = self.config.critical_mb();

        if before.heap_used_mb + expected_mb > threshold_mb {
            warn!(
                label,
                current_mb = before.heap_used_mb,
                expected_mb,
                threshold_mb,
                "Rejecting work under memory pressure"
            );
            self.metrics.record_backpressure(label);
            return Err(BackpressureError {
                label: label.to_string(),
                current_mb: before.heap_used_mb,
                expected_mb,
                threshold_mb,
            });
        }

        let output = work.await;

        let after = self.sample();
        let worker = self.worker_entry(label, label, expected_mb);
        {
            let mut stat = worker.lock().unwrap_or_else(PoisonError::into_inner);
            stat.push_sample(after, self.config.worker_sample_capacity);
            stat.jobs_processed += 1;
        }
        self.evaluate_recycle(label);

        Ok(output)
    }

    fn worker_entry(&self, worker_id: &str, job_type: &str, expected_mb: f64) -> Arc<Mutex<WorkerMemoryStat>> {
        {
            let workers = self.workers.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(stat) = workers.get(worker_id) {
                return Arc::clone(stat);
            }
        }

        let mut workers = self.workers.write().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(workers.entry(worker_id.to_string()).or_insert_with(|| {
            Arc::new(Mutex::new(WorkerMemoryStat::new(worker_id, job_type, expected_mb)))
        }))
    }

    fn worker(&self, worker_id: &str) -> Option<Arc<Mutex<WorkerMemoryStat>>> {
        self.workers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(worker_id)
            .cloned()
    }

    /// Starts tracking a worker, replacing any previous stats for it.
    pub fn register_worker(&self, worker_id: &str, job_type: &str, expected_memory_mb: f64) {
        debug!(worker_id, job_type, expected_memory_mb, "Registered worker");
        let stat = WorkerMemoryStat::new(worker_id, job_type, expected_memory_mb);
        self.workers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(worker_id.to_string(), Arc::new(Mutex::new(stat)));
    }

    /// Adds a sample to a worker's history. Returns false for unknown workers.
    pub fn record_worker_sample(&self, worker_id: &str, sample: MemorySample) -> bool {
        let Some(worker) = self.worker(worker_id) else {
            debug!(worker_id, "Ignoring sample for unknown worker");
            return false;
        };
        worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_sample(sample, self.config.worker_sample_capacity);
        true
    }

    /// Counts one finished job for a worker. Returns false for unknown workers.
    pub fn record_job_completed(&self, worker_id: &str) -> bool {
        let Some(worker) = self.worker(worker_id) else {
            return false;
        };
        worker.lock().unwrap_or_else(PoisonError::into_inner).jobs_processed += 1;
        true
    }

    /// Decides whether a worker should be recycled.
    ///
    /// Checked in order: latest sample at or above the critical threshold,
    /// leak slope above the configured limit, job cap reached. A flagged
    /// worker stays flagged until [`clear_recycle`](Self::clear_recycle).
    pub fn evaluate_recycle(&self, worker_id: &str) -> Option<RecycleReason> {
        let worker = self.worker(worker_id)?;
        let mut stat = worker.lock().unwrap_or_else(PoisonError::into_inner);

        if stat.recycle_reason.is_some() {
            return stat.recycle_reason;
        }

        let threshold_mb = self.config.critical_mb();
        let reason = if let Some(used_mb) = stat
            .latest()
            .map(|s| s.heap_used_mb)
            .filter(|used| *used >= threshold_mb)
        {
            Some(RecycleReason::CriticalMemory {
                used_mb,
                threshold_mb,
            })
        } else if let Some(slope) = stat
            .leak_slope(self.config.leak_window)
            .filter(|slope| *slope > self.config.leak_slope_threshold_mb)
        {
            Some(RecycleReason::SuspectedLeak {
                slope_mb_per_sample: slope,
            })
        } else {
            self.config
                .max_jobs_per_worker
                .filter(|cap| stat.jobs_processed >= *cap)
                .map(|cap| RecycleReason::JobCapReached {
                    jobs_processed: stat.jobs_processed,
                    cap,
                })
        };

        if let Some(reason) = reason {
            stat.recycle_reason = Some(reason);
            warn!(
                worker_id,
                job_type = %stat.job_type,
                reason = reason.as_str(),
                "Worker flagged for recycle"
            );
            self.metrics.record_recycle_signal(reason.as_str());
        }
        reason
    }

    /// Flagged workers and their reasons, sorted by worker id.
    pub fn workers_needing_recycle(&self) -> Vec<(String, RecycleReason)> {
        let workers = self.workers.read().unwrap_or_else(PoisonError::into_inner);
        let mut flagged: Vec<(String, RecycleReason)> = workers
            .iter()
            .filter_map(|(id, stat)| {
                stat.lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .recycle_reason
                    .map(|reason| (id.clone(), reason))
            })
            .collect();
        flagged.sort_by(|a, b| a.0.cmp(&b.0));
        flagged
    }

    /// Resets a worker after it was restarted. Returns false for unknown workers.
    pub fn clear_recycle(&self, worker_id: &str) -> bool {
        let Some(worker) = self.worker(worker_id) else {
            return false;
        };
        worker.lock().unwrap_or_else(PoisonError::into_inner).reset();
        info!(worker_id, "Cleared worker recycle state");
        true
    }

    pub fn worker_stats(&self, worker_id: &str) -> Option<WorkerMemoryStat> {
        self.worker(worker_id)
            .map(|w| w.lock().unwrap_or_else(PoisonError::into_inner).clone())
    }

    /// All tracked workers, sorted by worker id.
    pub fn worker_snapshots(&self) -> Vec<WorkerMemoryStat> {
        let workers = self.workers.read().unwrap_or_else(PoisonError::into_inner);
        let mut stats: Vec<WorkerMemoryStat> = workers
            .values()
            .map(|w| w.lock().unwrap_or_else(PoisonError::into_inner).clone())
            .collect();
        stats.sort_by(|a, b| a.worker_id.cmp(&b.worker_id));
        stats
    }

    /// Threshold status of the latest sample, without taking a new one.
    pub fn current_status(&self) -> Option<MemoryLimitStatus> {
        self.latest_sample()
            .map(|sample| self.status_of(sample.heap_used_mb))
    }

    pub fn worker_count(&self) -> usize {
        self.workers.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Samples every `interval` on a background task and logs threshold
    /// breaches.
    pub fn start(self: &Arc<Self>, interval: Duration) -> MonitorHandle {
        let monitor = Arc::clone(self);
        MonitorHandle::spawn("memory_sampler", interval, move || {
            let monitor = Arc::clone(&monitor);
            async move {
                monitor.check_memory_limits();
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::probe::ScriptedMemoryProbe;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn monitor_with(probe: Arc<ScriptedMemoryProbe>, config: MemoryConfig) -> MemoryMonitor {
        MemoryMonitor::new(config, probe).unwrap()
    }

    fn config() -> MemoryConfig {
        MemoryConfig {
            max_heap_mb: 1000.0,
            warning_percent: 80.0,
            critical_percent: 90.0,
            leak_window: 5,
            leak_slope_threshold_mb: 5.0,
            max_jobs_per_worker: Some(3),
            ..Default::default()
        }
    }

    #[test]
    fn test_config_validation() {
        assert!(MemoryConfig::default().validate().is_ok());

        let bad = MemoryConfig {
            warning_percent: 95.0,
            critical_percent: 90.0,
            ..Default::default()
        };
        assert!(bad.validate().is_err());

        let bad = MemoryConfig {
            max_heap_mb: 0.0,
            ..Default::default()
        };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_limits() {
        let probe = Arc::new(ScriptedMemoryProbe::script([500.0, 850.0, 950.0]));
        let monitor = monitor_with(probe, config());

        let status = monitor.check_memory_limits();
        assert!(!status.exceeds_warning);
        assert!((status.usage_percent - 50.0).abs() < 1e-9);

        let status = monitor.check_memory_limits();
        assert!(status.exceeds_warning && !status.exceeds_critical);

        let status = monitor.check_memory_limits();
        assert!(status.exceeds_critical);
        assert_eq!(monitor.history().len(), 3);
    }

    #[test]
    fn test_history_is_bounded() {
        let probe = Arc::new(ScriptedMemoryProbe::constant(100.0));
        let monitor = monitor_with(
            probe,
            MemoryConfig {
                history_capacity: 4,
                ..config()
            },
        );
        for _ in 0..10 {
            monitor.sample();
        }
        assert_eq!(monitor.history().len(), 4);
    }

    #[tokio::test]
    async fn test_backpressure_does_not_run_work() {
        let probe = Arc::new(ScriptedMemoryProbe::constant(850.0));
        let monitor = monitor_with(probe, config());
        let ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&ran);

        let result = monitor
            .execute_with_memory_check("pdf", 100.0, async move {
                flag.store(true, Ordering::SeqCst);
            })
            .await;

        let err = result.unwrap_err();
        assert_eq!(err.current_mb, 850.0);
        assert_eq!(err.expected_mb, 100.0);
        assert_eq!(err.threshold_mb, 900.0);
        assert!(!ran.load(Ordering::SeqCst));
        assert_eq!(monitor.worker_count(), 0);
    }

    #[tokio::test]
    async fn test_accepted_work_counts_jobs_and_hits_cap() {
        let probe = Arc::new(ScriptedMemoryProbe::constant(400.0));
        let monitor = monitor_with(probe, config());

        for i in 0..3 {
            let out = monitor
                .execute_with_memory_check("thumbnail", 50.0, async move { i * 2 })
                .await
                .unwrap();
            assert_eq!(out, i * 2);
        }

        let stats = monitor.worker_stats("thumbnail").unwrap();
        assert_eq!(stats.jobs_processed, 3);
        assert_eq!(
            stats.recycle_reason,
            Some(RecycleReason::JobCapReached {
                jobs_processed: 3,
                cap: 3
            })
        );
        assert_eq!(monitor.workers_needing_recycle().len(), 1);

        assert!(monitor.clear_recycle("thumbnail"));
        assert!(monitor.workers_needing_recycle().is_empty());
        assert_eq!(monitor.worker_stats("thumbnail").unwrap().jobs_processed, 0);
    }

    #[test]
    fn test_leak_detection() {
        let probe = Arc::new(ScriptedMemoryProbe::constant(100.0));
        let monitor = monitor_with(
            probe,
            MemoryConfig {
                max_jobs_per_worker: None,
                ..config()
            },
        );
        monitor.register_worker("w-1", "import", 50.0);

        for mb in [100.0, 110.0, 120.0, 130.0] {
            monitor.record_worker_sample("w-1", MemorySample::new(chrono::Utc::now(), MemoryReading::uniform(mb)));
            assert!(monitor.evaluate_recycle("w-1").is_none());
        }

        monitor.record_worker_sample("w-1", MemorySample::new(chrono::Utc::now(), MemoryReading::uniform(140.0)));
        match monitor.evaluate_recycle("w-1") {
            Some(RecycleReason::SuspectedLeak { slope_mb_per_sample }) => {
                assert!((slope_mb_per_sample - 10.0).abs() < 1e-9);
            }
            other => panic!("expected leak, got {:?}", other),
        }
    }

    #[test]
    fn test_flat_memory_is_not_a_leak() {
        let probe = Arc::new(ScriptedMemoryProbe::constant(100.0));
        let monitor = monitor_with(probe, config());
        monitor.register_worker("w-1", "import", 50.0);

        for mb in [300.0, 301.0, 299.0, 300.0, 302.0, 300.0] {
            monitor.record_worker_sample("w-1", MemorySample::new(chrono::Utc::now(), MemoryReading::uniform(mb)));
        }
        assert!(monitor.evaluate_recycle("w-1").is_none());
    }

    #[test]
    fn test_critical_worker_memory() {
        let probe = Arc::new(ScriptedMemoryProbe::constant(100.0));
        let monitor = monitor_with(probe, config());
        monitor.register_worker("w-2", "video", 300.0);
        monitor.record_worker_sample("w-2", MemorySample::new(chrono::Utc::now(), MemoryReading::uniform(950.0)));

        assert_eq!(
            monitor.evaluate_recycle("w-2"),
            Some(RecycleReason::CriticalMemory {
                used_mb: 950.0,
                threshold_mb: 900.0
            })
        );
    }

    #[test]
    fn test_unknown_worker() {
        let probe = Arc::new(ScriptedMemoryProbe::constant(100.0));
        let monitor = monitor_with(probe, config());
        assert!(monitor.evaluate_recycle("ghost").is_none());
        assert!(!monitor.clear_recycle("ghost"));
        assert!(!monitor.record_job_completed("ghost"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_sampling() {
        let probe = Arc::new(ScriptedMemoryProbe::constant(200.0));
        let monitor = Arc::new(monitor_with(probe, config()));

        let handle = monitor.start(Duration::from_millis(100));
        tokio::time::sleep(Duration::from_millis(250)).await;
        handle.shutdown(Duration::from_secs(1)).await.unwrap();

        assert_eq!(monitor.history().len(), 3);
    }

    /// Records whether the monitor's history lock was free during a read.
    #[derive(Default)]
    struct LockObservingReader {
        monitor: std::sync::OnceLock<std::sync::Weak<MemoryMonitor>>,
        history_free: AtomicBool,
    }

    impl MemoryProbe for LockObservingReader {
        fn read(&self) -> Option<MemoryReading> {
            if let Some(monitor) = self.monitor.get().and_then(std::sync::Weak::upgrade) {
                let free = monitor.history.try_lock().is_ok();
                self.history_free.store(free, Ordering::SeqCst);
            }
            Some(MemoryReading::uniform(100.0))
        }
    }

    #[test]
    fn test_memory_read_happens_outside_history_lock() {
        let reader = Arc::new(LockObservingReader::default());
        let monitor = Arc::new(MemoryMonitor::new(config(), reader.clone()).unwrap());
        reader.monitor.set(Arc::downgrade(&monitor)).unwrap();

        monitor.sample();
        assert!(reader.history_free.load(Ordering::SeqCst));
        assert_eq!(monitor.history().len(), 1);
    }
}
