//! Queue monitoring loop.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::alerts::{Alert, AlertBook, AlertSeverity, AlertType};
use super::health::{breaches, classify, HealthStatus, HealthThresholds, QueueHealthSnapshot};
use super::report::{DashboardSummary, HealthReport, JobTypeHealth, WorkerHealth};
use crate::backend::{QueueBackend, QueueStats};
use crate::clock::{system_clock, Clock};
use crate::error::{MonitorError, MonitoringFault};
use crate::memory::MemoryMonitor;
use crate::metrics::MetricsCollector;
use crate::observer::{Observer, ObserverList};
use crate::rate_limit::RateLimiter;
use crate::scaling::{ScalingDecision, ScalingManager, ScalingPolicy, ScalingSnapshot};
use crate::task::MonitorHandle;
use crate::timeout::TimeoutHandler;

/// Tuning for [`QueueMonitor`].
#[derive(Debug, Clone, PartialEq)]
pub struct MonitorSettings {
    /// Health snapshots kept per queue.
    pub history_capacity: usize,
    /// Consecutive failed fetches before a monitoring fault alert.
    pub fault_alert_threshold: u32,
    /// Repeated breaches within this window reuse the active alert.
    pub dedupe_window: Duration,
    /// Buffered decisions per subscriber before the slowest one lags.
    pub decision_channel_capacity: usize,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            history_capacity: 60,
            fault_alert_threshold: 3,
            dedupe_window: Duration::from_secs(3_600),
            decision_channel_capacity: 256,
        }
    }
}

struct MonitoredQueue {
    thresholds: HealthThresholds,
    current_workers: u32,
    history: VecDeque<QueueHealthSnapshot>,
    consecutive_faults: u32,
}

/// Outcome of one [`QueueMonitor::poll_once`] pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PollSummary {
    pub polled: usize,
    pub faults: usize,
    pub decisions: Vec<ScalingDecision>,
}

/// Clears the running flag when the monitoring task ends.
struct RunningGuard(Arc<AtomicBool>);

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Polls every registered queue, classifies its health, raises alerts and
/// publishes scaling decisions.
///
/// A failed fetch skips that queue for the tick and keeps its previous
/// snapshot; after `fault_alert_threshold` failures in a row a critical
/// [`AlertType::MonitoringFault`] alert is raised. Alerts are edge-triggered
/// per `(queue, alert type)` and deduplicated against active alerts inside
/// the dedupe window.
pub struct QueueMonitor {
    settings: MonitorSettings,
    backend: Arc<dyn QueueBackend>,
    scaling: Arc<ScalingManager>,
    memory: Arc<MemoryMonitor>,
    timeouts: Arc<TimeoutHandler>,
    rate_limiter: Arc<RateLimiter>,
    queues: RwLock<HashMap<String, Arc<Mutex<MonitoredQueue>>>>,
    alerts: Mutex<AlertBook>,
    alert_observers: ObserverList<Alert>,
    decisions_tx: broadcast::Sender<ScalingDecision>,
    running: Arc<AtomicBool>,
    clock: Arc<dyn Clock>,
    metrics: MetricsCollector,
}

impl QueueMonitor {
    pub fn new(
        backend: Arc<dyn QueueBackend>,
        scaling: Arc<ScalingManager>,
        memory: Arc<MemoryMonitor>,
        timeouts: Arc<TimeoutHandler>,
        rate_limiter: Arc<RateLimiter>,
    ) -> Self {
        let settings = MonitorSettings::default();
        let (decisions_tx, _) = broadcast::channel(settings.decision_channel_capacity);

        Self {
            alerts: Mutex::new(AlertBook::new(dedupe_window(&settings))),
            settings,
            backend,
            scaling,
            memory,
            timeouts,
            rate_limiter,
            queues: RwLock::new(HashMap::new()),
            alert_observers: ObserverList::new("alert"),
            decisions_tx,
            running: Arc::new(AtomicBool::new(false)),
            clock: system_clock(),
            metrics: MetricsCollector::new(),
        }
    }

    /// Replaces the settings. Call before registering queues.
    pub fn with_settings(mut self, settings: MonitorSettings) -> Self {
        let (decisions_tx, _) = broadcast::channel(settings.decision_channel_capacity.max(1));
        self.decisions_tx = decisions_tx;
        self.alerts = Mutex::new(AlertBook::new(dedupe_window(&settings)));
        self.settings = settings;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn scaling(&self) -> &Arc<ScalingManager> {
        &self.scaling
    }

    pub fn memory(&self) -> &Arc<MemoryMonitor> {
        &self.memory
    }

    pub fn timeouts(&self) -> &Arc<TimeoutHandler> {
        &self.timeouts
    }

    pub fn rate_limiter(&self) -> &Arc<RateLimiter> {
        &self.rate_limiter
    }

    /// Starts monitoring a queue and registers its scaling policy.
    ///
    /// Without explicit thresholds the queue warns at the policy's scale-up
    /// band and goes critical at twice it. The queue starts at its
    /// minimum worker count until [`set_current_workers`](Self::set_current_workers)
    /// says otherwise.
    ///
    /// # Errors
    ///
    /// Returns `MonitorError::Config` if the policy or thresholds are invalid.
    pub fn register_queue(
        &self,
        policy: ScalingPolicy,
        thresholds: Option<HealthThresholds>,
    ) -> Result<(), MonitorError> {
        let thresholds = thresholds.unwrap_or_else(|| HealthThresholds::from_policy(&policy));
        thresholds.validate()?;

        let name = policy.queue_name.clone();
        let min_workers = policy.min_workers;
        self.scaling.register_queue(policy)?;

        let mut queues = self.queues.write().unwrap_or_else(PoisonError::into_inner);
        match queues.get(&name) {
            Some(existing) => {
                existing
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .thresholds = thresholds;
            }
            None => {
                queues.insert(
                    name.clone(),
                    Arc::new(Mutex::new(MonitoredQueue {
                        thresholds,
                        current_workers: min_workers,
                        history: VecDeque::new(),
                        consecutive_faults: 0,
                    })),
                );
            }
        }

        info!(queue = %name, "Monitoring queue");
        Ok(())
    }

    fn queue(&self, name: &str) -> Result<Arc<Mutex<MonitoredQueue>>, MonitorError> {
        self.queues
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
            .ok_or_else(|| MonitorError::UnknownQueue(name.to_string()))
    }

    /// Monitored queue names, sorted.
    pub fn queue_names(&self) -> Vec<String> {
        let queues = self.queues.read().unwrap_or_else(PoisonError::into_inner);
        let mut names: Vec<String> = queues.keys().cloned().collect();
        names.sort();
        names
    }

    /// Reports the worker count actually running for a queue.
    ///
    /// # Errors
    ///
    /// Returns `MonitorError::UnknownQueue` if the queue is not monitored.
    pub fn set_current_workers(&self, queue: &str, workers: u32) -> Result<(), MonitorError> {
        let state = self.queue(queue)?;
        state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .current_workers = workers;
        debug!(queue, workers, "Updated current workers");
        Ok(())
    }

    /// Receives every scaling decision made by the monitor.
    pub fn subscribe_decisions(&self) -> broadcast::Receiver<ScalingDecision> {
        self.decisions_tx.subscribe()
    }

    /// Registers an alert observer. Observers hear about new and escalated
    /// alerts, not deduplicated repeats.
    pub fn on_alert(&self, observer: Arc<dyn Observer<Alert>>) {
        self.alert_observers.register(observer);
    }

    /// Polls every queue once.
    ///
    /// Snapshots are fetched concurrently; no lock is held while waiting on
    /// the backend.
    pub async fn poll_once(&self) -> PollSummary {
        let names = self.queue_names();

        let fetches = names.iter().map(|name| async move {
            let result = self.backend.get_queue_snapshot(name).await;
            (name.as_str(), result)
        });
        let results = join_all(fetches).await;

        let mut summary = PollSummary {
            polled: results.len(),
            ..Default::default()
        };

        for (name, result) in results {
            let Ok(state) = self.queue(name) else {
                continue;
            };
            match result {
                Ok(stats) => {
                    if let Some(decision) = self.apply_stats(name, &state, stats) {
                        summary.decisions.push(decision);
                    }
                }
                Err(fault) => {
                    summary.faults += 1;
                    self.apply_fault(name, &state, &fault);
                }
            }
        }

        summary
    }

    fn apply_stats(
        &self,
        name: &str,
        state: &Arc<Mutex<MonitoredQueue>>,
        stats: QueueStats,
    ) -> Option<ScalingDecision> {
        let now = self.clock.now();

        let (current_workers, thresholds) = {
            let mut queue = state.lock().unwrap_or_else(PoisonError::into_inner);
            let snapshot = classify(name, &stats, &queue.thresholds, now);
            if snapshot.status != HealthStatus::Healthy {
                debug!(queue = name, status = snapshot.status.as_str(), issues = ?snapshot.issues, "Queue unhealthy");
            }
            if queue.history.len() >= self.settings.history_capacity.max(1) {
                queue.history.pop_front();
            }
            queue.history.push_back(snapshot);
            queue.consecutive_faults = 0;
            (queue.current_workers, queue.thresholds)
        };

        self.metrics.update_queue(name, stats.depth, stats.latency_ms);

        let mut raised = Vec::new();
        {
            let mut book = self.alerts.lock().unwrap_or_else(PoisonError::into_inner);
            for breach in breaches(&stats, &thresholds) {
                let message = breach.message.unwrap_or_default();
                let transition = book.observe(name, breach.alert_type, breach.severity, &message, now);
                raised.extend(transition.notifiable().cloned());
            }
            book.observe(name, AlertType::MonitoringFault, None, "", now);
        }
        self.publish_alerts(raised);

        let snapshot = ScalingSnapshot::new(stats.depth, stats.latency_ms, current_workers);
        match self.scaling.make_scaling_decision(name, snapshot) {
            Ok(decision) => {
                // No subscribers is fine.
                let _ = self.decisions_tx.send(decision.clone());
                Some(decision)
            }
            Err(e) => {
                error!(queue = name, error = %e, "Scaling decision failed");
                None
            }
        }
    }

    fn apply_fault(&self, name: &str, state: &Arc<Mutex<MonitoredQueue>>, fault: &MonitoringFault) {
        let faults = {
            let mut queue = state.lock().unwrap_or_else(PoisonError::into_inner);
            queue.consecutive_faults += 1;
            queue.consecutive_faults
        };
        warn!(queue = name, consecutive_faults = faults, error = %fault, "Queue snapshot fetch failed");

        if faults < self.settings.fault_alert_threshold {
            return;
        }

        let message = format!(
            "{} consecutive snapshot failures: {}",
            faults, fault.message
        );
        let transition = self
            .alerts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .observe(
                name,
                AlertType::MonitoringFault,
                Some(AlertSeverity::Critical),
                &message,
                self.clock.now(),
            );
        self.publish_alerts(transition.notifiable().cloned().into_iter().collect());
    }

    fn publish_alerts(&self, alerts: Vec<Alert>) {
        if alerts.is_empty() {
            return;
        }

        for alert in &alerts {
            warn!(
                alert_id = %alert.id,
                queue = %alert.queue_name,
                alert_type = alert.alert_type.as_str(),
                severity = alert.severity.as_str(),
                message = %alert.message,
                "Alert raised"
            );
            self.metrics
                .record_alert(alert.alert_type.as_str(), alert.severity.as_str());
            self.alert_observers.notify(alert);
        }
        self.metrics.update_active_alerts(self.active_alert_count());
    }

    fn active_alert_count(&self) -> usize {
        self.alerts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .active()
            .len()
    }

    /// Runs [`poll_once`](Self::poll_once) every `interval` on a background task.
    ///
    /// # Errors
    ///
    /// Returns `MonitorError::AlreadyRunning` if a loop started by this
    /// monitor is still running.
    pub fn start_monitoring(self: &Arc<Self>, interval: Duration) -> Result<MonitorHandle, MonitorError> {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(MonitorError::AlreadyRunning);
        }

        let monitor = Arc::clone(self);
        let guard = RunningGuard(Arc::clone(&self.running));
        Ok(MonitorHandle::spawn("queue_monitor", interval, move || {
            let _running = &guard;
            let monitor = Arc::clone(&monitor);
            async move {
                let summary = monitor.poll_once().await;
                debug!(
                    polled = summary.polled,
                    faults = summary.faults,
                    decisions = summary.decisions.len(),
                    "Monitor tick complete"
                );
            }
        }))
    }

    pub fn is_monitoring(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Moves an active alert to the history.
    ///
    /// # Errors
    ///
    /// Returns `MonitorError::AlertNotFound` if no active alert has this id.
    pub fn acknowledge_alert(&self, id: Uuid) -> Result<Alert, MonitorError> {
        let (alert, remaining) = {
            let mut book = self.alerts.lock().unwrap_or_else(PoisonError::into_inner);
            let alert = book.acknowledge(id, self.clock.now())?;
            (alert, book.active().len())
        };
        info!(alert_id = %id, queue = %alert.queue_name, "Alert acknowledged");
        self.metrics.update_active_alerts(remaining);
        Ok(alert)
    }

    pub fn active_alerts(&self) -> Vec<Alert> {
        self.alerts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .active()
            .to_vec()
    }

    /// Acknowledged alerts.
    pub fn alert_history(&self) -> Vec<Alert> {
        self.alerts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .history()
            .to_vec()
    }

    /// Latest snapshot of a queue, if it was polled successfully at least once.
    pub fn latest_snapshot(&self, queue: &str) -> Option<QueueHealthSnapshot> {
        let state = self.queue(queue).ok()?;
        let queue = state.lock().unwrap_or_else(PoisonError::into_inner);
        queue.history.back().cloned()
    }

    /// Newest `limit` snapshots of a queue, oldest first.
    ///
    /// # Errors
    ///
    /// Returns `MonitorError::UnknownQueue` if the queue is not monitored.
    pub fn queue_history(&self, queue: &str, limit: usize) -> Result<Vec<QueueHealthSnapshot>, MonitorError> {
        let state = self.queue(queue)?;
        let queue = state.lock().unwrap_or_else(PoisonError::into_inner);
        let skip = queue.history.len().saturating_sub(limit);
        Ok(queue.history.iter().skip(skip).cloned().collect())
    }

    fn latest_snapshots(&self) -> Vec<QueueHealthSnapshot> {
        self.queue_names()
            .iter()
            .filter_map(|name| self.latest_snapshot(name))
            .collect()
    }

    pub fn get_dashboard_summary(&self) -> DashboardSummary {
        let snapshots = self.latest_snapshots();
        DashboardSummary::from_snapshots(
            self.queue_names().len(),
            &snapshots,
            self.active_alert_count(),
            self.clock.now(),
        )
    }

    pub fn health_report(&self) -> HealthReport {
        let queues = self.latest_snapshots();
        let workers: Vec<WorkerHealth> = self
            .memory
            .worker_snapshots()
            .into_iter()
            .map(WorkerHealth::from)
            .collect();
        let memory = self.memory.current_status();

        let job_types = self
            .timeouts
            .job_types()
            .into_iter()
            .map(|job_type| JobTypeHealth {
                effective_timeout_ms: self.timeouts.effective_timeout(&job_type),
                stats: self.timeouts.get_execution_stats(&job_type),
                job_type,
            })
            .collect();
        let rate_limits = self
            .rate_limiter
            .rule_names()
            .iter()
            .filter_map(|rule| self.rate_limiter.stats(rule))
            .collect();

        let healthy = queues.iter().all(|q| q.status != HealthStatus::Critical)
            && !memory.is_some_and(|m| m.exceeds_critical)
            && workers.iter().all(|w| w.recycle_reason.is_none());

        HealthReport {
            healthy,
            timestamp: self.clock.now(),
            queues,
            workers,
            memory,
            job_types,
            rate_limits,
        }
    }
}

fn dedupe_window(settings: &MonitorSettings) -> chrono::Duration {
    chrono::Duration::from_std(settings.dedupe_window).unwrap_or_else(|_| chrono::Duration::hours(1))
}
