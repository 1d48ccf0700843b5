//! Job execution under soft and hard timeouts.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::clock::{system_clock, Clock};
use crate::error::{ConfigError, JobError};
use crate::metrics::MetricsCollector;
use crate::observer::{Observer, ObserverList};

use super::config::{TimeoutConfig, TimeoutOptions};
use super::history::{ExecutionHistory, ExecutionOutcome, ExecutionRecord, ExecutionStats};

/// Tuning shared by every job type.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutSettings {
    /// Fraction of the effective timeout at which the soft timeout fires.
    pub soft_ratio: f64,
    /// Adaptive timeouts are recomputed after this many new records.
    pub recompute_every: u64,
    /// Execution records kept per job type.
    pub history_capacity: usize,
    /// Adaptive timeout is `p95 * adaptive_multiplier` before clamping.
    pub adaptive_multiplier: f64,
    /// Timeout for job types that were never configured.
    pub default_timeout_ms: u64,
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self {
            soft_ratio: 0.8,
            recompute_every: 10,
            history_capacity: 1000,
            adaptive_multiplier: 1.5,
            default_timeout_ms: 30_000,
        }
    }
}

impl TimeoutSettings {
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidValue` for a soft ratio outside `(0, 1)`,
    /// a multiplier below 1, or zero counts and timeouts.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |key: &str, message: &str| ConfigError::InvalidValue {
            key: key.to_string(),
            message: message.to_string(),
        };

        if !(self.soft_ratio > 0.0 && self.soft_ratio < 1.0) {
            return Err(invalid("soft_ratio", "must be between 0 and 1 (exclusive)"));
        }
        if !(self.adaptive_multiplier >= 1.0) {
            return Err(invalid("adaptive_multiplier", "must be at least 1.0"));
        }
        if self.recompute_every == 0 {
            return Err(invalid("recompute_every", "must be greater than 0"));
        }
        if self.history_capacity == 0 {
            return Err(invalid("history_capacity", "must be greater than 0"));
        }
        if self.default_timeout_ms == 0 {
            return Err(invalid("default_timeout_ms", "must be greater than 0"));
        }
        Ok(())
    }
}

/// Emitted once per run when a job passes its soft timeout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SoftTimeoutEvent {
    pub job_type: String,
    pub elapsed_ms: u64,
    pub timeout_ms: u64,
}

/// Handed to every job run.
///
/// Long-running handlers, and any work they spawn, should watch
/// [`cancelled`](Self::cancelled) and stop when the hard timeout hits.
#[derive(Debug, Clone)]
pub struct JobContext {
    job_type: String,
    timeout: Duration,
    cancel: watch::Receiver<bool>,
}

impl JobContext {
    pub fn job_type(&self) -> &str {
        &self.job_type
    }

    /// Hard timeout applied to this run.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    /// Resolves once the run is cancelled or has otherwise ended.
    pub async fn cancelled(&mut self) {
        while !*self.cancel.borrow_and_update() {
            if self.cancel.changed().await.is_err() {
                return;
            }
        }
    }
}

struct JobTypeState {
    config: TimeoutConfig,
    effective_timeout_ms: u64,
    history: ExecutionHistory,
    since_recompute: u64,
    /// Bumped by every reconfiguration.
    generation: u64,
}

/// Adaptive recompute input captured under the job type's lock.
struct Recompute {
    durations: Vec<u64>,
    config: TimeoutConfig,
    generation: u64,
}

impl JobTypeState {
    fn new(config: TimeoutConfig, history_capacity: usize) -> Self {
        Self {
            effective_timeout_ms: config.base_timeout_ms,
            config,
            history: ExecutionHistory::new(history_capacity),
            since_recompute: 0,
            generation: 0,
        }
    }
}

/// Runs jobs under per-job-type timeouts and keeps their latency history.
///
/// Each run gets a soft timeout (observers and a warning, never fatal) and a
/// hard timeout (the handler future is dropped, the run's [`JobContext`] is
/// cancelled and [`JobError::TimedOut`] is returned). Adaptive job types
/// retune their timeout from the p95 of recent runs.
pub struct TimeoutHandler {
    settings: TimeoutSettings,
    job_types: RwLock<HashMap<String, Arc<Mutex<JobTypeState>>>>,
    soft_timeout_observers: ObserverList<SoftTimeoutEvent>,
    clock: Arc<dyn Clock>,
    metrics: MetricsCollector,
}

impl Default for TimeoutHandler {
    fn default() -> Self {
        Self::new(TimeoutSettings::default())
    }
}

impl TimeoutHandler {
    pub fn new(settings: TimeoutSettings) -> Self {
        Self::with_clock(settings, system_clock())
    }

    /// Record timestamps come from `clock`; timers always use tokio time.
    pub fn with_clock(settings: TimeoutSettings, clock: Arc<dyn Clock>) -> Self {
        Self {
            settings,
            job_types: RwLock::new(HashMap::new()),
            soft_timeout_observers: ObserverList::new("soft_timeout"),
            clock,
            metrics: MetricsCollector::new(),
        }
    }

    pub fn settings(&self) -> &TimeoutSettings {
        &self.settings
    }

    /// Sets the timeout config for a job type.
    ///
    /// Reconfiguring keeps the execution history and resets the effective
    /// timeout to the new base.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidTimeoutConfig` if the config fails validation.
    pub fn configure(&self, config: TimeoutConfig) -> Result<(), ConfigError> {
        config.validate()?;

        info!(
            job_type = %config.job_type,
            base_timeout_ms = config.base_timeout_ms,
            adaptive = config.adaptive,
            "Configured job timeout"
        );
        self.metrics
            .update_effective_timeout(&config.job_type, config.base_timeout_ms);

        let mut job_types = self.job_types.write().unwrap_or_else(PoisonError::into_inner);
        match job_types.get(&config.job_type) {
            Some(existing) => {
                let mut state = existing.lock().unwrap_or_else(PoisonError::into_inner);
                state.effective_timeout_ms = config.base_timeout_ms;
                state.since_recompute = 0;
                state.generation += 1;
                state.config = config;
            }
            None => {
                let job_type = config.job_type.clone();
                let state = JobTypeState::new(config, self.settings.history_capacity);
                job_types.insert(job_type, Arc::new(Mutex::new(state)));
            }
        }
        Ok(())
    }

    /// Registers `options` for `job_type` and returns a reusable job that
    /// runs `job` under them.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidTimeoutConfig` if the options are invalid.
    pub fn wrap<F>(
        self: &Arc<Self>,
        job_type: impl Into<String>,
        job: F,
        options: TimeoutOptions,
    ) -> Result<WrappedJob<F>, ConfigError> {
        let job_type = job_type.into();
        self.configure(TimeoutConfig::from_options(job_type.clone(), options))?;

        Ok(WrappedJob {
            handler: Arc::clone(self),
            job_type,
            job,
        })
    }

    fn state_for(&self, job_type: &str) -> Arc<Mutex<JobTypeState>> {
        {
            let job_types = self.job_types.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(state) = job_types.get(job_type) {
                return Arc::clone(state);
            }
        }

        let mut job_types = self.job_types.write().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(job_types.entry(job_type.to_string()).or_insert_with(|| {
            let config = TimeoutConfig::new(job_type, self.settings.default_timeout_ms);
            Arc::new(Mutex::new(JobTypeState::new(
                config,
                self.settings.history_capacity,
            )))
        }))
    }

    /// Current hard timeout for `job_type`, in milliseconds.
    pub fn effective_timeout(&self, job_type: &str) -> u64 {
        let job_types = self.job_types.read().unwrap_or_else(PoisonError::into_inner);
        job_types
            .get(job_type)
            .map(|state| {
                state
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .effective_timeout_ms
            })
            .unwrap_or(self.settings.default_timeout_ms)
    }

    /// Registers an observer for soft timeout events.
    pub fn on_soft_timeout(&self, observer: Arc<dyn Observer<SoftTimeoutEvent>>) {
        self.soft_timeout_observers.register(observer);
    }

    /// Runs `job` once under the timeouts of `job_type`.
    ///
    /// Job types that were never configured use the default timeout.
    ///
    /// # Errors
    ///
    /// - `JobError::TimedOut` if the hard timeout elapsed first
    /// - `JobError::Handler` with the handler's own error otherwise
    pub async fn execute<T, E, F, Fut>(&self, job_type: &str, job: F) -> Result<T, JobError<E>>
    where
        F: FnOnce(JobContext) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let state = self.state_for(job_type);
        let timeout_ms = state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .effective_timeout_ms;
        let soft_after_ms = (timeout_ms as f64 * self.settings.soft_ratio) as u64;

        let (cancel_tx, cancel_rx) = watch::channel(false);
        let ctx = JobContext {
            job_type: job_type.to_string(),
            timeout: Duration::from_millis(timeout_ms),
            cancel: cancel_rx,
        };

        debug!(job_type, timeout_ms, "Starting job");

        let started = Instant::now();
        let mut run = Box::pin(job(ctx));
        let hard = tokio::time::sleep(Duration::from_millis(timeout_ms));
        let soft = tokio::time::sleep(Duration::from_millis(soft_after_ms));
        tokio::pin!(hard);
        tokio::pin!(soft);
        let mut soft_fired = false;

        let finished = loop {
            tokio::select! {
                biased;
                output = &mut run => break Some(output),
                _ = &mut hard => break None,
                _ = &mut soft, if !soft_fired => {
                    soft_fired = true;
                    self.soft_timeout(job_type, elapsed_ms(started), timeout_ms);
                }
            }
        };
        let elapsed = elapsed_ms(started);

        match finished {
            Some(Ok(value)) => {
                self.finish(&state, job_type, elapsed, ExecutionOutcome::Success);
                Ok(value)
            }
            Some(Err(e)) => {
                self.finish(&state, job_type, elapsed, ExecutionOutcome::Error);
                Err(JobError::Handler(e))
            }
            None => {
                let _ = cancel_tx.send(true);
                drop(run);

                warn!(job_type, timeout_ms, elapsed_ms = elapsed, "Job hit hard timeout");
                self.finish(&state, job_type, elapsed, ExecutionOutcome::Timeout);
                Err(JobError::TimedOut {
                    job_type: job_type.to_string(),
                    timeout_ms,
                    elapsed_ms: elapsed,
                })
            }
        }
    }

    fn soft_timeout(&self, job_type: &str, elapsed_ms: u64, timeout_ms: u64) {
        warn!(job_type, elapsed_ms, timeout_ms, "Job passed soft timeout");
        self.metrics.record_soft_timeout(job_type);

        let event = SoftTimeoutEvent {
            job_type: job_type.to_string(),
            elapsed_ms,
            timeout_ms,
        };
        self.soft_timeout_observers.notify(&event);
    }

    fn finish(
        &self,
        state: &Arc<Mutex<JobTypeState>>,
        job_type: &str,
        duration_ms: u64,
        outcome: ExecutionOutcome,
    ) {
        let record = ExecutionRecord::new(job_type, duration_ms, outcome)
            .with_timestamp(self.clock.now());
        self.record_into(state, record);
    }

    /// Adds an externally measured execution to the job type's history.
    pub fn record_execution(&self, record: ExecutionRecord) {
        let state = self.state_for(&record.job_type);
        self.record_into(&state, record);
    }

    fn record_into(&self, state: &Arc<Mutex<JobTypeState>>, record: ExecutionRecord) {
        self.metrics.record_execution(
            &record.job_type,
            record.outcome.as_str(),
            record.duration_ms as f64 / 1000.0,
        );
        let job_type = record.job_type.clone();

        if let Some(recompute) = self.push_record(state, record) {
            self.apply_recompute(state, &job_type, recompute);
        }
    }

    /// Appends a record and, when a recompute is due, snapshots its input.
    fn push_record(&self, state: &Arc<Mutex<JobTypeState>>, record: ExecutionRecord) -> Option<Recompute> {
        let mut guard = state.lock().unwrap_or_else(PoisonError::into_inner);
        guard.history.push(record);
        guard.since_recompute += 1;

        if guard.config.adaptive && guard.since_recompute >= self.settings.recompute_every {
            guard.since_recompute = 0;
            Some(Recompute {
                durations: guard.history.snapshot().0,
                config: guard.config.clone(),
                generation: guard.generation,
            })
        } else {
            None
        }
    }

    /// Percentiles are computed without the lock. The result is dropped if
    /// the job type was reconfigured in the meantime.
    fn apply_recompute(&self, state: &Arc<Mutex<JobTypeState>>, job_type: &str, recompute: Recompute) {
        let p95 = ExecutionStats::from_durations(recompute.durations, 0, 0).p95_ms;
        let candidate = (p95 as f64 * self.settings.adaptive_multiplier).round() as u64;
        let timeout_ms = recompute.config.clamp(candidate);

        let previous = {
            let mut guard = state.lock().unwrap_or_else(PoisonError::into_inner);
            if guard.generation != recompute.generation {
                debug!(job_type, "Job type reconfigured during recompute, discarding result");
                return;
            }
            std::mem::replace(&mut guard.effective_timeout_ms, timeout_ms)
        };

        if previous != timeout_ms {
            debug!(
                job_type,
                p95_ms = p95,
                previous_ms = previous,
                timeout_ms,
                "Adjusted adaptive timeout"
            );
        }
        self.metrics.update_effective_timeout(job_type, timeout_ms);
    }

    /// Latency statistics over the retained history, or `None` if the job
    /// type has no records.
    pub fn get_execution_stats(&self, job_type: &str) -> Option<ExecutionStats> {
        let state = {
            let job_types = self.job_types.read().unwrap_or_else(PoisonError::into_inner);
            job_types.get(job_type).cloned()?
        };

        let (durations, timeouts, errors) = {
            let guard = state.lock().unwrap_or_else(PoisonError::into_inner);
            if guard.history.is_empty() {
                return None;
            }
            guard.history.snapshot()
        };

        Some(ExecutionStats::from_durations(durations, timeouts, errors))
    }

    /// Newest `limit` records for `job_type`, oldest first.
    pub fn recent_executions(&self, job_type: &str, limit: usize) -> Vec<ExecutionRecord> {
        let job_types = self.job_types.read().unwrap_or_else(PoisonError::into_inner);
        job_types
            .get(job_type)
            .map(|state| {
                state
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .history
                    .recent(limit)
            })
            .unwrap_or_default()
    }

    /// Job types with a config or history, sorted.
    pub fn job_types(&self) -> Vec<String> {
        let job_types = self.job_types.read().unwrap_or_else(PoisonError::into_inner);
        let mut names: Vec<String> = job_types.keys().cloned().collect();
        names.sort();
        names
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

/// A job bound to a [`TimeoutHandler`] and a job type.
pub struct WrappedJob<F> {
    handler: Arc<TimeoutHandler>,
    job_type: String,
    job: F,
}

impl<F> WrappedJob<F> {
    pub fn job_type(&self) -> &str {
        &self.job_type
    }

    /// Runs the job once under its timeouts.
    ///
    /// # Errors
    ///
    /// See [`TimeoutHandler::execute`].
    pub async fn run<T, E, Fut>(&self) -> Result<T, JobError<E>>
    where
        F: Fn(JobContext) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.handler
            .execute(&self.job_type, |ctx| (self.job)(ctx))
            .await
    }
}
