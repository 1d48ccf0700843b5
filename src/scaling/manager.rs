//! Per-queue scaling control loop.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use tracing::{debug, info, warn};

use crate::clock::{system_clock, Clock};
use crate::error::{ConfigError, ScalingError};
use crate::metrics::MetricsCollector;

use super::policy::{ScalingAction, ScalingDecision, ScalingPolicy, ScalingSnapshot};
use super::strategy::{ProportionalStrategy, ScaleUpStrategy};

/// Decisions kept per queue unless configured otherwise.
pub const DEFAULT_HISTORY_CAPACITY: usize = 100;

struct QueueScaling {
    policy: ScalingPolicy,
    last_scale_up_ms: Option<u64>,
    last_action_ms: Option<u64>,
    history: VecDeque<ScalingDecision>,
}

impl QueueScaling {
    fn new(policy: ScalingPolicy) -> Self {
        Self {
            policy,
            last_scale_up_ms: None,
            last_action_ms: None,
            history: VecDeque::new(),
        }
    }
}

/// Remaining cooldown in ms, or `None` when the cooldown has passed.
fn cooldown_remaining(last_ms: Option<u64>, cooldown_ms: u64, now_ms: u64) -> Option<u64> {
    let last = last_ms?;
    let since = now_ms.saturating_sub(last);
    (since < cooldown_ms).then(|| cooldown_ms - since)
}

/// Turns queue snapshots into scale up / down / none decisions.
///
/// Evaluation order for a snapshot:
///
/// 1. Below `min_workers`: scale up to the minimum, ignoring cooldowns.
/// 2. Depth or latency in the scale-up band: add workers per the
///    [`ScaleUpStrategy`], capped at `max_workers`, unless the last scale-up
///    is within `scale_up_cooldown_ms`.
/// 3. Depth and latency in the scale-down band above the minimum: remove
///    one worker, unless the last scaling action in either direction is
///    within `scale_down_cooldown_ms`.
/// 4. Otherwise no change.
///
/// Rule 2 is checked before rule 3, so overlapping bands scale up.
pub struct ScalingManager {
    queues: RwLock<HashMap<String, Arc<Mutex<QueueScaling>>>>,
    strategy: Arc<dyn ScaleUpStrategy>,
    clock: Arc<dyn Clock>,
    history_capacity: usize,
    metrics: MetricsCollector,
}

impl Default for ScalingManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ScalingManager {
    pub fn new() -> Self {
        Self::with_clock(system_clock())
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            queues: RwLock::new(HashMap::new()),
            strategy: Arc::new(ProportionalStrategy),
            clock,
            history_capacity: DEFAULT_HISTORY_CAPACITY,
            metrics: MetricsCollector::new(),
        }
    }

    /// Replaces the scale-up step strategy.
    pub fn with_strategy(mut self, strategy: Arc<dyn ScaleUpStrategy>) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_history_capacity(mut self, capacity: usize) -> Self {
        self.history_capacity = capacity.max(1);
        self
    }

    /// Registers or replaces the policy for a queue.
    ///
    /// Re-registering keeps the queue's decision history and cooldown
    /// timestamps.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidScalingPolicy` if the policy fails validation.
    pub fn register_queue(&self, policy: ScalingPolicy) -> Result<(), ConfigError> {
        policy.validate()?;

        if policy.has_overlapping_bands() {
            warn!(
                queue = %policy.queue_name,
                "Scale-down band overlaps scale-up band, scale-up takes priority"
            );
        }
        info!(
            queue = %policy.queue_name,
            min_workers = policy.min_workers,
            max_workers = policy.max_workers,
            "Registered scaling policy"
        );

        let mut queues = self.queues.write().unwrap_or_else(PoisonError::into_inner);
        match queues.get(&policy.queue_name) {
            Some(existing) => {
                existing.lock().unwrap_or_else(PoisonError::into_inner).policy = policy;
            }
            None => {
                queues.insert(
                    policy.queue_name.clone(),
                    Arc::new(Mutex::new(QueueScaling::new(policy))),
                );
            }
        }
        Ok(())
    }

    fn queue(&self, queue: &str) -> Result<Arc<Mutex<QueueScaling>>, ScalingError> {
        self.queues
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(queue)
            .cloned()
            .ok_or_else(|| ScalingError::UnknownQueue(queue.to_string()))
    }

    pub fn policy(&self, queue: &str) -> Option<ScalingPolicy> {
        self.queue(queue)
            .ok()
            .map(|q| q.lock().unwrap_or_else(PoisonError::into_inner).policy.clone())
    }

    /// Registered queue names, sorted.
    pub fn queue_names(&self) -> Vec<String> {
        let queues = self.queues.read().unwrap_or_else(PoisonError::into_inner);
        let mut names: Vec<String> = queues.keys().cloned().collect();
        names.sort();
        names
    }

    /// Evaluates one snapshot and records the decision.
    ///
    /// # Errors
    ///
    /// Returns `ScalingError::UnknownQueue` if no policy is registered.
    pub fn make_scaling_decision(
        &self,
        queue: &str,
        snapshot: ScalingSnapshot,
    ) -> Result<ScalingDecision, ScalingError> {
        let state = self.queue(queue)?;
        let mut state = state.lock().unwrap_or_else(PoisonError::into_inner);

        let now = self.clock.now();
        let now_ms = self.clock.now_ms();
        let (action, target_workers, reason) = self.evaluate(&state, &snapshot, now_ms);

        match action {
            ScalingAction::ScaleUp => {
                state.last_scale_up_ms = Some(now_ms);
                state.last_action_ms = Some(now_ms);
            }
            ScalingAction::ScaleDown => state.last_action_ms = Some(now_ms),
            ScalingAction::None => {}
        }

        let decision = ScalingDecision {
            timestamp: now,
            queue_name: queue.to_string(),
            action,
            current_workers: snapshot.current_workers,
            target_workers,
            reason,
        };

        if state.history.len() >= self.history_capacity {
            state.history.pop_front();
        }
        state.history.push_back(decision.clone());
        drop(state);

        if decision.is_change() {
            info!(
                queue,
                action = %decision.action,
                current_workers = decision.current_workers,
                target_workers = decision.target_workers,
                reason = %decision.reason,
                "Scaling decision"
            );
        } else {
            debug!(queue, reason = %decision.reason, "No scaling change");
        }
        self.metrics
            .record_scaling_decision(queue, decision.action.as_str(), decision.target_workers);

        Ok(decision)
    }

    fn evaluate(
        &self,
        state: &QueueScaling,
        snapshot: &ScalingSnapshot,
        now_ms: u64,
    ) -> (ScalingAction, u32, String) {
        let policy = &state.policy;
        let current = snapshot.current_workers;

        if current < policy.min_workers {
            return (
                ScalingAction::ScaleUp,
                policy.min_workers,
                format!("below minimum ({} < {})", current, policy.min_workers),
            );
        }

        let depth_high = snapshot.depth >= policy.scale_up.depth;
        let latency_high = snapshot.latency_ms >= policy.scale_up.latency_ms;
        if depth_high || latency_high {
            if current >= policy.max_workers {
                return (
                    ScalingAction::None,
                    current,
                    format!("at maximum ({} workers)", policy.max_workers),
                );
            }
            if let Some(remaining) =
                cooldown_remaining(state.last_scale_up_ms, policy.scale_up_cooldown_ms, now_ms)
            {
                return (
                    ScalingAction::None,
                    current,
                    format!("scale-up cooldown ({}ms remaining)", remaining),
                );
            }

            let step = self.strategy.increment(policy, snapshot).max(1);
            let target = current.saturating_add(step).min(policy.max_workers);
            let trigger = match (depth_high, latency_high) {
                (true, true) => format!(
                    "depth {} >= {} and latency {}ms >= {}ms",
                    snapshot.depth,
                    policy.scale_up.depth,
                    snapshot.latency_ms,
                    policy.scale_up.latency_ms
                ),
                (true, false) => format!("depth {} >= {}", snapshot.depth, policy.scale_up.depth),
                _ => format!(
                    "latency {}ms >= {}ms",
                    snapshot.latency_ms, policy.scale_up.latency_ms
                ),
            };
            return (ScalingAction::ScaleUp, target, trigger);
        }

        let low_load = snapshot.depth <= policy.scale_down.depth
            && snapshot.latency_ms <= policy.scale_down.latency_ms;
        if low_load && current > policy.min_workers {
            if let Some(remaining) =
                cooldown_remaining(state.last_action_ms, policy.scale_down_cooldown_ms, now_ms)
            {
                return (
                    ScalingAction::None,
                    current,
                    format!("scale-down cooldown ({}ms remaining)", remaining),
                );
            }
            return (
                ScalingAction::ScaleDown,
                current - 1,
                format!(
                    "depth {} <= {} and latency {}ms <= {}ms",
                    snapshot.depth,
                    policy.scale_down.depth,
                    snapshot.latency_ms,
                    policy.scale_down.latency_ms
                ),
            );
        }

        (ScalingAction::None, current, "within thresholds".to_string())
    }

    /// Newest `limit` decisions for `queue`, in evaluation order.
    ///
    /// # Errors
    ///
    /// Returns `ScalingError::UnknownQueue` if no policy is registered.
    pub fn get_scaling_history(
        &self,
        queue: &str,
        limit: usize,
    ) -> Result<Vec<ScalingDecision>, ScalingError> {
        let state = self.queue(queue)?;
        let state = state.lock().unwrap_or_else(PoisonError::into_inner);
        let skip = state.history.len().saturating_sub(limit);
        Ok(state.history.iter().skip(skip).cloned().collect())
    }

    /// Most recent decision for `queue`.
    pub fn last_decision(&self, queue: &str) -> Option<ScalingDecision> {
        let state = self.queue(queue).ok()?;
        let state = state.lock().unwrap_or_else(PoisonError::into_inner);
        state.history.back().cloned()
    }
}
