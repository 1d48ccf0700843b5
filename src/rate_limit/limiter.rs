//! Registry of rate limit rules and their per-key state.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use serde::Serialize;
use tracing::{debug, info, trace, warn};

use crate::backend::QueueBackend;
use crate::clock::{system_clock, Clock};
use crate::error::{ConfigError, RateLimitError, RateLimitExceeded};
use crate::metrics::MetricsCollector;

use super::rule::RateLimitRule;
use super::window::{KeyState, RateLimitDecision};

/// Admission counters for one rule.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RuleStats {
    pub rule: String,
    pub admitted: u64,
    pub denied: u64,
    pub tracked_keys: usize,
}

/// Result of [`RateLimiter::admit_or_reschedule`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// The call may proceed now.
    Admitted { remaining: u32 },
    /// The job was handed back to the queue with a delay.
    Rescheduled { delay_ms: u64 },
}

struct RuleState {
    rule: RateLimitRule,
    keys: RwLock<HashMap<String, Arc<Mutex<KeyState>>>>,
    admitted: AtomicU64,
    denied: AtomicU64,
}

impl RuleState {
    fn new(rule: RateLimitRule) -> Self {
        Self {
            rule,
            keys: RwLock::new(HashMap::new()),
            admitted: AtomicU64::new(0),
            denied: AtomicU64::new(0),
        }
    }

    fn key_state(&self, key: &str, now_ms: u64) -> Arc<Mutex<KeyState>> {
        {
            let keys = self.keys.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(state) = keys.get(key) {
                return Arc::clone(state);
            }
        }

        let mut keys = self.keys.write().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(
            keys.entry(key.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(KeyState::new(&self.rule, now_ms)))),
        )
    }
}

/// Per-key admission control for outbound calls.
///
/// Rules are registered once and checked concurrently from any number of
/// tasks. Each `(rule, key)` pair has its own mutex, so a check only contends
/// with other checks of the same key, and the check-and-record step is atomic:
/// two racing callers can never both take the last slot.
///
/// The limiter never sleeps. A denial carries `retry_after_ms` and the caller
/// decides whether to wait, reschedule or give up.
///
/// State is process-local. Several processes sharing one upstream quota each
/// enforce their own budget; a shared store would be needed for a global limit.
pub struct RateLimiter {
    rules: RwLock<HashMap<String, Arc<RuleState>>>,
    clock: Arc<dyn Clock>,
    metrics: MetricsCollector,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

impl RateLimiter {
    /// Creates a limiter on the system clock.
    pub fn new() -> Self {
        Self::with_clock(system_clock())
    }

    /// Creates a limiter on the given clock.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            rules: RwLock::new(HashMap::new()),
            clock,
            metrics: MetricsCollector::new(),
        }
    }

    /// Registers a rule, replacing any rule of the same name and its key state.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidRateLimitRule` if the rule fails validation.
    pub fn register_rule(&self, rule: RateLimitRule) -> Result<(), ConfigError> {
        rule.validate()?;

        info!(
            rule = %rule.name,
            max_requests = rule.max_requests,
            window_ms = rule.window_ms,
            algorithm = ?rule.algorithm,
            "Registered rate limit rule"
        );

        let mut rules = self.rules.write().unwrap_or_else(PoisonError::into_inner);
        rules.insert(rule.name.clone(), Arc::new(RuleState::new(rule)));
        Ok(())
    }

    /// Returns the registered rule with this name.
    pub fn rule(&self, name: &str) -> Option<RateLimitRule> {
        self.rule_state(name).map(|state| state.rule.clone())
    }

    fn rule_state(&self, name: &str) -> Option<Arc<RuleState>> {
        let rules = self.rules.read().unwrap_or_else(PoisonError::into_inner);
        rules.get(name).cloned()
    }

    /// Checks and, when allowed, records one call for `key` under `rule`.
    ///
    /// # Errors
    ///
    /// Returns `RateLimitError::UnknownRule` if no rule has that name. A
    /// denial is not an error here; inspect `allowed` on the decision.
    pub fn check_limit(&self, rule: &str, key: &str) -> Result<RateLimitDecision, RateLimitError> {
        let state = self
            .rule_state(rule)
            .ok_or_else(|| RateLimitError::UnknownRule(rule.to_string()))?;

        let key_state = state.key_state(key, self.clock.now_ms());
        let decision = self.admit(&state, key, key_state);

        if decision.allowed {
            state.admitted.fetch_add(1, Ordering::Relaxed);
            debug!(rule, key, remaining = decision.remaining, "Rate limit admitted");
        } else {
            state.denied.fetch_add(1, Ordering::Relaxed);
            debug!(
                rule,
                key,
                retry_after_ms = decision.retry_after_ms,
                "Rate limit denied"
            );
        }
        self.metrics.record_rate_limit(rule, decision.allowed);

        Ok(decision)
    }

    /// Runs the check on `key_state`, or on the live entry for `key` if
    /// `key_state` was pruned after it was fetched.
    fn admit(
        &self,
        state: &RuleState,
        key: &str,
        mut key_state: Arc<Mutex<KeyState>>,
    ) -> RateLimitDecision {
        loop {
            {
                let mut guard = key_state.lock().unwrap_or_else(PoisonError::into_inner);
                if !guard.is_retired() {
                    // Read the clock under the key lock so timestamps enter the log in order.
                    let now_ms = self.clock.now_ms();
                    return guard.check(&state.rule, now_ms);
                }
            }
            trace!(rule = %state.rule.name, key, "Key state was pruned, refetching");
            key_state = state.key_state(key, self.clock.now_ms());
        }
    }

    /// Like [`check_limit`](Self::check_limit) but turns a denial into an error
    /// so callers can use `?`.
    ///
    /// # Errors
    ///
    /// Returns `RateLimitError::Exceeded` when the call is denied.
    pub fn acquire(&self, rule: &str, key: &str) -> Result<RateLimitDecision, RateLimitError> {
        let decision = self.check_limit(rule, key)?;
        if decision.allowed {
            Ok(decision)
        } else {
            Err(RateLimitExceeded {
                rule: rule.to_string(),
                key: key.to_string(),
                retry_after_ms: decision.retry_after_ms,
            }
            .into())
        }
    }

    /// Checks the limit for a queued job and, on denial, hands the job back
    /// to the queue with the advised delay.
    ///
    /// # Errors
    ///
    /// Returns `RateLimitError::UnknownRule` for an unknown rule, or
    /// `RateLimitError::RequeueFailed` if the backend could not take the job back.
    pub async fn admit_or_reschedule(
        &self,
        rule: &str,
        key: &str,
        queue: &str,
        job_id: &str,
        backend: &dyn QueueBackend,
    ) -> Result<Admission, RateLimitError> {
        let decision = self.check_limit(rule, key)?;
        if decision.allowed {
            return Ok(Admission::Admitted {
                remaining: decision.remaining,
            });
        }

        let delay_ms = decision.retry_after_ms;
        if let Err(fault) = backend.requeue_with_delay(queue, job_id, delay_ms).await {
            warn!(rule, key, queue, job_id, error = %fault, "Failed to reschedule rate-limited job");
            return Err(fault.into());
        }

        info!(rule, key, queue, job_id, delay_ms, "Rescheduled rate-limited job");
        Ok(Admission::Rescheduled { delay_ms })
    }

    /// Drops key state that no longer influences any check. Returns how many
    /// keys were removed.
    pub fn prune_stale_keys(&self) -> usize {
        let now_ms = self.clock.now_ms();
        let states: Vec<Arc<RuleState>> = {
            let rules = self.rules.read().unwrap_or_else(PoisonError::into_inner);
            rules.values().cloned().collect()
        };

        let mut removed = 0;
        for state in states {
            let mut keys = state.keys.write().unwrap_or_else(PoisonError::into_inner);
            let before = keys.len();
            keys.retain(|_, key_state| {
                // Keys another caller is using right now are kept.
                match key_state.try_lock() {
                    Ok(mut guard) => {
                        if guard.is_idle(&state.rule, now_ms) {
                            guard.retire();
                            false
                        } else {
                            true
                        }
                    }
                    Err(_) => true,
                }
            });
            removed += before - keys.len();
        }

        if removed > 0 {
            debug!(removed, "Pruned idle rate limit keys");
        }
        removed
    }

    /// Admission counters for a rule.
    pub fn stats(&self, rule: &str) -> Option<RuleStats> {
        let state = self.rule_state(rule)?;
        let tracked_keys = state
            .keys
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len();
        Some(RuleStats {
            rule: rule.to_string(),
            admitted: state.admitted.load(Ordering::Relaxed),
            denied: state.denied.load(Ordering::Relaxed),
            tracked_keys,
        })
    }

    /// Names of all registered rules, sorted.
    pub fn rule_names(&self) -> Vec<String> {
        let rules = self.rules.read().unwrap_or_else(PoisonError::into_inner);
        let mut names: Vec<String> = rules.keys().cloned().collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::InMemoryQueueBackend;
    use crate::clock::ManualClock;
    use crate::rate_limit::RateLimitAlgorithm;

    fn limiter() -> (Arc<ManualClock>, RateLimiter) {
        let clock = Arc::new(ManualClock::new(0));
        let limiter = RateLimiter::with_clock(clock.clone());
        (clock, limiter)
    }

    #[test]
    fn test_register_rejects_invalid_rule() {
        let (_, limiter) = limiter();
        assert!(limiter
            .register_rule(RateLimitRule::new("bad", 0, 1_000))
            .is_err());
        assert!(limiter.rule("bad").is_none());
    }

    #[test]
    fn test_unknown_rule() {
        let (_, limiter) = limiter();
        let err = limiter.check_limit("missing", "k").unwrap_err();
        assert_eq!(err, RateLimitError::UnknownRule("missing".to_string()));
    }

    #[test]
    fn test_keys_are_independent() {
        let (_, limiter) = limiter();
        limiter
            .register_rule(RateLimitRule::new("smtp", 1, 1_000))
            .unwrap();

        assert!(limiter.check_limit("smtp", "tenant-a").unwrap().allowed);
        assert!(!limiter.check_limit("smtp", "tenant-a").unwrap().allowed);
        assert!(limiter.check_limit("smtp", "tenant-b").unwrap().allowed);

        let stats = limiter.stats("smtp").unwrap();
        assert_eq!(stats.admitted, 2);
        assert_eq!(stats.denied, 1);
        assert_eq!(stats.tracked_keys, 2);
    }

    #[test]
    fn test_acquire_maps_denial_to_error() {
        let (clock, limiter) = limiter();
        limiter
            .register_rule(RateLimitRule::new("pdf", 1, 1_000))
            .unwrap();

        assert!(limiter.acquire("pdf", "k").is_ok());
        clock.advance_ms(300);
        match limiter.acquire("pdf", "k") {
            Err(RateLimitError::Exceeded(e)) => assert_eq!(e.retry_after_ms, 700),
            other => panic!("expected Exceeded, got {:?}", other),
        }
    }

    #[test]
    fn test_reregister_resets_state() {
        let (_, limiter) = limiter();
        limiter
            .register_rule(RateLimitRule::new("api", 1, 60_000))
            .unwrap();
        assert!(limiter.check_limit("api", "k").unwrap().allowed);
        assert!(!limiter.check_limit("api", "k").unwrap().allowed);

        limiter
            .register_rule(
                RateLimitRule::new("api", 1, 60_000).with_algorithm(RateLimitAlgorithm::TokenBucket),
            )
            .unwrap();
        assert!(limiter.check_limit("api", "k").unwrap().allowed);
    }

    #[test]
    fn test_prune_stale_keys() {
        let (clock, limiter) = limiter();
        limiter
            .register_rule(RateLimitRule::new("api", 3, 1_000))
            .unwrap();
        limiter.check_limit("api", "a").unwrap();
        limiter.check_limit("api", "b").unwrap();

        assert_eq!(limiter.prune_stale_keys(), 0);
        clock.advance_ms(1_000);
        assert_eq!(limiter.prune_stale_keys(), 2);
        assert_eq!(limiter.stats("api").unwrap().tracked_keys, 0);
    }

    #[test]
    fn test_concurrent_checks_never_over_admit() {
        let limiter = Arc::new(RateLimiter::with_clock(Arc::new(ManualClock::new(0))));
        limiter
            .register_rule(RateLimitRule::new("shared", 50, 60_000))
            .unwrap();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let limiter = Arc::clone(&limiter);
                std::thread::spawn(move || {
                    (0..100)
                        .filter(|_| limiter.check_limit("shared", "key").unwrap().allowed)
                        .count()
                })
            })
            .collect();

        let admitted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(admitted, 50);
    }

    #[tokio::test]
    async fn test_admit_or_reschedule_requeues_denied_job() {
        let (_, limiter) = limiter();
        limiter
            .register_rule(RateLimitRule::new("stripe", 1, 1_000))
            .unwrap();
        let backend = InMemoryQueueBackend::new();

        let first = limiter
            .admit_or_reschedule("stripe", "acct", "payments", "job-1", &backend)
            .await
            .unwrap();
        assert_eq!(first, Admission::Admitted { remaining: 0 });

        let second = limiter
            .admit_or_reschedule("stripe", "acct", "payments", "job-2", &backend)
            .await
            .unwrap();
        assert_eq!(second, Admission::Rescheduled { delay_ms: 1_000 });
        assert_eq!(
            backend.delayed_jobs("payments"),
            vec![("job-2".to_string(), 1_000)]
        );
    }

    #[test]
    fn test_check_on_pruned_state_uses_live_entry() {
        let (_, limiter) = limiter();
        limiter
            .register_rule(RateLimitRule::new("smtp", 1, 1_000))
            .unwrap();

        // A caller fetched the idle key state, then lost the race to pruning.
        let state = limiter.rule_state("smtp").unwrap();
        let stale = state.key_state("tenant-a", 0);
        assert_eq!(limiter.prune_stale_keys(), 1);
        assert!(stale.lock().unwrap().is_retired());

        assert!(limiter.admit(&state, "tenant-a", stale).allowed);
        // The admission landed in the live entry, so the budget is spent.
        assert!(!limiter.check_limit("smtp", "tenant-a").unwrap().allowed);
        assert_eq!(limiter.stats("smtp").unwrap().tracked_keys, 1);
    }
}
