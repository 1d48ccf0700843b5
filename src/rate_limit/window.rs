//! Per-key admission state.
//!
//! Both algorithms take the current time as an argument and never sleep, so
//! the limiter can hold a key's lock for the whole check without blocking
//! other keys for longer than a few arithmetic operations.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use super::rule::{RateLimitAlgorithm, RateLimitRule};

/// Outcome of a single rate limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitDecision {
    /// Whether the call may proceed now.
    pub allowed: bool,
    /// Calls still admissible in the current window after this one.
    pub remaining: u32,
    /// Suggested wait before retrying; 0 when allowed.
    pub retry_after_ms: u64,
}

impl RateLimitDecision {
    fn allow(remaining: u32) -> Self {
        Self {
            allowed: true,
            remaining,
            retry_after_ms: 0,
        }
    }

    fn deny(retry_after_ms: u64) -> Self {
        Self {
            allowed: false,
            remaining: 0,
            retry_after_ms: retry_after_ms.max(1),
        }
    }
}

/// Sliding log of admitted call timestamps, oldest first.
#[derive(Debug, Default)]
pub(crate) struct SlidingWindow {
    timestamps: VecDeque<u64>,
}

impl SlidingWindow {
    fn prune(&mut self, window_ms: u64, now_ms: u64) {
        while let Some(&oldest) = self.timestamps.front() {
            if now_ms.saturating_sub(oldest) >= window_ms {
                self.timestamps.pop_front();
            } else {
                break;
            }
        }
    }

    fn check(&mut self, rule: &RateLimitRule, now_ms: u64) -> RateLimitDecision {
        self.prune(rule.window_ms, now_ms);

        let max = rule.max_requests as usize;
        if self.timestamps.len() < max {
            self.timestamps.push_back(now_ms);
            return RateLimitDecision::allow((max - self.timestamps.len()) as u32);
        }

        // Full window: the slot frees up when the oldest entry ages out.
        let oldest = self.timestamps.front().copied().unwrap_or(now_ms);
        RateLimitDecision::deny(oldest.saturating_add(rule.window_ms).saturating_sub(now_ms))
    }

    fn is_idle(&mut self, window_ms: u64, now_ms: u64) -> bool {
        self.prune(window_ms, now_ms);
        self.timestamps.is_empty()
    }
}

/// Lazily refilled token bucket. Starts full.
#[derive(Debug)]
pub(crate) struct TokenBucket {
    tokens: f64,
    last_refill_ms: u64,
}

impl TokenBucket {
    fn new(capacity: f64, now_ms: u64) -> Self {
        Self {
            tokens: capacity,
            last_refill_ms: now_ms,
        }
    }

    fn refill(&mut self, rule: &RateLimitRule, now_ms: u64) {
        if now_ms <= self.last_refill_ms {
            return;
        }
        let capacity = rule.max_requests as f64;
        let elapsed = (now_ms - self.last_refill_ms) as f64;
        self.tokens = (self.tokens + elapsed * capacity / rule.window_ms as f64).min(capacity);
        self.last_refill_ms = now_ms;
    }

    fn check(&mut self, rule: &RateLimitRule, now_ms: u64) -> RateLimitDecision {
        self.refill(rule, now_ms);

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            return RateLimitDecision::allow(self.tokens.floor() as u32);
        }

        let deficit = 1.0 - self.tokens;
        let wait = deficit * rule.window_ms as f64 / rule.max_requests as f64;
        RateLimitDecision::deny(wait.ceil() as u64)
    }

    fn is_idle(&mut self, rule: &RateLimitRule, now_ms: u64) -> bool {
        self.refill(rule, now_ms);
        self.tokens >= rule.max_requests as f64
    }
}

#[derive(Debug)]
enum Counter {
    Window(SlidingWindow),
    Bucket(TokenBucket),
}

/// Everything tracked for one `(rule, key)` pair.
#[derive(Debug)]
pub(crate) struct KeyState {
    counter: Counter,
    blocked_until_ms: Option<u64>,
    /// Set when the key was pruned from its rule; the state is then orphaned
    /// and callers holding it must fetch the live entry again.
    retired: bool,
}

impl KeyState {
    pub(crate) fn new(rule: &RateLimitRule, now_ms: u64) -> Self {
        let counter = match rule.algorithm {
            RateLimitAlgorithm::SlidingWindow => Counter::Window(SlidingWindow::default()),
            RateLimitAlgorithm::TokenBucket => {
                Counter::Bucket(TokenBucket::new(rule.max_requests as f64, now_ms))
            }
        };
        Self {
            counter,
            blocked_until_ms: None,
            retired: false,
        }
    }

    pub(crate) fn is_retired(&self) -> bool {
        self.retired
    }

    /// Marks the state as removed from the key map. Call under the map's
    /// write lock.
    pub(crate) fn retire(&mut self) {
        self.retired = true;
    }

    /// Runs one admission check at `now_ms`.
    pub(crate) fn check(&mut self, rule: &RateLimitRule, now_ms: u64) -> RateLimitDecision {
        if let Some(until) = self.blocked_until_ms {
            if now_ms < until {
                return RateLimitDecision::deny(until - now_ms);
            }
            self.blocked_until_ms = None;
        }

        let decision = match &mut self.counter {
            Counter::Window(window) => window.check(rule, now_ms),
            Counter::Bucket(bucket) => bucket.check(rule, now_ms),
        };

        match (decision.allowed, rule.block_duration_ms) {
            (false, Some(block_ms)) if block_ms > 0 => {
                self.blocked_until_ms = Some(now_ms.saturating_add(block_ms));
                RateLimitDecision::deny(decision.retry_after_ms.max(block_ms))
            }
            _ => decision,
        }
    }

    /// True when the key holds no history that could affect a future check.
    pub(crate) fn is_idle(&mut self, rule: &RateLimitRule, now_ms: u64) -> bool {
        if self.blocked_until_ms.is_some_and(|until| now_ms < until) {
            return false;
        }
        match &mut self.counter {
            Counter::Window(window) => window.is_idle(rule.window_ms, now_ms),
            Counter::Bucket(bucket) => bucket.is_idle(rule, now_ms),
        }
    }
}
