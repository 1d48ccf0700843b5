//! Outbound rate limiting.
//!
//! - **RateLimitRule**: named budget of `max_requests` per `window_ms`
//! - **RateLimiter**: per-key sliding window or token bucket admission
//!
//! # Example
//!
//! ```rust,ignore
//! use queue_governor::rate_limit::{RateLimiter, RateLimitRule};
//!
//! let limiter = RateLimiter::new();
//! limiter.register_rule(RateLimitRule::new("stripe", 100, 1_000))?;
//!
//! let decision = limiter.check_limit("stripe", "account-42")?;
//! if !decision.allowed {
//!     // reschedule the job for decision.retry_after_ms
//! }
//! ```

pub mod limiter;
pub mod rule;
pub mod window;

pub use limiter::{Admission, RateLimiter, RuleStats};
pub use rule::{RateLimitAlgorithm, RateLimitRule};
pub use window::RateLimitDecision;
