//! Worker scaling decisions.
//!
//! The [`ScalingManager`] only decides. Decisions are published to an
//! external orchestrator, which talks to the actual infrastructure.

pub mod manager;
pub mod policy;
pub mod strategy;

pub use manager::{ScalingManager, DEFAULT_HISTORY_CAPACITY};
pub use policy::{ScalingAction, ScalingDecision, ScalingPolicy, ScalingSnapshot, Thresholds};
pub use strategy::{FixedStepStrategy, ProportionalStrategy, ScaleUpStrategy};
