//! Scale-up step sizing.

use super::policy::{ScalingPolicy, ScalingSnapshot};

/// Decides how many workers to add once the scale-up band is reached.
pub trait ScaleUpStrategy: Send + Sync {
    /// Workers to add. The manager caps the result at `max_workers` and
    /// treats zero as one.
    fn increment(&self, policy: &ScalingPolicy, snapshot: &ScalingSnapshot) -> u32;
}

/// Grows the fleet in proportion to the overshoot.
///
/// With `ratio = max(depth / up.depth, latency / up.latency)` the step is
/// `ceil((ratio - 1) * current)`, at least one. A queue at 150% of its
/// threshold grows by half its workers; at 300% it triples.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProportionalStrategy;

impl ScaleUpStrategy for ProportionalStrategy {
    fn increment(&self, policy: &ScalingPolicy, snapshot: &ScalingSnapshot) -> u32 {
        let depth_ratio = snapshot.depth as f64 / policy.scale_up.depth.max(1) as f64;
        let latency_ratio = snapshot.latency_ms as f64 / policy.scale_up.latency_ms.max(1) as f64;
        let ratio = depth_ratio.max(latency_ratio);

        let base = snapshot.current_workers.max(1) as f64;
        let step = ((ratio - 1.0) * base).ceil();

        if step.is_finite() && step >= 1.0 {
            step.min(u32::MAX as f64) as u32
        } else {
            1
        }
    }
}

/// Always adds the same number of workers.
#[derive(Debug, Clone, Copy)]
pub struct FixedStepStrategy(pub u32);

impl ScaleUpStrategy for FixedStepStrategy {
    fn increment(&self, _policy: &ScalingPolicy, _snapshot: &ScalingSnapshot) -> u32 {
        self.0.max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scaling::policy::Thresholds;

    fn policy() -> ScalingPolicy {
        ScalingPolicy::new("q", 1, 50, Thresholds::new(100, 10_000), Thresholds::new(5, 500))
    }

    #[test]
    fn test_proportional_step() {
        let s = ProportionalStrategy;
        assert_eq!(s.increment(&policy(), &ScalingSnapshot::new(150, 0, 2)), 1);
        assert_eq!(s.increment(&policy(), &ScalingSnapshot::new(150, 0, 10)), 5);
        assert_eq!(s.increment(&policy(), &ScalingSnapshot::new(300, 0, 4)), 8);
        // Latency overshoot dominates.
        assert_eq!(s.increment(&policy(), &ScalingSnapshot::new(100, 40_000, 2)), 6);
    }

    #[test]
    fn test_proportional_minimum_step() {
        let s = ProportionalStrategy;
        assert_eq!(s.increment(&policy(), &ScalingSnapshot::new(100, 0, 8)), 1);
        assert_eq!(s.increment(&policy(), &ScalingSnapshot::new(101, 0, 0)), 1);
    }

    #[test]
    fn test_fixed_step() {
        assert_eq!(FixedStepStrategy(3).increment(&policy(), &ScalingSnapshot::new(0, 0, 0)), 3);
        assert_eq!(FixedStepStrategy(0).increment(&policy(), &ScalingSnapshot::new(0, 0, 0)), 1);
    }
}
