//! Per-worker memory bookkeeping and recycle detection.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use super::probe::MemorySample;

/// Why a worker should be restarted.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum RecycleReason {
    CriticalMemory { used_mb: f64, threshold_mb: f64 },
    SuspectedLeak { slope_mb_per_sample: f64 },
    JobCapReached { jobs_processed: u64, cap: u64 },
}

impl RecycleReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CriticalMemory { .. } => "critical_memory",
            Self::SuspectedLeak { .. } => "suspected_leak",
            Self::JobCapReached { .. } => "job_cap_reached",
        }
    }
}

/// Memory history of one worker.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkerMemoryStat {
    pub worker_id: String,
    pub job_type: String,
    pub expected_memory_mb: f64,
    pub samples: VecDeque<MemorySample>,
    pub jobs_processed: u64,
    pub recycle_reason: Option<RecycleReason>,
}

impl WorkerMemoryStat {
    pub fn new(worker_id: impl Into<String>, job_type: impl Into<String>, expected_memory_mb: f64) -> Self {
        Self {
            worker_id: worker_id.into(),
            job_type: job_type.into(),
            expected_memory_mb,
            samples: VecDeque::new(),
            jobs_processed: 0,
            recycle_reason: None,
        }
    }

    pub(crate) fn push_sample(&mut self, sample: MemorySample, capacity: usize) {
        if self.samples.len() >= capacity.max(1) {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }

    pub fn latest(&self) -> Option<&MemorySample> {
        self.samples.back()
    }

    /// Least-squares slope of `heap_used_mb` over the last `window` samples,
    /// or `None` with fewer than `window` samples.
    pub fn leak_slope(&self, window: usize) -> Option<f64> {
        if window < 2 || self.samples.len() < window {
            return None;
        }
        let values: Vec<f64> = self
            .samples
            .iter()
            .skip(self.samples.len() - window)
            .map(|s| s.heap_used_mb)
            .collect();
        Some(least_squares_slope(&values))
    }

    pub(crate) fn reset(&mut self) {
        self.samples.clear();
        self.jobs_processed = 0;
        self.recycle_reason = None;
    }
}

/// Slope of the best-fit line through `(i, values[i])`.
pub fn least_squares_slope(values: &[f64]) -> f64 {
    let n = values.len();
    if n < 2 {
        return 0.0;
    }

    let mean_x = (n - 1) as f64 / 2.0;
    let mean_y = values.iter().sum::<f64>() / n as f64;

    let (num, den) = values
        .iter()
        .enumerate()
        .fold((0.0, 0.0), |(num, den), (i, y)| {
            let dx = i as f64 - mean_x;
            (num + dx * (y - mean_y), den + dx * dx)
        });

    num / den
}
