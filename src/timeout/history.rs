//! Execution records and latency statistics.
//!
//! Records live in a fixed-capacity ring per job type. Statistics are always
//! computed from a sorted copy of the durations, never from the live ring.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// How a job run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionOutcome {
    Success,
    Timeout,
    Error,
}

impl ExecutionOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Timeout => "timeout",
            Self::Error => "error",
        }
    }
}

/// One finished job run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub job_type: String,
    pub duration_ms: u64,
    pub timestamp: DateTime<Utc>,
    pub outcome: ExecutionOutcome,
}

impl ExecutionRecord {
    pub fn new(job_type: impl Into<String>, duration_ms: u64, outcome: ExecutionOutcome) -> Self {
        Self {
            job_type: job_type.into(),
            duration_ms,
            timestamp: Utc::now(),
            outcome,
        }
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }
}

/// Latency summary for a job type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ExecutionStats {
    pub count: usize,
    pub avg_ms: f64,
    pub p50_ms: u64,
    pub p95_ms: u64,
    pub p99_ms: u64,
    pub max_ms: u64,
    pub timeouts: usize,
    pub errors: usize,
}

impl ExecutionStats {
    /// Builds statistics from an unsorted copy of the durations.
    pub fn from_durations(mut durations: Vec<u64>, timeouts: usize, errors: usize) -> Self {
        if durations.is_empty() {
            return Self {
                timeouts,
                errors,
                ..Default::default()
            };
        }

        durations.sort_unstable();
        let sum: u64 = durations.iter().sum();

        Self {
            count: durations.len(),
            avg_ms: sum as f64 / durations.len() as f64,
            p50_ms: percentile(&durations, 50.0),
            p95_ms: percentile(&durations, 95.0),
            p99_ms: percentile(&durations, 99.0),
            max_ms: durations[durations.len() - 1],
            timeouts,
            errors,
        }
    }
}

/// Nearest-rank percentile of an ascending slice. Returns 0 for an empty slice.
pub fn percentile(sorted: &[u64], pct: f64) -> u64 {
    if sorted.is_empty() {
        return 0;
    }
    let rank = ((pct / 100.0) * sorted.len() as f64).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}

/// Bounded ring of execution records, oldest first.
#[derive(Debug)]
pub struct ExecutionHistory {
    records: VecDeque<ExecutionRecord>,
    capacity: usize,
    total_recorded: u64,
}

impl ExecutionHistory {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            records: VecDeque::with_capacity(capacity),
            capacity,
            total_recorded: 0,
        }
    }

    /// Appends a record, evicting the oldest when full.
    pub fn push(&mut self, record: ExecutionRecord) {
        if self.records.len() == self.capacity {
            self.records.pop_front();
        }
        self.records.push_back(record);
        self.total_recorded += 1;
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Records ever pushed, including evicted ones.
    pub fn total_recorded(&self) -> u64 {
        self.total_recorded
    }

    /// Copies out what statistics need so the caller can release its lock
    /// before sorting.
    pub fn snapshot(&self) -> (Vec<u64>, usize, usize) {
        let durations = self.records.iter().map(|r| r.duration_ms).collect();
        let timeouts = self
            .records
            .iter()
            .filter(|r| r.outcome == ExecutionOutcome::Timeout)
            .count();
        let errors = self
            .records
            .iter()
            .filter(|r| r.outcome == ExecutionOutcome::Error)
            .count();
        (durations, timeouts, errors)
    }

    pub fn recent(&self, limit: usize) -> Vec<ExecutionRecord> {
        let skip = self.records.len().saturating_sub(limit);
        self.records.iter().skip(skip).cloned().collect()
    }
}
