//! Memory probes.

use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sysinfo::{Pid, System};
use tracing::warn;

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// One raw reading, in megabytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct MemoryReading {
    pub heap_used_mb: f64,
    pub heap_total_mb: f64,
    pub rss_mb: f64,
}

impl MemoryReading {
    /// Reading where every figure is `mb`.
    pub fn uniform(mb: f64) -> Self {
        Self {
            heap_used_mb: mb,
            heap_total_mb: mb,
            rss_mb: mb,
        }
    }
}

/// A timestamped reading.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MemorySample {
    pub timestamp: DateTime<Utc>,
    pub heap_used_mb: f64,
    pub heap_total_mb: f64,
    pub rss_mb: f64,
}

impl MemorySample {
    pub fn new(timestamp: DateTime<Utc>, reading: MemoryReading) -> Self {
        Self {
            timestamp,
            heap_used_mb: reading.heap_used_mb,
            heap_total_mb: reading.heap_total_mb,
            rss_mb: reading.rss_mb,
        }
    }
}

/// Source of memory readings.
pub trait MemoryProbe: Send + Sync {
    /// Takes a reading, or `None` if memory could not be read.
    fn read(&self) -> Option<MemoryReading>;
}

/// Reads the current process through `sysinfo`.
///
/// The process has no separate managed heap, so `heap_used_mb` is the
/// resident set and `heap_total_mb` the virtual size.
pub struct ProcessMemoryProbe {
    pid: Option<Pid>,
    system: Mutex<System>,
}

impl Default for ProcessMemoryProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessMemoryProbe {
    pub fn new() -> Self {
        let pid = match sysinfo::get_current_pid() {
            Ok(pid) => Some(pid),
            Err(e) => {
                warn!(error = e, "Could not resolve current pid, memory probe disabled");
                None
            }
        };

        Self {
            pid,
            system: Mutex::new(System::new()),
        }
    }
}

impl MemoryProbe for ProcessMemoryProbe {
    fn read(&self) -> Option<MemoryReading> {
        let pid = self.pid?;
        let mut system = self.system.lock().unwrap_or_else(PoisonError::into_inner);

        if !system.refresh_process(pid) {
            return None;
        }
        let process = system.process(pid)?;
        let rss_mb = process.memory() as f64 / BYTES_PER_MB;

        Some(MemoryReading {
            heap_used_mb: rss_mb,
            heap_total_mb: process.virtual_memory() as f64 / BYTES_PER_MB,
            rss_mb,
        })
    }
}

/// Probe replaying queued readings, for tests and dry runs.
///
/// Readings are served in order; the last one repeats once the queue runs
/// dry.
#[derive(Debug, Default)]
pub struct ScriptedMemoryProbe {
    readings: Mutex<VecDeque<MemoryReading>>,
    last: Mutex<Option<MemoryReading>>,
}

impl ScriptedMemoryProbe {
    /// Probe that always reads `mb`.
    pub fn constant(mb: f64) -> Self {
        let probe = Self::default();
        probe.set_used_mb(mb);
        probe
    }

    /// Probe that serves `used_mb` values in order.
    pub fn script(used_mb: impl IntoIterator<Item = f64>) -> Self {
        let probe = Self::default();
        probe.push_all(used_mb);
        probe
    }

    /// Replaces the script with a single repeating value.
    pub fn set_used_mb(&self, mb: f64) {
        self.readings
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        *self.last.lock().unwrap_or_else(PoisonError::into_inner) = Some(MemoryReading::uniform(mb));
    }

    pub fn push_all(&self, used_mb: impl IntoIterator<Item = f64>) {
        let mut readings = self.readings.lock().unwrap_or_else(PoisonError::into_inner);
        readings.extend(used_mb.into_iter().map(MemoryReading::uniform));
    }
}

impl MemoryProbe for ScriptedMemoryProbe {
    fn read(&self) -> Option<MemoryReading> {
        let next = self
            .readings
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front();

        let mut last = self.last.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(reading) = next {
            *last = Some(reading);
        }
        *last
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scripted_probe_repeats_last() {
        let probe = ScriptedMemoryProbe::script([100.0, 200.0]);
        assert_eq!(probe.read().unwrap().heap_used_mb, 100.0);
        assert_eq!(probe.read().unwrap().heap_used_mb, 200.0);
        assert_eq!(probe.read().unwrap().heap_used_mb, 200.0);

        probe.set_used_mb(50.0);
        assert_eq!(probe.read().unwrap().rss_mb, 50.0);
    }

    #[test]
    fn test_empty_script_reads_nothing() {
        assert!(ScriptedMemoryProbe::default().read().is_none());
    }

    #[test]
    fn test_process_probe_reads_own_memory() {
        let reading = ProcessMemoryProbe::new().read();
        if let Some(reading) = reading {
            assert!(reading.rss_mb > 0.0);
        }
    }
}
