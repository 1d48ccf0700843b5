//! Memory pressure detection.
//!
//! - **MemoryMonitor**: samples memory, applies backpressure, flags workers
//!   for recycling
//! - **MemoryProbe**: where readings come from (`sysinfo` for the live
//!   process, a scripted probe for tests)

pub mod monitor;
pub mod probe;
pub mod worker;

pub use monitor::{MemoryConfig, MemoryLimitStatus, MemoryMonitor};
pub use probe::{MemoryProbe, MemoryReading, MemorySample, ProcessMemoryProbe, ScriptedMemoryProbe};
pub use worker::{least_squares_slope, RecycleReason, WorkerMemoryStat};
