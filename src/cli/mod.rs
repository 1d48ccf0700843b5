//! Command-line interface for queue-governor.
//!
//! Provides commands for running the monitoring loops, one-off status
//! checks and configuration validation.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli, Commands};
