//! CLI command definitions for queue-governor.
//!
//! `run` drives the monitoring loops against a Redis queue backend until
//! interrupted; `status` polls once and prints the health report;
//! `check-config` validates a configuration file.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use serde::Serialize;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

use crate::backend::{QueueBackend, RedisQueueBackend};
use crate::config::GovernorConfig;
use crate::governor::Governor;
use crate::memory::ProcessMemoryProbe;
use crate::metrics::{export_metrics, init_metrics};
use crate::scaling::ScalingDecision;

/// Redis URL used when neither the config nor the environment sets one.
const DEFAULT_REDIS_URL: &str = "redis://127.0.0.1:6379";

/// Time allowed for each background loop to stop on shutdown.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Scaling and resource control for background job queues.
#[derive(Parser)]
#[command(name = "queue-governor")]
#[command(about = "Monitor job queues, decide worker scaling and guard memory")]
#[command(version)]
#[command(
    long_about = "queue-governor polls queue depth and latency, raises deduplicated alerts and publishes worker scaling decisions.\n\nExample usage:\n  queue-governor run --config governor.yaml --redis-url redis://localhost:6379"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Run the monitoring and memory sampling loops until interrupted.
    Run(RunArgs),

    /// Poll every configured queue once and print the health report.
    Status(StatusArgs),

    /// Validate a configuration file and print what it configures.
    #[command(alias = "check")]
    CheckConfig(CheckConfigArgs),
}

/// Arguments for `queue-governor run`.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// YAML configuration file. Defaults plus GOVERNOR_* variables when absent.
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Redis URL of the queue backend.
    #[arg(long, env = "GOVERNOR_REDIS_URL")]
    pub redis_url: Option<String>,

    /// Print the Prometheus exposition on shutdown.
    #[arg(long, default_value = "false")]
    pub dump_metrics: bool,
}

/// Arguments for `queue-governor status`.
#[derive(Parser, Debug)]
pub struct StatusArgs {
    /// YAML configuration file.
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Redis URL of the queue backend.
    #[arg(long, env = "GOVERNOR_REDIS_URL")]
    pub redis_url: Option<String>,

    /// Output the full report as JSON.
    #[arg(short, long, default_value = "false")]
    pub json: bool,
}

/// Arguments for `queue-governor check-config`.
#[derive(Parser, Debug)]
pub struct CheckConfigArgs {
    /// YAML configuration file.
    #[arg(short, long)]
    pub config: PathBuf,

    /// Output the parsed configuration as JSON.
    #[arg(short, long, default_value = "false")]
    pub json: bool,
}

/// Parse CLI arguments.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
///
/// For more control over logging initialization, use `parse_cli()` and `run_with_cli()`.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Run(args) => run_governor_command(args).await,
        Commands::Status(args) => run_status_command(args).await,
        Commands::CheckConfig(args) => run_check_config_command(args),
    }
}

// ============================================================================
// Shared setup
// ============================================================================

/// Loads the config and connects the Redis backend.
async fn build_governor(
    config_path: Option<&Path>,
    redis_url: Option<String>,
) -> anyhow::Result<Governor> {
    let config = GovernorConfig::load(config_path)?;

    let redis_url = redis_url
        .or_else(|| config.monitor.redis_url.clone())
        .unwrap_or_else(|| DEFAULT_REDIS_URL.to_string());
    info!(redis_url = %redis_url, queues = config.queues.len(), "Connecting queue backend");

    let backend: Arc<dyn QueueBackend> = Arc::new(RedisQueueBackend::connect(&redis_url).await?);
    let governor = config.build(backend, Arc::new(ProcessMemoryProbe::new()))?;
    Ok(governor)
}

// ============================================================================
// run
// ============================================================================

async fn run_governor_command(args: RunArgs) -> anyhow::Result<()> {
    if let Err(e) = init_metrics() {
        warn!(error = %e, "Metrics registration failed, continuing without metrics");
    }

    let governor = build_governor(args.config.as_deref(), args.redis_url).await?;
    if governor.monitor().queue_names().is_empty() {
        warn!("No queues configured; only memory sampling will do any work");
    }

    let decisions = governor.monitor().subscribe_decisions();
    let logger = tokio::spawn(log_decisions(decisions));

    let handle = governor.start().await?;
    info!("Press Ctrl+C to stop");

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested");

    let stopped = handle.shutdown(SHUTDOWN_TIMEOUT).await;
    logger.abort();

    let summary = governor.monitor().get_dashboard_summary();
    println!("{}", serde_json::to_string_pretty(&summary)?);
    if args.dump_metrics {
        println!("{}", export_metrics());
    }

    stopped?;
    Ok(())
}

/// Logs decisions that change the worker count.
async fn log_decisions(mut decisions: tokio::sync::broadcast::Receiver<ScalingDecision>) {
    loop {
        match decisions.recv().await {
            Ok(decision) if decision.is_change() => {
                info!(
                    queue = %decision.queue_name,
                    action = decision.action.as_str(),
                    current_workers = decision.current_workers,
                    target_workers = decision.target_workers,
                    reason = %decision.reason,
                    "Scaling decision"
                );
            }
            Ok(_) => {}
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "Decision logger lagged behind");
            }
            Err(RecvError::Closed) => break,
        }
    }
}

// ============================================================================
// status
// ============================================================================

async fn run_status_command(args: StatusArgs) -> anyhow::Result<()> {
    let governor = build_governor(args.config.as_deref(), args.redis_url).await?;

    governor.memory().sample();
    let poll = governor.monitor().poll_once().await;
    let report = governor.monitor().health_report();

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("\n=== Queue Governor Status ===");
    println!("Healthy:        {}", report.healthy);
    println!("Queues polled:  {}", poll.polled);
    println!("Fetch faults:   {}", poll.faults);
    if let Some(memory) = &report.memory {
        println!(
            "Memory:         {:.1}MB / {:.1}MB ({:.1}%)",
            memory.used_mb, memory.max_heap_mb, memory.usage_percent
        );
    }
    println!();

    for queue in &report.queues {
        println!(
            "  {:<24} {:<8} depth={:<8} latency={}ms error_rate={:.3}",
            queue.queue_name,
            queue.status.as_str(),
            queue.depth,
            queue.latency_ms,
            queue.error_rate
        );
        for issue in &queue.issues {
            println!("    {issue}");
        }
    }

    for decision in poll.decisions.iter().filter(|d| d.is_change()) {
        println!(
            "  -> {} {} {} -> {} ({})",
            decision.queue_name,
            decision.action,
            decision.current_workers,
            decision.target_workers,
            decision.reason
        );
    }

    Ok(())
}

// ============================================================================
// check-config
// ============================================================================

#[derive(Debug, Serialize)]
struct ConfigSummary {
    status: String,
    queues: Vec<String>,
    rate_limits: Vec<String>,
    timeouts: Vec<String>,
    poll_interval_ms: u64,
    max_heap_mb: f64,
}

fn run_check_config_command(args: CheckConfigArgs) -> anyhow::Result<()> {
    let config = GovernorConfig::load(Some(&args.config))?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&config)?);
        return Ok(());
    }

    let summary = ConfigSummary {
        status: "valid".to_string(),
        queues: config
            .queues
            .iter()
            .map(|q| q.policy.queue_name.clone())
            .collect(),
        rate_limits: config.rate_limits.iter().map(|r| r.name.clone()).collect(),
        timeouts: config.timeouts.iter().map(|t| t.job_type.clone()).collect(),
        poll_interval_ms: config.monitor.poll_interval_ms,
        max_heap_mb: config.memory.max_heap_mb,
    };
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_run_args() {
        let cli = Cli::try_parse_from([
            "queue-governor",
            "--log-level",
            "debug",
            "run",
            "--config",
            "governor.yaml",
            "--redis-url",
            "redis://cache:6379",
        ])
        .unwrap();

        assert_eq!(cli.log_level, "debug");
        match cli.command {
            Commands::Run(args) => {
                assert_eq!(args.config, Some(PathBuf::from("governor.yaml")));
                assert_eq!(args.redis_url.as_deref(), Some("redis://cache:6379"));
                assert!(!args.dump_metrics);
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn test_check_alias() {
        let cli = Cli::try_parse_from(["queue-governor", "check", "-c", "g.yaml"]).unwrap();
        assert!(matches!(cli.command, Commands::CheckConfig(_)));
    }

    #[test]
    fn test_check_config_requires_path() {
        assert!(Cli::try_parse_from(["queue-governor", "check-config"]).is_err());
    }

    #[test]
    fn test_check_config_command() {
        use std::io::Write;

        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "queues:\n  - queue_name: emails\n    min_workers: 1\n    max_workers: 4\n    scale_up: {{ depth: 100, latency_ms: 1000 }}\n    scale_down: {{ depth: 10, latency_ms: 100 }}"
        )
        .unwrap();

        let args = CheckConfigArgs {
            config: file.path().to_path_buf(),
            json: false,
        };
        assert!(run_check_config_command(args).is_ok());
    }
}
