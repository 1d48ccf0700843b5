//! End-to-end behaviour of the assembled governor.
//!
//! Time-dependent checks drive a `ManualClock` for wall-clock state and
//! paused tokio time for timers, so nothing here sleeps for real.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use queue_governor::backend::{InMemoryQueueBackend, QueueStats};
use queue_governor::clock::ManualClock;
use queue_governor::memory::{MemoryConfig, MemoryMonitor, RecycleReason, ScriptedMemoryProbe};
use queue_governor::monitor::{Alert, AlertSeverity, AlertType, HealthStatus};
use queue_governor::rate_limit::{Admission, RateLimitRule, RateLimiter};
use queue_governor::scaling::{ScalingAction, ScalingManager, ScalingPolicy, ScalingSnapshot, Thresholds};
use queue_governor::timeout::{ExecutionOutcome, ExecutionRecord, TimeoutConfig, TimeoutHandler, TimeoutSettings};
use queue_governor::{GovernorConfig, JobError, MonitorError};

const CONFIG: &str = r#"
monitor:
  poll_interval_ms: 1000
queues:
  - queue_name: emails
    min_workers: 2
    max_workers: 20
    scale_up: { depth: 100, latency_ms: 30000 }
    scale_down: { depth: 10, latency_ms: 1000 }
rate_limits:
  - name: sendgrid
    max_requests: 5
    window_ms: 1000
timeouts:
  - job_type: render
    base_timeout_ms: 1000
    adaptive: true
    floor_ms: 200
    ceiling_ms: 5000
memory:
  max_heap_mb: 1000
  sample_interval_ms: 500
"#;

struct Harness {
    backend: Arc<InMemoryQueueBackend>,
    clock: Arc<ManualClock>,
    governor: queue_governor::Governor,
}

fn harness(used_mb: f64) -> Harness {
    let backend = Arc::new(InMemoryQueueBackend::new());
    let clock = Arc::new(ManualClock::default());
    let governor = GovernorConfig::from_yaml_str(CONFIG)
        .unwrap()
        .build_with_clock(
            backend.clone(),
            Arc::new(ScriptedMemoryProbe::constant(used_mb)),
            clock.clone(),
        )
        .unwrap();

    Harness {
        backend,
        clock,
        governor,
    }
}

// ============================================================================
// Rate limiting
// ============================================================================

#[test]
fn test_rate_limit_denies_sixth_call_with_retry_hint() {
    let h = harness(100.0);
    let limiter = h.governor.rate_limiter();

    // Calls at 0, 50, 100, 150 and 200ms
    for i in 0..5 {
        if i > 0 {
            h.clock.advance_ms(50);
        }
        assert!(limiter.check_limit("sendgrid", "account-1").unwrap().allowed);
    }

    let denied = limiter.check_limit("sendgrid", "account-1").unwrap();
    assert!(!denied.allowed);
    assert_eq!(denied.retry_after_ms, 800);

    // Other keys have their own budget
    assert!(limiter.check_limit("sendgrid", "account-2").unwrap().allowed);

    h.clock.advance_ms(denied.retry_after_ms);
    assert!(limiter.check_limit("sendgrid", "account-1").unwrap().allowed);
}

#[tokio::test]
async fn test_denied_job_is_rescheduled() {
    let backend = InMemoryQueueBackend::new();
    let clock = Arc::new(ManualClock::default());
    let limiter = RateLimiter::with_clock(clock.clone());
    limiter
        .register_rule(RateLimitRule::new("stripe", 1, 1_000))
        .unwrap();

    let first = limiter
        .admit_or_reschedule("stripe", "acct", "payments", "job-1", &backend)
        .await
        .unwrap();
    assert!(matches!(first, Admission::Admitted { .. }));

    let second = limiter
        .admit_or_reschedule("stripe", "acct", "payments", "job-2", &backend)
        .await
        .unwrap();
    assert_eq!(second, Admission::Rescheduled { delay_ms: 1_000 });
    assert_eq!(
        backend.delayed_jobs("payments"),
        vec![("job-2".to_string(), 1_000)]
    );
}

// ============================================================================
// Timeouts
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_fast_job_succeeds_and_slow_job_times_out() {
    let handler = TimeoutHandler::new(TimeoutSettings::default());
    handler.configure(TimeoutConfig::new("email", 1_000)).unwrap();

    let ok: Result<&str, JobError<String>> = handler
        .execute("email", |_ctx| async {
            tokio::time::sleep(Duration::from_millis(300)).await;
            Ok("sent")
        })
        .await;
    assert_eq!(ok.unwrap(), "sent");
    let stats = handler.get_execution_stats("email").unwrap();
    assert_eq!(stats.count, 1);
    assert!((300..=310).contains(&stats.max_ms));

    let started = tokio::time::Instant::now();
    let slow: Result<(), JobError<String>> = handler
        .execute("email", |_ctx| async {
            tokio::time::sleep(Duration::from_secs(3_600)).await;
            Ok(())
        })
        .await;
    let elapsed = started.elapsed();

    match slow {
        Err(JobError::TimedOut { timeout_ms, .. }) => assert_eq!(timeout_ms, 1_000),
        other => panic!("expected timeout, got {:?}", other.map(|_| ())),
    }
    assert!(elapsed >= Duration::from_millis(1_000));
    assert!(elapsed < Duration::from_millis(1_100));

    let recent = handler.recent_executions("email", 1);
    assert_eq!(recent[0].outcome, ExecutionOutcome::Timeout);
}

#[test]
fn test_adaptive_timeout_converges_on_p95() {
    let h = harness(100.0);
    let timeouts = h.governor.timeouts();

    for _ in 0..100 {
        timeouts.record_execution(ExecutionRecord::new("render", 500, ExecutionOutcome::Success));
    }

    let effective = timeouts.effective_timeout("render");
    assert_eq!(effective, 750);
    assert!((200..=5_000).contains(&effective));
    assert_eq!(timeouts.get_execution_stats("render").unwrap().p95_ms, 500);
}

// ============================================================================
// Memory
// ============================================================================

#[tokio::test]
async fn test_backpressure_never_runs_work() {
    let h = harness(900.0);
    let invoked = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&invoked);

    // Critical threshold is 95% of 1000MB
    let result = h
        .governor
        .memory()
        .execute_with_memory_check("pdf-render", 100.0, async move {
            flag.store(true, Ordering::SeqCst);
        })
        .await;

    let err = result.unwrap_err();
    assert_eq!(err.threshold_mb, 950.0);
    assert_eq!(err.current_mb, 900.0);
    assert!(!invoked.load(Ordering::SeqCst));

    let accepted = h
        .governor
        .memory()
        .execute_with_memory_check("thumbnail", 10.0, async { 7 })
        .await;
    assert_eq!(accepted.unwrap(), 7);
    assert_eq!(h.governor.memory().worker_stats("thumbnail").unwrap().jobs_processed, 1);
}

#[test]
fn test_job_cap_flags_worker_for_recycle() {
    let config = MemoryConfig {
        max_jobs_per_worker: Some(2),
        ..MemoryConfig::default()
    };
    let memory = MemoryMonitor::new(config, Arc::new(ScriptedMemoryProbe::constant(100.0))).unwrap();
    memory.register_worker("w-1", "email", 20.0);

    assert!(memory.record_job_completed("w-1"));
    assert_eq!(memory.evaluate_recycle("w-1"), None);
    assert!(memory.record_job_completed("w-1"));
    assert!(matches!(
        memory.evaluate_recycle("w-1"),
        Some(RecycleReason::JobCapReached { jobs_processed: 2, cap: 2 })
    ));
    assert_eq!(memory.workers_needing_recycle().len(), 1);
    assert!(!memory.record_job_completed("ghost"));

    assert!(memory.clear_recycle("w-1"));
    assert!(memory.workers_needing_recycle().is_empty());
}

// ============================================================================
// Scaling
// ============================================================================

#[test]
fn test_scale_up_then_hold_within_cooldown() {
    let clock = Arc::new(ManualClock::default());
    let manager = ScalingManager::with_clock(clock.clone());
    manager
        .register_queue(ScalingPolicy::new(
            "emails",
            2,
            20,
            Thresholds::new(100, 30_000),
            Thresholds::new(10, 1_000),
        ))
        .unwrap();

    let snapshot = ScalingSnapshot::new(150, 500, 2);
    let up = manager.make_scaling_decision("emails", snapshot).unwrap();
    assert_eq!(up.action, ScalingAction::ScaleUp);
    assert!(up.target_workers > 2 && up.target_workers <= 20);

    clock.advance_ms(10_000);
    let held = manager.make_scaling_decision("emails", snapshot).unwrap();
    assert_eq!(held.action, ScalingAction::None);
    assert_eq!(held.target_workers, 2);

    let history = manager.get_scaling_history("emails", 10).unwrap();
    assert_eq!(history.len(), 2);
}

#[test]
fn test_scale_down_one_step_per_cooldown_to_minimum() {
    let clock = Arc::new(ManualClock::default());
    let manager = ScalingManager::with_clock(clock.clone());
    let policy = ScalingPolicy::new("reports", 2, 10, Thresholds::new(100, 30_000), Thresholds::new(10, 1_000));
    let cooldown = policy.scale_down_cooldown_ms;
    manager.register_queue(policy).unwrap();

    let mut workers = 5;
    let mut targets = Vec::new();
    for _ in 0..4 {
        let decision = manager
            .make_scaling_decision("reports", ScalingSnapshot::new(3, 200, workers))
            .unwrap();
        targets.push((decision.action, decision.target_workers));
        workers = decision.target_workers;
        clock.advance_ms(cooldown);
    }

    assert_eq!(
        targets,
        vec![
            (ScalingAction::ScaleDown, 4),
            (ScalingAction::ScaleDown, 3),
            (ScalingAction::ScaleDown, 2),
            (ScalingAction::None, 2),
        ]
    );
}

// ============================================================================
// Monitoring
// ============================================================================

#[tokio::test]
async fn test_consecutive_critical_polls_raise_one_alert() {
    let h = harness(100.0);
    let monitor = h.governor.monitor();
    let notified = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&notified);
    monitor.on_alert(Arc::new(move |_: &Alert| -> anyhow::Result<()> {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }));

    h.backend.set_stats("emails", QueueStats::new(400, 1_000));
    monitor.poll_once().await;
    h.clock.advance_ms(60_000);
    monitor.poll_once().await;

    let active = monitor.active_alerts();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].alert_type, AlertType::QueueDepth);
    assert_eq!(active[0].severity, AlertSeverity::Critical);
    assert_eq!(notified.load(Ordering::SeqCst), 1);

    let summary = monitor.get_dashboard_summary();
    assert_eq!(summary.critical, 1);
    assert_eq!(summary.active_alerts, 1);
    assert_eq!(
        monitor.latest_snapshot("emails").unwrap().status,
        HealthStatus::Critical
    );
}

#[tokio::test]
async fn test_poll_publishes_scaling_decision() {
    let h = harness(100.0);
    let monitor = h.governor.monitor();
    let mut decisions = monitor.subscribe_decisions();

    h.backend.set_stats("emails", QueueStats::new(150, 1_000));
    let summary = monitor.poll_once().await;

    assert_eq!(summary.decisions.len(), 1);
    let published = decisions.recv().await.unwrap();
    assert_eq!(published.action, ScalingAction::ScaleUp);
    assert_eq!(published, summary.decisions[0]);
}

#[tokio::test(start_paused = true)]
async fn test_governor_loops_start_and_stop() {
    let h = harness(100.0);
    h.backend.set_stats("emails", QueueStats::new(5, 100));

    let handle = h.governor.start().await.unwrap();
    assert!(h.governor.monitor().is_monitoring());
    assert!(matches!(
        h.governor.start().await,
        Err(MonitorError::AlreadyRunning)
    ));

    tokio::time::sleep(Duration::from_millis(2_500)).await;
    handle.shutdown(Duration::from_secs(1)).await.unwrap();

    assert_eq!(h.backend.fetch_count(), 3);
    assert!(!h.governor.monitor().is_monitoring());
    assert!(h.governor.memory().history().len() >= 5);

    let report = h.governor.monitor().health_report();
    assert!(report.healthy);
    assert_eq!(report.rate_limits.len(), 1);
    assert_eq!(report.job_types.len(), 1);
}
