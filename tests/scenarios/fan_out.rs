//! Test: Fan-out - fail-fast cancellation, scheduling limits and environment release

use crate::helpers::*;
use ci_pipeline::core::StepOutcome;
use ci_pipeline::{ExecutionEvent, JobStatus, RunStatus, SchedulingStrategy};
use std::time::{Duration, Instant};

const MIXED: &str = r#"
name: coverage
triggers: [push]
strategy:
  fail_fast: FAIL_FAST
matrix:
  axes:
    mode: [fail, slow]
steps:
  - name: Run
    command: if [ "$MATRIX_MODE" = fail ]; then exit 1; fi; sleep 30
  - name: After
    command: "true"
"#;

/// With fail-fast a failing job cancels its running sibling
#[tokio::test]
async fn test_fail_fast_cancels_running_sibling() {
    let yaml = MIXED.replace("FAIL_FAST", "true");
    let harness = TestHarness::new();

    let started = Instant::now();
    let result = harness.run_triggered(&yaml, &push("master")).await;

    assert!(started.elapsed() < Duration::from_secs(20), "sibling was not cancelled");
    assert_eq!(result.status, RunStatus::Failure);
    assert_job_status(&result, "coverage (fail)", JobStatus::Failure);
    assert_job_status(&result, "coverage (slow)", JobStatus::Cancelled);

    let slow = result.job("coverage (slow)").unwrap();
    assert!(slow.steps.iter().any(|s| s.outcome == StepOutcome::Cancelled));
    assert!(matches!(slow.step("After").unwrap().outcome, StepOutcome::Skipped { .. } | StepOutcome::Cancelled));

    // Every environment that was handed out came back exactly once
    assert_eq!(harness.provisioner.provisioned(), harness.provisioner.released());
}

/// Without fail-fast the sibling finishes on its own
#[tokio::test]
async fn test_without_fail_fast_siblings_complete() {
    let yaml = r#"
name: coverage
triggers: [push]
strategy:
  fail_fast: false
matrix:
  axes:
    mode: [fail, ok]
steps:
  - name: Run
    command: if [ "$MATRIX_MODE" = fail ]; then exit 1; fi; sleep 0.3
"#;

    let harness = TestHarness::new();
    let result = harness.run_triggered(yaml, &push("master")).await;

    assert_eq!(result.status, RunStatus::Failure);
    assert_job_status(&result, "coverage (fail)", JobStatus::Failure);
    assert_job_status(&result, "coverage (ok)", JobStatus::Success);
    assert_eq!(result.failed_jobs().len(), 1);
    assert_eq!(harness.provisioner.released(), 2);
}

/// Sequential fail-fast never starts the queued jobs
#[tokio::test]
async fn test_sequential_fail_fast_skips_queued_jobs() {
    let yaml = r#"
name: sequential
triggers: [push]
strategy:
  max_parallel: 1
matrix:
  axes:
    n: ["1", "2", "3"]
steps:
  - name: Run
    command: test "$MATRIX_N" != 1
"#;

    let harness = TestHarness::new();
    let result = harness.run_triggered(yaml, &push("master")).await;

    assert_job_status(&result, "sequential (1)", JobStatus::Failure);
    assert_job_status(&result, "sequential (2)", JobStatus::Cancelled);
    assert_job_status(&result, "sequential (3)", JobStatus::Cancelled);
    assert_eq!(harness.provisioner.provisioned(), 1);
    assert_eq!(harness.provisioner.released(), 1);
}

/// A concurrency limit bounds how many jobs hold an environment at once
#[tokio::test]
async fn test_limited_parallel_bounds_concurrency() {
    let yaml = r#"
name: limited
triggers: [push]
strategy:
  fail_fast: false
matrix:
  axes:
    n: ["1", "2", "3", "4"]
steps:
  - name: Run
    command: sleep 0.2
"#;

    let harness = TestHarness::new();
    let engine = harness
        .engine()
        .with_strategy(SchedulingStrategy::LimitedParallel(2));
    let outcome = engine.execute(&pipeline(yaml), &push("master")).await.unwrap();
    assert!(outcome.is_success());

    let mut running = 0usize;
    let mut peak = 0usize;
    for event in harness.events() {
        match event {
            ExecutionEvent::JobStarted { .. } => {
                running += 1;
                peak = peak.max(running);
            }
            ExecutionEvent::JobFinished { .. } => running = running.saturating_sub(1),
            _ => {}
        }
    }
    assert!(peak <= 2, "peak concurrency was {}", peak);
    assert_eq!(harness.provisioner.released(), 4);
}

/// Firing the shutdown token cancels every job of the run
#[tokio::test]
async fn test_shutdown_cancels_all_jobs() {
    let yaml = r#"
name: interrupted
triggers: [push]
strategy:
  fail_fast: false
matrix:
  axes:
    n: ["1", "2"]
steps:
  - name: Hang
    command: sleep 30
"#;

    let harness = TestHarness::new();
    let engine = harness.engine();
    let shutdown = engine.shutdown_token();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        shutdown.cancel();
    });

    let started = Instant::now();
    let outcome = engine.execute(&pipeline(yaml), &push("master")).await.unwrap();
    let result = outcome.result().unwrap();

    assert!(started.elapsed() < Duration::from_secs(20));
    assert_eq!(result.status, RunStatus::Failure);
    for job in &result.jobs {
        assert_eq!(job.status, JobStatus::Cancelled);
    }
    assert_eq!(harness.provisioner.provisioned(), harness.provisioner.released());
}

/// A failing provisioner fails only the affected job
#[tokio::test]
async fn test_provision_failure_is_per_job() {
    let yaml = r#"
name: runtimes
triggers: [push]
strategy:
  fail_fast: false
matrix:
  axes:
    python: ["2.7", "3.9"]
steps:
  - name: Run
    command: "true"
"#;

    let harness = TestHarness::with_provisioner(MockProvisioner::failing_for("2.7"));
    let result = harness.run_triggered(yaml, &push("master")).await;

    let broken = result.job("runtimes (2.7)").unwrap();
    assert_eq!(broken.status, JobStatus::Failure);
    assert!(broken.provision_error.as_deref().unwrap().contains("not installed"));
    assert!(matches!(broken.steps[0].outcome, StepOutcome::Skipped { .. }));
    assert_job_status(&result, "runtimes (3.9)", JobStatus::Success);
    assert_eq!(harness.provisioner.released_jobs(), vec!["runtimes (3.9)"]);
}

/// The environment comes back even when the job task dies mid-run
#[tokio::test]
async fn test_release_after_job_task_panics() {
    let yaml = r#"
name: build
triggers: [push]
steps:
  - name: Build
    command: "true"
"#;

    let harness = TestHarness::new();
    let engine = harness.engine().with_event_handler(|event| {
        if let ExecutionEvent::StepStarted { .. } = event {
            panic!("event handler failed");
        }
    });

    let outcome = engine.execute(&pipeline(yaml), &push("master")).await.unwrap();
    let result = outcome.result().unwrap();

    assert_eq!(result.status, RunStatus::Failure);
    assert_job_status(result, "build", JobStatus::Failure);
    assert_eq!(harness.provisioner.provisioned(), 1);
    assert_eq!(harness.provisioner.released(), 1);
    assert_eq!(harness.provisioner.released_jobs(), vec!["build".to_string()]);
}
