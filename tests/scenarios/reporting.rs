//! Test: Reporting - per-sink forwarding, credentials and tolerance

use crate::helpers::*;
use ci_pipeline::core::{ReportOutcome, Tolerance};
use ci_pipeline::{JobStatus, RunStatus};
use std::sync::Arc;

const COVERAGE: &str = r#"
name: coverage
triggers: [push]
strategy:
  fail_fast: false
matrix:
  axes:
    python: ["3.8", "3.9"]
steps:
  - name: Test
    command: echo "<coverage python='{{ matrix.python }}'/>" > coverage.xml
reporting:
  - id: codecov
    artifact: coverage.xml
    format: cobertura
    credentials: CODECOV_TOKEN
  - id: codeclimate
    artifact: coverage.xml
    format: cobertura
    credentials: CC_TOKEN
    continue_on_error: true
"#;

/// Each job forwards its own artifact to every sink with the sink's credentials
#[tokio::test]
async fn test_artifacts_forwarded_per_job() {
    let codecov = Arc::new(MockSink::new());
    let codeclimate = Arc::new(MockSink::new());
    let harness = TestHarness::new()
        .with_sink("codecov", codecov.clone())
        .with_sink("codeclimate", codeclimate.clone())
        .with_secret("CODECOV_TOKEN", "cov-token")
        .with_secret("CC_TOKEN", "cc-token");

    let result = harness.run_triggered(COVERAGE, &push("master")).await;

    assert_eq!(result.status, RunStatus::Success);
    for job in &result.jobs {
        assert_eq!(job.report("codecov").unwrap().outcome, ReportOutcome::Sent);
        assert_eq!(job.report("codeclimate").unwrap().outcome, ReportOutcome::Sent);
    }

    let mut contents: Vec<String> = codecov.deliveries().into_iter().map(|d| d.content).collect();
    contents.sort();
    assert_eq!(contents.len(), 2);
    assert!(contents[0].contains("3.8"));
    assert!(contents[1].contains("3.9"));

    for delivery in codecov.deliveries() {
        assert_eq!(delivery.token.as_deref(), Some("cov-token"));
        assert_eq!(delivery.format, "cobertura");
        assert!(delivery.artifact.ends_with("coverage.xml"));
    }
    for delivery in codeclimate.deliveries() {
        assert_eq!(delivery.token.as_deref(), Some("cc-token"));
    }
}

/// A tolerated sink failure is recorded without failing the job
#[tokio::test]
async fn test_tolerated_sink_failure() {
    let harness = TestHarness::new()
        .with_sink("codecov", Arc::new(MockSink::new()))
        .with_sink("codeclimate", Arc::new(MockSink::rejecting()))
        .with_secret("CODECOV_TOKEN", "cov-token")
        .with_secret("CC_TOKEN", "cc-token");

    let result = harness.run_triggered(COVERAGE, &push("master")).await;

    assert_eq!(result.status, RunStatus::Success);
    let job = &result.jobs[0];
    assert_eq!(job.status, JobStatus::Success);
    assert!(matches!(
        job.report("codeclimate").unwrap().outcome,
        ReportOutcome::Failed { tolerance: Tolerance::Tolerated, .. }
    ));
    assert_eq!(job.tolerated_failures().len(), 1);
}

/// A strict sink failure fails the job; the other sink is still attempted
#[tokio::test]
async fn test_strict_sink_failure_fails_job() {
    let codeclimate = Arc::new(MockSink::new());
    let harness = TestHarness::new()
        .with_sink("codecov", Arc::new(MockSink::rejecting()))
        .with_sink("codeclimate", codeclimate.clone())
        .with_secret("CODECOV_TOKEN", "cov-token")
        .with_secret("CC_TOKEN", "cc-token");

    let result = harness.run_triggered(COVERAGE, &push("master")).await;

    assert_eq!(result.status, RunStatus::Failure);
    for job in &result.jobs {
        assert_eq!(job.status, JobStatus::Failure);
        assert!(matches!(
            job.report("codecov").unwrap().outcome,
            ReportOutcome::Failed { tolerance: Tolerance::Fatal, .. }
        ));
    }
    assert_eq!(codeclimate.deliveries().len(), 2);
    assert_eq!(harness.provisioner.released(), 2);
}

/// Missing credentials fail the sink before anything is sent
#[tokio::test]
async fn test_missing_credentials() {
    let codecov = Arc::new(MockSink::new());
    let harness = TestHarness::new()
        .with_sink("codecov", codecov.clone())
        .with_sink("codeclimate", Arc::new(MockSink::new()))
        .with_secret("CC_TOKEN", "cc-token");

    let result = harness.run_triggered(COVERAGE, &push("master")).await;

    assert_eq!(result.status, RunStatus::Failure);
    match &result.jobs[0].report("codecov").unwrap().outcome {
        ReportOutcome::Failed { error, tolerance } => {
            assert_eq!(*tolerance, Tolerance::Fatal);
            assert!(error.contains("CODECOV_TOKEN"));
        }
        other => panic!("Expected failure, got {:?}", other),
    }
    assert!(codecov.deliveries().is_empty());
}

/// An artifact the steps never produced is a sink failure
#[tokio::test]
async fn test_missing_artifact() {
    let yaml = r#"
name: lint
triggers: [push]
steps:
  - name: Lint
    command: "true"
reporting:
  - id: codeclimate
    artifact: gl-code-quality.json
    format: codeclimate
"#;

    let sink = Arc::new(MockSink::new());
    let harness = TestHarness::new().with_sink("codeclimate", sink.clone());
    let result = harness.run_triggered(yaml, &push("master")).await;

    let job = &result.jobs[0];
    assert_eq!(job.status, JobStatus::Failure);
    match &job.report("codeclimate").unwrap().outcome {
        ReportOutcome::Failed { error, .. } => assert!(error.contains("gl-code-quality.json")),
        other => panic!("Expected failure, got {:?}", other),
    }
    assert!(sink.deliveries().is_empty());
}

/// A sink with no registered implementation runs its declared command
#[tokio::test]
async fn test_command_sink_fallback() {
    let target = scratch_dir(&format!("uploaded-{}", uuid::Uuid::new_v4()));
    std::fs::create_dir_all(&target).unwrap();
    let uploaded = target.join("report.json");

    let yaml = format!(
        r#"
name: lint
triggers: [push]
steps:
  - name: Lint
    command: echo issues=0 > report.json
reporting:
  - id: custom
    artifact: report.json
    format: json
    command: cp "$REPORT_ARTIFACT" "{}" && test "$REPORT_FORMAT" = json
"#,
        uploaded.display()
    );

    let harness = TestHarness::new();
    let result = harness.run_triggered(&yaml, &push("master")).await;

    assert_eq!(result.jobs[0].report("custom").unwrap().outcome, ReportOutcome::Sent);
    let content = std::fs::read_to_string(&uploaded).unwrap();
    assert!(content.contains("issues"));
    let _ = std::fs::remove_dir_all(&target);
}

/// A sink with neither an implementation nor a command is unavailable
#[tokio::test]
async fn test_unknown_sink_is_unavailable() {
    let yaml = r#"
name: lint
triggers: [push]
steps:
  - name: Lint
    command: touch out.txt
reporting:
  - id: nowhere
    artifact: out.txt
    format: text
    continue_on_error: true
"#;

    let harness = TestHarness::new();
    let result = harness.run_triggered(yaml, &push("master")).await;

    let job = &result.jobs[0];
    assert_eq!(job.status, JobStatus::Success);
    match &job.report("nowhere").unwrap().outcome {
        ReportOutcome::Failed { error, tolerance } => {
            assert_eq!(*tolerance, Tolerance::Tolerated);
            assert!(error.contains("unavailable"));
        }
        other => panic!("Expected failure, got {:?}", other),
    }
}

/// A sink still sending when the job runs out of time fails the job
#[tokio::test]
async fn test_job_timeout_during_reporting_fails_job() {
    let yaml = r#"
name: coverage
triggers: [push]
timeout_secs: 1
steps:
  - name: Test
    command: echo "<coverage/>" > coverage.xml
reporting:
  - id: codeclimate
    artifact: coverage.xml
    format: cobertura
    continue_on_error: true
"#;

    let sink = Arc::new(MockSink::slow(std::time::Duration::from_secs(5)));
    let harness = TestHarness::new().with_sink("codeclimate", sink.clone());

    let started = std::time::Instant::now();
    let result = harness.run_triggered(yaml, &push("master")).await;

    assert!(started.elapsed() < std::time::Duration::from_secs(4));
    assert_eq!(result.status, RunStatus::Failure);
    assert_job_status(&result, "coverage", JobStatus::Failure);
    assert!(matches!(
        result.jobs[0].report("codeclimate").unwrap().outcome,
        ReportOutcome::Failed { tolerance: Tolerance::Fatal, .. }
    ));
    assert!(sink.deliveries().is_empty());
    assert_eq!(harness.provisioner.released(), 1);
}
