//! Test: Triggers - which events start a pipeline

use crate::helpers::*;
use ci_pipeline::{EventKind, ExecutionEvent, PipelineRunOutcome, RepositoryEvent};

const RELEASE: &str = r#"
name: release
triggers:
  push:
    branches: [master, "release/**"]
    tags: ["v*"]
  pull_request:
steps:
  - name: Build
    command: "true"
"#;

#[tokio::test]
async fn test_matching_events_start_the_pipeline() {
    let harness = TestHarness::new();

    for event in [
        push("master"),
        push("release/1.2/hotfix"),
        RepositoryEvent::new(EventKind::Push, "refs/tags/v1.0.0"),
        pull_request("feature/login"),
    ] {
        let outcome = harness.run(RELEASE, &event).await;
        assert!(
            matches!(outcome, PipelineRunOutcome::Completed(_)),
            "{:?} should trigger",
            event
        );
    }
    assert_eq!(harness.provisioner.provisioned(), 4);
}

#[tokio::test]
async fn test_other_events_skip_the_pipeline() {
    let harness = TestHarness::new();

    for event in [
        push("develop"),
        RepositoryEvent::new(EventKind::Push, "refs/tags/nightly"),
    ] {
        let outcome = harness.run(RELEASE, &event).await;
        assert!(matches!(outcome, PipelineRunOutcome::Skipped), "{:?} should not trigger", event);
        assert!(outcome.is_success());
    }

    let skipped = harness
        .events()
        .iter()
        .filter(|e| matches!(e, ExecutionEvent::PipelineSkipped { .. }))
        .count();
    assert_eq!(skipped, 2);
    assert_eq!(harness.provisioner.provisioned(), 0);
}

/// Without triggers a pipeline never runs
#[tokio::test]
async fn test_pipeline_without_triggers_never_runs() {
    let yaml = r#"
name: manual
steps:
  - name: Build
    command: "true"
"#;

    let harness = TestHarness::new();
    assert!(matches!(harness.run(yaml, &push("master")).await, PipelineRunOutcome::Skipped));
    assert!(matches!(
        harness.run(yaml, &pull_request("master")).await,
        PipelineRunOutcome::Skipped
    ));
}
