//! Test: Provisioning - real workspaces, toolchain roots and service containers

#![cfg(unix)]

use crate::helpers::*;
use async_trait::async_trait;
use ci_pipeline::core::context::StaticSecretStore;
use ci_pipeline::core::ServiceSpec;
use ci_pipeline::environment::{ServiceEndpoint, ServiceRuntime};
use ci_pipeline::execution::ProcessActionRunner;
use ci_pipeline::{ExecutionEngine, ExecutionEvent, JobStatus, LocalProvisioner, ProvisionError, ReportingForwarder};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// Service runtime that hands out fake endpoints and tracks live containers
#[derive(Default)]
struct FakeContainers {
    live: Mutex<Vec<String>>,
    started: Mutex<Vec<String>>,
}

#[async_trait]
impl ServiceRuntime for FakeContainers {
    async fn start(&self, service: &ServiceSpec, container_name: &str) -> Result<(String, ServiceEndpoint), ProvisionError> {
        if service.image_ref().ends_with(":broken") {
            return Err(ProvisionError::Service {
                name: service.name.clone(),
                reason: "image not found".to_string(),
            });
        }
        self.live.lock().unwrap().push(container_name.to_string());
        self.started.lock().unwrap().push(service.image_ref());
        Ok((
            container_name.to_string(),
            ServiceEndpoint {
                host: "127.0.0.1".to_string(),
                port: 40000 + service.port % 1000,
            },
        ))
    }

    async fn stop(&self, container_id: &str) {
        self.live.lock().unwrap().retain(|c| c != container_id);
    }
}

/// Toolchain root with `python/<version>/bin/python` scripts
fn toolchain_root(versions: &[&str]) -> PathBuf {
    let root = scratch_dir(&format!("toolchains-{}", uuid::Uuid::new_v4()));
    for version in versions {
        let bin = root.join("python").join(version).join("bin");
        std::fs::create_dir_all(&bin).unwrap();
        write_executable(&bin.join("python"), &format!("#!/bin/sh\necho \"Python {}\"\n", version));
    }
    root
}

fn write_executable(path: &Path, content: &str) {
    use std::os::unix::fs::PermissionsExt;
    std::fs::write(path, content).unwrap();
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).unwrap();
}

struct LocalSetup {
    engine: ExecutionEngine,
    containers: Arc<FakeContainers>,
    work_root: PathBuf,
    workspaces: Arc<Mutex<Vec<PathBuf>>>,
}

fn local_setup(runtime_root: &Path) -> LocalSetup {
    let work_root = scratch_dir(&format!("work-{}", uuid::Uuid::new_v4()));
    let containers = Arc::new(FakeContainers::default());
    let provisioner = LocalProvisioner::new(&work_root)
        .with_runtime_root(runtime_root)
        .with_service_runtime(containers.clone());

    let workspaces = Arc::new(Mutex::new(Vec::new()));
    let seen = workspaces.clone();
    let engine = ExecutionEngine::new(
        Arc::new(provisioner),
        Arc::new(ProcessActionRunner::default()),
        ReportingForwarder::new(),
        Arc::new(StaticSecretStore::new()),
    )
    .with_event_handler(move |event| {
        if let ExecutionEvent::JobProvisioned { workspace, .. } = event {
            seen.lock().unwrap().push(workspace);
        }
    });

    LocalSetup {
        engine,
        containers,
        work_root,
        workspaces,
    }
}

const INTEGRATION: &str = r#"
name: integration
triggers: [push]
strategy:
  fail_fast: false
runtime:
  kind: python
  version: "{{ matrix.python }}"
services:
  - name: postgres
    image: postgres
    version: "{{ matrix.pg }}"
    port: 5432
matrix:
  axes:
    python: ["3.8", "3.9"]
    pg: ["15"]
steps:
  - name: Interpreter
    command: test "$(python)" = "Python $MATRIX_PYTHON"
  - name: Database
    command: test "$POSTGRES_HOST" = 127.0.0.1 && test -n "$POSTGRES_PORT"
  - name: Workspace
    command: touch marker && test -f "$CI_WORKSPACE/marker" && test "$CI_REF" = refs/heads/master
"#;

/// Jobs get the requested toolchain and services, and everything is torn down
#[tokio::test]
async fn test_local_provisioning_end_to_end() {
    let root = toolchain_root(&["3.8", "3.9"]);
    let setup = local_setup(&root);

    let outcome = setup
        .engine
        .execute(&pipeline(INTEGRATION), &push("master"))
        .await
        .unwrap();
    let result = outcome.result().unwrap();

    for job in &result.jobs {
        assert_eq!(job.status, JobStatus::Success, "{}: {:?}", job.name, job.steps);
    }
    assert_eq!(
        *setup.containers.started.lock().unwrap(),
        vec!["postgres:15".to_string(), "postgres:15".to_string()]
    );
    assert!(setup.containers.live.lock().unwrap().is_empty());

    let workspaces = setup.workspaces.lock().unwrap().clone();
    assert_eq!(workspaces.len(), 2);
    assert_ne!(workspaces[0], workspaces[1]);
    for workspace in workspaces {
        assert!(workspace.starts_with(&setup.work_root));
        assert!(!workspace.exists(), "{} was not removed", workspace.display());
    }

    let _ = std::fs::remove_dir_all(&root);
    let _ = std::fs::remove_dir_all(&setup.work_root);
}

/// A missing toolchain version fails only that job
#[tokio::test]
async fn test_missing_runtime_version() {
    let root = toolchain_root(&["3.9"]);
    let setup = local_setup(&root);

    let outcome = setup
        .engine
        .execute(&pipeline(INTEGRATION), &push("master"))
        .await
        .unwrap();
    let result = outcome.result().unwrap();

    let missing = result.job("integration (3.8, 15)").unwrap();
    assert_eq!(missing.status, JobStatus::Failure);
    assert!(missing.provision_error.as_deref().unwrap().contains("python 3.8"));
    assert_job_status(result, "integration (3.9, 15)", JobStatus::Success);
    assert!(setup.containers.live.lock().unwrap().is_empty());

    let _ = std::fs::remove_dir_all(&root);
    let _ = std::fs::remove_dir_all(&setup.work_root);
}

/// A service that fails to start rolls back the partial environment
#[tokio::test]
async fn test_service_failure_rolls_back() {
    let root = toolchain_root(&["3.8", "3.9"]);
    let setup = local_setup(&root);
    let yaml = INTEGRATION.replace(r#"pg: ["15"]"#, r#"pg: ["broken"]"#);

    let outcome = setup
        .engine
        .execute(&pipeline(&yaml), &push("master"))
        .await
        .unwrap();
    let result = outcome.result().unwrap();

    for job in &result.jobs {
        assert_eq!(job.status, JobStatus::Failure);
        assert!(job.provision_error.as_deref().unwrap().contains("image not found"));
    }
    assert!(setup.workspaces.lock().unwrap().is_empty());
    assert!(setup.containers.live.lock().unwrap().is_empty());

    let _ = std::fs::remove_dir_all(&root);
    let _ = std::fs::remove_dir_all(&setup.work_root);
}
