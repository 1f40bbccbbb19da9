//! Test utility functions for ci-pipeline

#![allow(dead_code)]

use async_trait::async_trait;
use ci_pipeline::core::config::PipelineConfig;
use ci_pipeline::core::context::{Secret, StaticSecretStore};
use ci_pipeline::environment::{ProvisionRequest, ProvisionedEnvironment, ServiceEndpoint};
use ci_pipeline::execution::{ActionInvocation, ActionRunner, ProcessActionRunner, StepError};
use ci_pipeline::reporting::ReportRequest;
use ci_pipeline::{
    EventKind, ExecutionEngine, ExecutionEvent, Pipeline, PipelineRunOutcome, ProvisionError, Provisioner,
    ReportingForwarder, ReportingSink, RepositoryEvent, SinkError,
};
use ci_pipeline::core::PipelineRunResult;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Provisioner handing out scratch directories and counting lifecycle calls
#[derive(Default)]
pub struct MockProvisioner {
    pub provisioned: AtomicUsize,
    pub released: AtomicUsize,
    /// Job names that were released, in release order
    pub release_log: Mutex<Vec<String>>,
    /// Fail provisioning for jobs whose name contains this text
    fail_for: Option<String>,
    /// Services to fake for every job
    services: Vec<(String, u16)>,
}

impl MockProvisioner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_for(job: &str) -> Self {
        Self {
            fail_for: Some(job.to_string()),
            ..Self::default()
        }
    }

    pub fn with_service(mut self, name: &str, port: u16) -> Self {
        self.services.push((name.to_string(), port));
        self
    }

    pub fn provisioned(&self) -> usize {
        self.provisioned.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }

    pub fn released_jobs(&self) -> Vec<String> {
        self.release_log.lock().unwrap().clone()
    }
}

#[async_trait]
impl Provisioner for MockProvisioner {
    async fn provision(&self, request: &ProvisionRequest) -> Result<ProvisionedEnvironment, ProvisionError> {
        if let Some(pattern) = &self.fail_for {
            if request.job_name.contains(pattern.as_str()) {
                return Err(ProvisionError::Runtime {
                    kind: "python".to_string(),
                    version: "0.0".to_string(),
                    reason: "not installed".to_string(),
                });
            }
        }

        let workspace = scratch_dir(&format!("{}-{}", request.execution_id, request.job_slug));
        std::fs::create_dir_all(&workspace).map_err(|source| ProvisionError::Workspace {
            path: workspace.clone(),
            source,
        })?;

        let mut env = ProvisionedEnvironment::new(workspace);
        env.set_env("CI_JOB", request.job_name.clone());
        for (name, port) in &self.services {
            env.add_service(
                name,
                ServiceEndpoint {
                    host: "127.0.0.1".to_string(),
                    port: *port,
                },
            );
        }
        self.provisioned.fetch_add(1, Ordering::SeqCst);
        Ok(env)
    }

    async fn release(&self, environment: &ProvisionedEnvironment) {
        let _ = std::fs::remove_dir_all(&environment.workspace);
        self.released.fetch_add(1, Ordering::SeqCst);
        let job = environment.env.get("CI_JOB").cloned().unwrap_or_default();
        self.release_log.lock().unwrap().push(job);
    }
}

/// Action runner recording invocations; actions named in `failing` fail
#[derive(Default)]
pub struct MockActionRunner {
    pub invocations: Mutex<Vec<ActionInvocation>>,
    failing: Vec<String>,
}

impl MockActionRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing(names: &[&str]) -> Self {
        Self {
            failing: names.iter().map(|n| n.to_string()).collect(),
            ..Self::default()
        }
    }

    pub fn invocations(&self) -> Vec<ActionInvocation> {
        self.invocations.lock().unwrap().clone()
    }
}

#[async_trait]
impl ActionRunner for MockActionRunner {
    async fn run(&self, invocation: &ActionInvocation) -> Result<String, StepError> {
        self.invocations.lock().unwrap().push(invocation.clone());
        if self.failing.contains(&invocation.name) {
            return Err(StepError::Action {
                action: invocation.reference(),
                reason: "mock failure".to_string(),
            });
        }
        Ok(format!("ran {}", invocation.reference()))
    }
}

/// What a sink was asked to deliver
#[derive(Debug, Clone)]
pub struct Delivery {
    pub sink_id: String,
    pub artifact: PathBuf,
    pub format: String,
    pub content: String,
    pub token: Option<String>,
}

/// Sink recording every delivery; optionally rejects them all or stalls
#[derive(Default)]
pub struct MockSink {
    pub deliveries: Mutex<Vec<Delivery>>,
    reject: bool,
    delay: Option<Duration>,
}

impl MockSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rejecting() -> Self {
        Self {
            reject: true,
            ..Self::default()
        }
    }

    /// Sink that takes `delay` before accepting anything
    pub fn slow(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    pub fn deliveries(&self) -> Vec<Delivery> {
        self.deliveries.lock().unwrap().clone()
    }
}

#[async_trait]
impl ReportingSink for MockSink {
    async fn send(&self, request: &ReportRequest, credentials: Option<&Secret>) -> Result<(), SinkError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let content = std::fs::read_to_string(&request.artifact).unwrap_or_default();
        self.deliveries.lock().unwrap().push(Delivery {
            sink_id: request.sink_id.clone(),
            artifact: request.artifact.clone(),
            format: request.format.clone(),
            content,
            token: credentials.map(|s| s.expose().to_string()),
        });
        if self.reject {
            return Err(SinkError::Rejected("upload refused".to_string()));
        }
        Ok(())
    }
}

/// Unique directory under the system temp dir
pub fn scratch_dir(name: &str) -> PathBuf {
    std::env::temp_dir().join("ci-pipeline-tests").join(name)
}

/// Parse a pipeline from YAML
pub fn pipeline(yaml: &str) -> Pipeline {
    PipelineConfig::from_yaml(yaml)
        .expect("valid pipeline YAML")
        .to_pipeline()
        .expect("pipeline builds")
}

pub fn push(branch: &str) -> RepositoryEvent {
    RepositoryEvent::new(EventKind::Push, format!("refs/heads/{}", branch))
}

pub fn pull_request(branch: &str) -> RepositoryEvent {
    RepositoryEvent::new(EventKind::PullRequest, format!("refs/heads/{}", branch))
}

/// Engine wiring used by the scenarios
pub struct TestHarness {
    pub provisioner: Arc<MockProvisioner>,
    pub actions: Arc<dyn ActionRunner>,
    pub forwarder: ReportingForwarder,
    pub secrets: StaticSecretStore,
    pub events: Arc<Mutex<Vec<ExecutionEvent>>>,
}

impl TestHarness {
    pub fn new() -> Self {
        Self::with_provisioner(MockProvisioner::new())
    }

    pub fn with_provisioner(provisioner: MockProvisioner) -> Self {
        Self {
            provisioner: Arc::new(provisioner),
            actions: Arc::new(ProcessActionRunner::default()),
            forwarder: ReportingForwarder::new(),
            secrets: StaticSecretStore::new(),
            events: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn with_sink(mut self, id: &str, sink: Arc<MockSink>) -> Self {
        self.forwarder = self.forwarder.with_sink(id, sink);
        self
    }

    pub fn with_actions(mut self, actions: Arc<dyn ActionRunner>) -> Self {
        self.actions = actions;
        self
    }

    pub fn with_secret(mut self, name: &str, value: &str) -> Self {
        self.secrets = self.secrets.with(name, value);
        self
    }

    pub fn engine(&self) -> ExecutionEngine {
        let events = self.events.clone();
        ExecutionEngine::new(
            self.provisioner.clone(),
            self.actions.clone(),
            self.forwarder.clone(),
            Arc::new(self.secrets.clone()),
        )
        .with_event_handler(move |event| events.lock().unwrap().push(event))
    }

    /// Run a pipeline and return its outcome
    pub async fn run(&self, yaml: &str, event: &RepositoryEvent) -> PipelineRunOutcome {
        self.engine()
            .execute(&pipeline(yaml), event)
            .await
            .expect("pipeline executes")
    }

    /// Run a pipeline that is expected to be triggered
    pub async fn run_triggered(&self, yaml: &str, event: &RepositoryEvent) -> PipelineRunResult {
        match self.run(yaml, event).await {
            PipelineRunOutcome::Completed(result) => result,
            PipelineRunOutcome::Skipped => panic!("pipeline was not triggered by {:?}", event),
        }
    }

    pub fn events(&self) -> Vec<ExecutionEvent> {
        self.events.lock().unwrap().clone()
    }
}

/// Assert a job in the result has the given status
pub fn assert_job_status(result: &PipelineRunResult, job: &str, status: ci_pipeline::JobStatus) {
    let found = result
        .job(job)
        .unwrap_or_else(|| panic!("Job '{}' not found in {:?}", job, job_names(result)));
    assert_eq!(
        found.status, status,
        "Job '{}' should be {:?}, steps: {:?}",
        job, status, found.steps
    );
}

pub fn job_names(result: &PipelineRunResult) -> Vec<String> {
    result.jobs.iter().map(|j| j.name.clone()).collect()
}
