//! Main execution engine - orchestrates one pipeline run
//!
//! Triggers are evaluated, the matrix is expanded, and every job instance is
//! fanned out onto its own task (provision, run steps, forward reports,
//! release). Terminal results are fanned back in and aggregated.

use crate::{
    core::{
        context::SecretStore,
        job::JobInstance,
        state::{JobRunResult, JobStatus, PipelineRunResult, ReportOutcome, RunStatus, StepOutcome, StepRecord},
        trigger::RepositoryEvent,
        Pipeline,
    },
    environment::{release_environment, ProvisionRequest, ProvisionedEnvironment, Provisioner},
    execution::{
        action::ActionRunner,
        executor::StepExecutor,
        scheduler::{ExecutionScheduler, SchedulingStrategy},
    },
    reporting::ReportingForwarder,
};
use anyhow::{Context, Result};
use chrono::Utc;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Events that can occur during pipeline execution
#[derive(Debug, Clone)]
pub enum ExecutionEvent {
    PipelineStarted {
        execution_id: Uuid,
        pipeline_name: String,
        job_count: usize,
    },
    /// Triggers did not match the event
    PipelineSkipped {
        pipeline_name: String,
        event: RepositoryEvent,
    },
    JobStarted {
        execution_id: Uuid,
        job_name: String,
    },
    JobProvisioned {
        job_name: String,
        workspace: PathBuf,
    },
    StepStarted {
        job_name: String,
        step_name: String,
    },
    StepFinished {
        job_name: String,
        step_name: String,
        outcome: StepOutcome,
    },
    ReportFinished {
        job_name: String,
        sink_id: String,
        outcome: ReportOutcome,
    },
    JobFinished {
        job_name: String,
        status: JobStatus,
    },
    PipelineCompleted {
        execution_id: Uuid,
        pipeline_name: String,
        status: RunStatus,
    },
}

/// Type for event handlers
pub type EventHandler = Arc<dyn Fn(ExecutionEvent) + Send + Sync>;

/// Fan-out of events to the registered handlers
#[derive(Clone, Default)]
pub struct EventBus {
    handlers: Arc<Vec<EventHandler>>,
}

impl EventBus {
    fn with_handler(&self, handler: EventHandler) -> Self {
        let mut handlers: Vec<EventHandler> = self.handlers.iter().cloned().collect();
        handlers.push(handler);
        Self {
            handlers: Arc::new(handlers),
        }
    }

    /// Emit an event to all handlers
    pub fn emit(&self, event: ExecutionEvent) {
        for handler in self.handlers.iter() {
            handler(event.clone());
        }
    }
}

/// What happened when a pipeline was offered an event
#[derive(Debug, Clone)]
pub enum PipelineRunOutcome {
    /// Triggers did not match; nothing ran
    Skipped,
    Completed(PipelineRunResult),
}

impl PipelineRunOutcome {
    /// Skipped runs count as success
    pub fn is_success(&self) -> bool {
        match self {
            PipelineRunOutcome::Skipped => true,
            PipelineRunOutcome::Completed(result) => result.is_success(),
        }
    }

    pub fn result(&self) -> Option<&PipelineRunResult> {
        match self {
            PipelineRunOutcome::Skipped => None,
            PipelineRunOutcome::Completed(result) => Some(result),
        }
    }
}

/// Collaborators shared by every job task of a run
struct JobRunner {
    provisioner: Arc<dyn Provisioner>,
    executor: StepExecutor,
    forwarder: Arc<ReportingForwarder>,
    secrets: Arc<dyn SecretStore>,
    scheduler: ExecutionScheduler,
    events: EventBus,
    execution_id: Uuid,
    event: RepositoryEvent,
    /// `cancel` is shared by all siblings when set
    fail_fast: bool,
}

impl JobRunner {
    /// Drive one job instance to its terminal result
    async fn run(self: Arc<Self>, job: JobInstance, cancel: CancellationToken) -> JobRunResult {
        let Some(_slot) = self.scheduler.acquire(&cancel).await else {
            info!("[{}] Cancelled before start", job.name);
            return self.finished(JobRunResult::cancelled(&job));
        };

        let result = self.clone().run_acquired(job, cancel.clone()).await;

        // Cancel siblings while still holding the slot so no queued job starts
        if self.fail_fast && result.status != JobStatus::Success && !cancel.is_cancelled() {
            warn!("[{}] Job did not succeed; cancelling remaining jobs", result.name);
            cancel.cancel();
        }
        result
    }

    async fn run_acquired(self: Arc<Self>, job: JobInstance, cancel: CancellationToken) -> JobRunResult {
        info!("[{}] Job started", job.name);
        self.events.emit(ExecutionEvent::JobStarted {
            execution_id: self.execution_id,
            job_name: job.name.clone(),
        });

        // The job's wall-clock budget covers provisioning too
        let deadline = job
            .timeout_secs
            .map(|secs| Instant::now() + Duration::from_secs(secs));

        let request = ProvisionRequest::for_job(self.execution_id, &job, &self.event, deadline);
        let env = match self.provisioner.provision(&request).await {
            Ok(env) => Arc::new(env),
            Err(e) => {
                error!("[{}] Provisioning failed: {}", job.name, e);
                return self.finished(JobRunResult::provision_failed(&job, e.to_string()));
            }
        };
        debug!("[{}] Workspace {}", job.name, env.workspace.display());

        // Everything between provision and release runs on its own task so a
        // panic there cannot skip the release below
        let phase = tokio::spawn({
            let runner = self.clone();
            let job = job.clone();
            let env = env.clone();
            async move { runner.run_provisioned(&job, &env, deadline, &cancel).await }
        });
        let joined = phase.await;

        release_environment(self.provisioner.as_ref(), &env).await;

        let result = match joined {
            Ok(mut result) => {
                result.finish();
                result
            }
            Err(e) => {
                error!("[{}] Job task failed: {}", job.name, e);
                aborted(&job)
            }
        };
        self.finished(result)
    }

    async fn run_provisioned(
        &self,
        job: &JobInstance,
        env: &ProvisionedEnvironment,
        deadline: Option<Instant>,
        cancel: &CancellationToken,
    ) -> JobRunResult {
        self.events.emit(ExecutionEvent::JobProvisioned {
            job_name: job.name.clone(),
            workspace: env.workspace.clone(),
        });

        let mut result = JobRunResult::start(job);
        result.steps = self
            .executor
            .run_steps(job, env, deadline, cancel, &self.events)
            .await;

        if result.steps.iter().any(|s| s.outcome == StepOutcome::Cancelled) {
            result.skip_reports(job, "job cancelled");
        } else if result.has_fatal_step() {
            result.skip_reports(job, "a step failed");
        } else {
            result.reports = self
                .forwarder
                .forward(&job.reporting, env, self.secrets.as_ref(), deadline)
                .await;
        }

        for report in &result.reports {
            self.events.emit(ExecutionEvent::ReportFinished {
                job_name: job.name.clone(),
                sink_id: report.sink_id.clone(),
                outcome: report.outcome.clone(),
            });
        }
        result
    }

    fn finished(&self, result: JobRunResult) -> JobRunResult {
        match result.status {
            JobStatus::Success => info!("[{}] Job succeeded", result.name),
            JobStatus::Cancelled => warn!("[{}] Job cancelled", result.name),
            JobStatus::Failure => error!("[{}] Job failed", result.name),
        }
        for tolerated in result.tolerated_failures() {
            warn!("[{}] Tolerated failure: {}", result.name, tolerated);
        }
        self.events.emit(ExecutionEvent::JobFinished {
            job_name: result.name.clone(),
            status: result.status,
        });
        result
    }
}

/// Result for a job whose task died without reporting back
fn aborted(job: &JobInstance) -> JobRunResult {
    let mut result = JobRunResult::start(job);
    result.steps = job
        .steps
        .iter()
        .map(|s| {
            StepRecord::not_run(
                &s.name,
                StepOutcome::Skipped {
                    reason: "job task aborted".to_string(),
                },
            )
        })
        .collect();
    result.skip_reports(job, "job task aborted");
    result.status = JobStatus::Failure;
    result.finished_at = Utc::now();
    result
}

/// Main pipeline execution engine
pub struct ExecutionEngine {
    provisioner: Arc<dyn Provisioner>,
    actions: Arc<dyn ActionRunner>,
    forwarder: Arc<ReportingForwarder>,
    secrets: Arc<dyn SecretStore>,
    strategy: Option<SchedulingStrategy>,
    events: EventBus,
    shutdown: CancellationToken,
}

impl ExecutionEngine {
    pub fn new(
        provisioner: Arc<dyn Provisioner>,
        actions: Arc<dyn ActionRunner>,
        forwarder: ReportingForwarder,
        secrets: Arc<dyn SecretStore>,
    ) -> Self {
        Self {
            provisioner,
            actions,
            forwarder: Arc::new(forwarder),
            secrets,
            strategy: None,
            events: EventBus::default(),
            shutdown: CancellationToken::new(),
        }
    }

    /// Override the strategy the pipeline declares
    pub fn with_strategy(mut self, strategy: SchedulingStrategy) -> Self {
        self.strategy = Some(strategy);
        self
    }

    /// Add an event handler
    pub fn with_event_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(ExecutionEvent) + Send + Sync + 'static,
    {
        self.events = self.events.with_handler(Arc::new(handler));
        self
    }

    /// Token that cancels every running job when fired
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Run a pipeline for an event
    pub async fn execute(&self, pipeline: &Pipeline, event: &RepositoryEvent) -> Result<PipelineRunOutcome> {
        if !pipeline.should_run(event) {
            info!(
                "Pipeline '{}' not triggered by {} on {}",
                pipeline.name, event.kind, event.git_ref
            );
            self.events.emit(ExecutionEvent::PipelineSkipped {
                pipeline_name: pipeline.name.clone(),
                event: event.clone(),
            });
            return Ok(PipelineRunOutcome::Skipped);
        }

        let jobs = pipeline
            .job_instances()
            .with_context(|| format!("Failed to expand pipeline '{}'", pipeline.name))?;

        let execution_id = Uuid::new_v4();
        let started_at = Utc::now();
        let strategy = self
            .strategy
            .unwrap_or_else(|| SchedulingStrategy::for_pipeline(pipeline));

        info!(
            "Starting pipeline execution: {} ({}) with {} job(s), {:?}",
            pipeline.name,
            execution_id,
            jobs.len(),
            strategy
        );
        self.events.emit(ExecutionEvent::PipelineStarted {
            execution_id,
            pipeline_name: pipeline.name.clone(),
            job_count: jobs.len(),
        });

        let runner = Arc::new(JobRunner {
            provisioner: self.provisioner.clone(),
            executor: StepExecutor::new(self.actions.clone(), self.secrets.clone()),
            forwarder: self.forwarder.clone(),
            secrets: self.secrets.clone(),
            scheduler: ExecutionScheduler::new(strategy),
            events: self.events.clone(),
            execution_id,
            event: event.clone(),
            fail_fast: pipeline.fail_fast,
        });

        // Siblings only share a token when fail-fast is on; shutdown reaches all
        let run_token = self.shutdown.child_token();
        let mut set = JoinSet::new();
        for job in jobs.iter().cloned() {
            let runner = runner.clone();
            let cancel = if pipeline.fail_fast {
                run_token.clone()
            } else {
                run_token.child_token()
            };
            set.spawn(async move { runner.run(job, cancel).await });
        }

        let mut slots: Vec<Option<JobRunResult>> = vec![None; jobs.len()];
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(result) => {
                    let index = result.index;
                    if let Some(slot) = slots.get_mut(index) {
                        *slot = Some(result);
                    }
                }
                Err(e) => {
                    error!("Job task of '{}' failed: {}", pipeline.name, e);
                    if pipeline.fail_fast {
                        run_token.cancel();
                    }
                }
            }
        }

        let results: Vec<JobRunResult> = slots
            .into_iter()
            .zip(jobs.iter())
            .map(|(slot, job)| slot.unwrap_or_else(|| aborted(job)))
            .collect();

        let status = PipelineRunResult::aggregate(&results);
        info!("Pipeline execution finished: {} - {}", pipeline.name, status.as_str());
        self.events.emit(ExecutionEvent::PipelineCompleted {
            execution_id,
            pipeline_name: pipeline.name.clone(),
            status,
        });

        Ok(PipelineRunOutcome::Completed(PipelineRunResult {
            execution_id,
            pipeline_name: pipeline.name.clone(),
            event: event.clone(),
            status,
            jobs: results,
            started_at,
            completed_at: Utc::now(),
        }))
    }
}
