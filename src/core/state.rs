//! Run result models

use crate::core::{job::JobInstance, matrix::MatrixCombination, trigger::RepositoryEvent};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Aggregated status of one pipeline run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Success,
    Failure,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Success => "success",
            RunStatus::Failure => "failure",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "success" => Some(RunStatus::Success),
            "failure" => Some(RunStatus::Failure),
            _ => None,
        }
    }
}

/// Terminal status of a single job instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Success,
    Failure,
    /// Stopped by fail-fast or shutdown before reaching a verdict
    Cancelled,
}

/// Classification of a failure for aggregation purposes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tolerance {
    /// Fails the containing scope
    Fatal,
    /// Recorded, but does not fail the containing scope
    Tolerated,
}

impl Tolerance {
    pub fn from_continue_on_error(continue_on_error: bool) -> Self {
        if continue_on_error {
            Tolerance::Tolerated
        } else {
            Tolerance::Fatal
        }
    }
}

/// Outcome of a single step
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum StepOutcome {
    Success,
    Failed {
        error: String,
        tolerance: Tolerance,
    },
    TimedOut {
        after_secs: u64,
        tolerance: Tolerance,
    },
    /// Not executed because an earlier step failed fatally
    Skipped {
        reason: String,
    },
    /// Interrupted or never started because the job was cancelled
    Cancelled,
}

impl StepOutcome {
    /// Whether this outcome fails the job
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            StepOutcome::Failed { tolerance: Tolerance::Fatal, .. }
                | StepOutcome::TimedOut { tolerance: Tolerance::Fatal, .. }
        )
    }

    /// Whether the step failed, tolerated or not
    pub fn is_failure(&self) -> bool {
        matches!(self, StepOutcome::Failed { .. } | StepOutcome::TimedOut { .. })
    }
}

/// Recorded result of one step
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRecord {
    pub name: String,
    pub outcome: StepOutcome,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl StepRecord {
    /// A step that never ran
    pub fn not_run(name: &str, outcome: StepOutcome) -> Self {
        Self {
            name: name.to_string(),
            outcome,
            started_at: None,
            finished_at: None,
        }
    }
}

/// Outcome of forwarding an artifact to one reporting sink
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ReportOutcome {
    Sent,
    Failed {
        error: String,
        tolerance: Tolerance,
    },
    Skipped {
        reason: String,
    },
}

impl ReportOutcome {
    pub fn is_fatal(&self) -> bool {
        matches!(self, ReportOutcome::Failed { tolerance: Tolerance::Fatal, .. })
    }
}

/// Recorded result of one reporting sink invocation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportRecord {
    pub sink_id: String,
    pub artifact: String,
    pub format: String,
    pub outcome: ReportOutcome,
}

/// Run result of one job instance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRunResult {
    pub index: usize,
    pub name: String,
    pub attributes: MatrixCombination,
    pub status: JobStatus,
    /// Set when the environment could not be provisioned
    pub provision_error: Option<String>,
    pub steps: Vec<StepRecord>,
    pub reports: Vec<ReportRecord>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl JobRunResult {
    /// Create an empty result for a job that is about to run
    pub fn start(job: &JobInstance) -> Self {
        let now = Utc::now();
        Self {
            index: job.index,
            name: job.name.clone(),
            attributes: job.attributes.clone(),
            status: JobStatus::Success,
            provision_error: None,
            steps: Vec::new(),
            reports: Vec::new(),
            started_at: now,
            finished_at: now,
        }
    }

    /// Result for a job that was cancelled before it acquired an environment
    pub fn cancelled(job: &JobInstance) -> Self {
        let mut result = Self::start(job);
        result.steps = job
            .steps
            .iter()
            .map(|s| StepRecord::not_run(&s.name, StepOutcome::Cancelled))
            .collect();
        result.reports = skipped_reports(job, "job cancelled");
        result.status = JobStatus::Cancelled;
        result
    }

    /// Result for a job whose environment could not be provisioned
    pub fn provision_failed(job: &JobInstance, error: String) -> Self {
        let mut result = Self::start(job);
        result.steps = job
            .steps
            .iter()
            .map(|s| {
                StepRecord::not_run(
                    &s.name,
                    StepOutcome::Skipped {
                        reason: "environment provisioning failed".to_string(),
                    },
                )
            })
            .collect();
        result.reports = skipped_reports(job, "environment provisioning failed");
        result.provision_error = Some(error);
        result.finish();
        result
    }

    /// Record every declared sink as skipped
    pub fn skip_reports(&mut self, job: &JobInstance, reason: &str) {
        self.reports = skipped_reports(job, reason);
    }

    /// Whether any step ended fatally
    pub fn has_fatal_step(&self) -> bool {
        self.steps.iter().any(|s| s.outcome.is_fatal())
    }

    /// Compute the terminal status from the recorded outcomes
    pub fn finish(&mut self) {
        self.finished_at = Utc::now();
        self.status = if self.provision_error.is_some()
            || self.has_fatal_step()
            || self.reports.iter().any(|r| r.outcome.is_fatal())
        {
            JobStatus::Failure
        } else if self.steps.iter().any(|s| s.outcome == StepOutcome::Cancelled) {
            JobStatus::Cancelled
        } else {
            JobStatus::Success
        };
    }

    /// Failures that were recorded but did not fail the job
    pub fn tolerated_failures(&self) -> Vec<String> {
        let steps = self.steps.iter().filter_map(|s| match &s.outcome {
            StepOutcome::Failed { tolerance: Tolerance::Tolerated, error } => {
                Some(format!("step '{}': {}", s.name, error))
            }
            StepOutcome::TimedOut { tolerance: Tolerance::Tolerated, after_secs } => {
                Some(format!("step '{}': timed out after {}s", s.name, after_secs))
            }
            _ => None,
        });
        let reports = self.reports.iter().filter_map(|r| match &r.outcome {
            ReportOutcome::Failed { tolerance: Tolerance::Tolerated, error } => {
                Some(format!("sink '{}': {}", r.sink_id, error))
            }
            _ => None,
        });
        steps.chain(reports).collect()
    }

    pub fn step(&self, name: &str) -> Option<&StepRecord> {
        self.steps.iter().find(|s| s.name == name)
    }

    pub fn report(&self, sink_id: &str) -> Option<&ReportRecord> {
        self.reports.iter().find(|r| r.sink_id == sink_id)
    }
}

fn skipped_reports(job: &JobInstance, reason: &str) -> Vec<ReportRecord> {
    job.reporting
        .iter()
        .map(|r| ReportRecord {
            sink_id: r.id.clone(),
            artifact: r.artifact.clone(),
            format: r.format.clone(),
            outcome: ReportOutcome::Skipped {
                reason: reason.to_string(),
            },
        })
        .collect()
}

/// Result of one pipeline run, aggregated over all of its job instances
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineRunResult {
    pub execution_id: Uuid,
    pub pipeline_name: String,
    pub event: RepositoryEvent,
    pub status: RunStatus,
    /// Job results in matrix expansion order
    pub jobs: Vec<JobRunResult>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

impl PipelineRunResult {
    /// Aggregate job results: failure if any job did not succeed
    pub fn aggregate(jobs: &[JobRunResult]) -> RunStatus {
        if jobs.iter().all(|j| j.status == JobStatus::Success) {
            RunStatus::Success
        } else {
            RunStatus::Failure
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Success
    }

    pub fn job(&self, name: &str) -> Option<&JobRunResult> {
        self.jobs.iter().find(|j| j.name == name)
    }

    pub fn failed_jobs(&self) -> Vec<&JobRunResult> {
        self.jobs
            .iter()
            .filter(|j| j.status != JobStatus::Success)
            .collect()
    }
}
