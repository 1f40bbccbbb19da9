//! Persistence layer for pipeline run history

#[cfg(feature = "sqlite")]
pub mod store;

#[cfg(feature = "sqlite")]
pub use store::SqliteExecutionStore;

use crate::core::{EventKind, JobRunResult, JobStatus, PipelineRunResult, RunStatus};
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Summary of a pipeline run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    /// Unique execution ID
    pub execution_id: Uuid,

    /// Pipeline name
    pub pipeline_name: String,

    /// Event that triggered the run
    pub event_kind: EventKind,
    pub git_ref: String,

    /// Aggregated status
    pub status: RunStatus,

    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,

    /// Number of job instances
    pub total_jobs: usize,

    /// Job instances that did not succeed
    pub failed_jobs: usize,

    /// Per-job results
    pub jobs: Vec<JobRunResult>,
}

impl RunSummary {
    pub fn from_result(result: &PipelineRunResult) -> Self {
        Self {
            execution_id: result.execution_id,
            pipeline_name: result.pipeline_name.clone(),
            event_kind: result.event.kind,
            git_ref: result.event.git_ref.clone(),
            status: result.status,
            started_at: result.started_at,
            completed_at: result.completed_at,
            total_jobs: result.jobs.len(),
            failed_jobs: result
                .jobs
                .iter()
                .filter(|j| j.status != JobStatus::Success)
                .count(),
            jobs: result.jobs.clone(),
        }
    }
}

/// Trait for persistence backends
#[async_trait::async_trait]
pub trait PersistenceBackend: Send + Sync {
    /// Save a pipeline run
    async fn save_run(&self, run: &RunSummary) -> Result<()>;

    /// Load a run by ID
    async fn load_run(&self, execution_id: Uuid) -> Result<Option<RunSummary>>;

    /// List runs of a pipeline, newest first
    async fn list_runs(&self, pipeline_name: &str, limit: usize) -> Result<Vec<RunSummary>>;

    /// List all pipeline names
    async fn list_pipelines(&self) -> Result<Vec<String>>;
}

/// In-memory persistence (for testing or ephemeral use)
#[derive(Default)]
pub struct InMemoryPersistence {
    runs: tokio::sync::RwLock<Vec<RunSummary>>,
}

impl InMemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl PersistenceBackend for InMemoryPersistence {
    async fn save_run(&self, run: &RunSummary) -> Result<()> {
        let mut runs = self.runs.write().await;
        runs.retain(|r| r.execution_id != run.execution_id);
        runs.push(run.clone());
        Ok(())
    }

    async fn load_run(&self, execution_id: Uuid) -> Result<Option<RunSummary>> {
        let runs = self.runs.read().await;
        Ok(runs.iter().find(|r| r.execution_id == execution_id).cloned())
    }

    async fn list_runs(&self, pipeline_name: &str, limit: usize) -> Result<Vec<RunSummary>> {
        let runs = self.runs.read().await;
        let mut matching: Vec<RunSummary> = runs
            .iter()
            .filter(|r| r.pipeline_name == pipeline_name)
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        matching.truncate(limit);
        Ok(matching)
    }

    async fn list_pipelines(&self) -> Result<Vec<String>> {
        let runs = self.runs.read().await;
        let mut names: Vec<String> = runs.iter().map(|r| r.pipeline_name.clone()).collect();
        names.sort();
        names.dedup();
        Ok(names)
    }
}
