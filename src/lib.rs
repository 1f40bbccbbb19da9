//! ci-pipeline - A CI pipeline orchestrator with matrix fan-out and reporting fan-in

pub mod cli;
pub mod core;
pub mod environment;
pub mod execution;
pub mod persistence;
pub mod reporting;

// Re-export commonly used types
pub use core::{Pipeline, JobInstance, RepositoryEvent, EventKind, JobStatus, RunStatus};
pub use core::{JobRunResult, PipelineRunResult, StepOutcome, Tolerance};
pub use environment::{Provisioner, LocalProvisioner, ProvisionedEnvironment, ProvisionError};
pub use execution::{ExecutionEngine, ExecutionEvent, PipelineRunOutcome, SchedulingStrategy};
pub use reporting::{ReportingForwarder, ReportingSink, SinkError};
