//! Pipeline execution engine

pub mod action;
pub mod engine;
pub mod executor;
pub mod scheduler;

pub use action::{ActionInvocation, ActionRunner, ProcessActionRunner};
pub use engine::{EventBus, EventHandler, ExecutionEngine, ExecutionEvent, PipelineRunOutcome};
pub use executor::{StepError, StepExecutor};
pub use scheduler::{ExecutionScheduler, JobSlot, SchedulingStrategy};
