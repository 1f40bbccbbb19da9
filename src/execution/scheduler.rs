//! Execution scheduler - bounds how many job instances run at once

use crate::core::Pipeline;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

/// Strategy for scheduling job execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SchedulingStrategy {
    /// Execute jobs one at a time
    Sequential,

    /// Execute all jobs in parallel
    #[default]
    Parallel,

    /// Limited parallelism (max N concurrent jobs)
    LimitedParallel(usize),
}

impl SchedulingStrategy {
    /// Strategy declared by the pipeline's `strategy.max_parallel`
    pub fn for_pipeline(pipeline: &Pipeline) -> Self {
        match pipeline.max_parallel {
            Some(1) => SchedulingStrategy::Sequential,
            Some(n) => SchedulingStrategy::LimitedParallel(n),
            None => SchedulingStrategy::Parallel,
        }
    }

    fn limit(&self) -> Option<usize> {
        match self {
            SchedulingStrategy::Sequential => Some(1),
            SchedulingStrategy::Parallel => None,
            SchedulingStrategy::LimitedParallel(n) => Some((*n).max(1)),
        }
    }
}

impl FromStr for SchedulingStrategy {
    type Err = String;

    /// `sequential`, `parallel`, or a positive job count
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sequential" => Ok(SchedulingStrategy::Sequential),
            "parallel" => Ok(SchedulingStrategy::Parallel),
            n => match n.parse::<usize>() {
                Ok(0) | Err(_) => Err(format!(
                    "Invalid strategy '{}': expected sequential, parallel or a positive number",
                    s
                )),
                Ok(1) => Ok(SchedulingStrategy::Sequential),
                Ok(n) => Ok(SchedulingStrategy::LimitedParallel(n)),
            },
        }
    }
}

/// Permit to run one job; dropping it frees the slot
#[derive(Debug)]
pub struct JobSlot {
    _permit: Option<OwnedSemaphorePermit>,
}

/// Hands out job slots according to a strategy
#[derive(Debug, Clone)]
pub struct ExecutionScheduler {
    strategy: SchedulingStrategy,
    slots: Option<Arc<Semaphore>>,
}

impl ExecutionScheduler {
    pub fn new(strategy: SchedulingStrategy) -> Self {
        Self {
            strategy,
            slots: strategy.limit().map(|n| Arc::new(Semaphore::new(n))),
        }
    }

    pub fn strategy(&self) -> SchedulingStrategy {
        self.strategy
    }

    /// Wait for a free slot; `None` if the token fires first
    pub async fn acquire(&self, cancel: &CancellationToken) -> Option<JobSlot> {
        if cancel.is_cancelled() {
            return None;
        }
        let Some(slots) = &self.slots else {
            return Some(JobSlot { _permit: None });
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            permit = slots.clone().acquire_owned() => permit.ok().map(|p| JobSlot { _permit: Some(p) }),
        }
    }
}
