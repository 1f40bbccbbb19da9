//! Step executor - runs the steps of one job instance in order

use crate::{
    core::{
        context::{mask_secrets, Secret, SecretStore},
        job::JobInstance,
        state::{StepOutcome, StepRecord, Tolerance},
        step::{EnvBinding, Step, StepAction},
    },
    environment::ProvisionedEnvironment,
    execution::{
        action::{ActionInvocation, ActionRunner},
        engine::{EventBus, ExecutionEvent},
    },
};
use chrono::Utc;
use std::future::Future;
use std::path::Path;
use std::process::{Output, Stdio};
use std::sync::Arc;
use thiserror::Error;
use tokio::process::Command;
use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Lines of stderr kept in a failure message
const STDERR_TAIL_LINES: usize = 20;

/// Why a step failed
#[derive(Debug, Error)]
pub enum StepError {
    #[error("exited with code {code}: {stderr}")]
    Exit { code: i32, stderr: String },

    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("action {action} failed: {reason}")]
    Action { action: String, reason: String },

    #[error("secret '{name}' is not available")]
    Secret { name: String },
}

/// Turn a finished process into stdout or an `Exit` error
pub(crate) fn collect_output(output: Output) -> Result<String, StepError> {
    if output.status.success() {
        return Ok(String::from_utf8_lossy(&output.stdout).into_owned());
    }

    let stderr = String::from_utf8_lossy(&output.stderr);
    let lines: Vec<&str> = stderr.trim_end().lines().collect();
    let tail = lines[lines.len().saturating_sub(STDERR_TAIL_LINES)..].join("\n");
    Err(StepError::Exit {
        // None when killed by a signal
        code: output.status.code().unwrap_or(-1),
        stderr: tail,
    })
}

/// Run `command` through `shell` in the workspace
pub(crate) async fn run_shell(
    shell: &str,
    command: &str,
    workspace: &Path,
    env: &[(String, String)],
) -> Result<String, StepError> {
    let mut parts = shell.split_whitespace();
    let program = parts.next().ok_or_else(|| StepError::Spawn {
        program: shell.to_string(),
        source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "empty shell"),
    })?;

    let output = Command::new(program)
        .args(parts)
        .arg("-c")
        .arg(command)
        .current_dir(workspace)
        .envs(env.iter().cloned())
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|source| StepError::Spawn {
            program: program.to_string(),
            source,
        })?;

    collect_output(output)
}

/// Await `fut`, giving up at `deadline`; `None` when the deadline hit first
async fn with_deadline<F: Future>(deadline: Option<Instant>, fut: F) -> Option<F::Output> {
    match deadline {
        Some(deadline) => tokio::time::timeout_at(deadline, fut).await.ok(),
        None => Some(fut.await),
    }
}

/// Executes the steps of a job instance
#[derive(Clone)]
pub struct StepExecutor {
    actions: Arc<dyn ActionRunner>,
    secrets: Arc<dyn SecretStore>,
}

impl StepExecutor {
    pub fn new(actions: Arc<dyn ActionRunner>, secrets: Arc<dyn SecretStore>) -> Self {
        Self { actions, secrets }
    }

    /// Run all steps sequentially in the job's environment
    ///
    /// A fatal failure skips the remaining steps. Cancellation interrupts the
    /// running step. The job deadline bounds every step and its expiry is
    /// always fatal.
    pub async fn run_steps(
        &self,
        job: &JobInstance,
        env: &ProvisionedEnvironment,
        job_deadline: Option<Instant>,
        cancel: &CancellationToken,
        events: &EventBus,
    ) -> Vec<StepRecord> {
        let mut records = Vec::with_capacity(job.steps.len());
        let mut halted: Option<StepOutcome> = None;

        for step in &job.steps {
            if let Some(outcome) = &halted {
                records.push(StepRecord::not_run(&step.name, outcome.clone()));
                continue;
            }
            if cancel.is_cancelled() {
                records.push(StepRecord::not_run(&step.name, StepOutcome::Cancelled));
                halted = Some(StepOutcome::Skipped {
                    reason: "job cancelled".to_string(),
                });
                continue;
            }

            let record = self.run_step(job, step, env, job_deadline, cancel, events).await;

            if record.outcome == StepOutcome::Cancelled {
                halted = Some(StepOutcome::Skipped {
                    reason: "job cancelled".to_string(),
                });
            } else if record.outcome.is_fatal() {
                halted = Some(StepOutcome::Skipped {
                    reason: format!("step '{}' failed", step.name),
                });
            }
            records.push(record);
        }

        records
    }

    async fn run_step(
        &self,
        job: &JobInstance,
        step: &Step,
        env: &ProvisionedEnvironment,
        job_deadline: Option<Instant>,
        cancel: &CancellationToken,
        events: &EventBus,
    ) -> StepRecord {
        let started_at = Utc::now();
        info!("[{}] Step '{}' started ({})", job.name, step.name, step.describe());
        events.emit(ExecutionEvent::StepStarted {
            job_name: job.name.clone(),
            step_name: step.name.clone(),
        });

        let step_deadline = step
            .timeout_secs
            .map(|secs| Instant::now() + Duration::from_secs(secs));
        // The job deadline wins ties
        let (deadline, job_bound) = match (step_deadline, job_deadline) {
            (Some(s), Some(j)) if j <= s => (Some(j), true),
            (Some(s), _) => (Some(s), false),
            (None, Some(j)) => (Some(j), true),
            (None, None) => (None, false),
        };

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => StepOutcome::Cancelled,
            result = with_deadline(deadline, self.execute(job, step, env)) => match result {
                Some(Ok(())) => StepOutcome::Success,
                Some(Err(error)) => StepOutcome::Failed {
                    error,
                    tolerance: step.tolerance(),
                },
                None if job_bound => StepOutcome::TimedOut {
                    after_secs: job.timeout_secs.unwrap_or_default(),
                    tolerance: Tolerance::Fatal,
                },
                None => StepOutcome::TimedOut {
                    after_secs: step.timeout_secs.unwrap_or_default(),
                    tolerance: step.tolerance(),
                },
            },
        };

        match &outcome {
            StepOutcome::Success => info!("[{}] Step '{}' succeeded", job.name, step.name),
            StepOutcome::Cancelled => warn!("[{}] Step '{}' cancelled", job.name, step.name),
            other if other.is_fatal() => error!("[{}] Step '{}' failed: {:?}", job.name, step.name, other),
            other => warn!("[{}] Step '{}' failed (tolerated): {:?}", job.name, step.name, other),
        }

        events.emit(ExecutionEvent::StepFinished {
            job_name: job.name.clone(),
            step_name: step.name.clone(),
            outcome: outcome.clone(),
        });

        StepRecord {
            name: step.name.clone(),
            outcome,
            started_at: Some(started_at),
            finished_at: Some(Utc::now()),
        }
    }

    /// Run one step; the error message has secret values masked
    async fn execute(&self, job: &JobInstance, step: &Step, env: &ProvisionedEnvironment) -> Result<(), String> {
        let (step_env, secrets) = self
            .step_environment(job, step, env)
            .map_err(|e| e.to_string())?;

        let result = match &step.action {
            StepAction::Command { command, shell } => {
                run_shell(shell, command, &env.workspace, &step_env).await
            }
            StepAction::Action { name, version, params } => {
                let invocation = ActionInvocation {
                    name: name.clone(),
                    version: version.clone(),
                    params: params.clone(),
                    workspace: env.workspace.clone(),
                    env: step_env,
                };
                self.actions.run(&invocation).await
            }
        };

        match result {
            Ok(stdout) => {
                for line in stdout.lines() {
                    debug!("[{}] {} | {}", job.name, step.name, mask_secrets(line, &secrets));
                }
                Ok(())
            }
            Err(e) => Err(mask_secrets(&e.to_string(), &secrets)),
        }
    }

    /// Environment for one step: job variables, provisioned variables, then
    /// the step's own bindings with secrets resolved
    fn step_environment(
        &self,
        job: &JobInstance,
        step: &Step,
        env: &ProvisionedEnvironment,
    ) -> Result<(Vec<(String, String)>, Vec<Secret>), StepError> {
        let mut vars = job.job_env();
        vars.extend(env.env.iter().map(|(k, v)| (k.clone(), v.clone())));

        let mut secrets = Vec::new();
        for (key, binding) in &step.env {
            match binding {
                EnvBinding::Literal(value) => vars.push((key.clone(), value.clone())),
                EnvBinding::Secret(name) => {
                    let secret = self
                        .secrets
                        .resolve(name)
                        .ok_or_else(|| StepError::Secret { name: name.clone() })?;
                    vars.push((key.clone(), secret.expose().to_string()));
                    secrets.push(secret);
                }
            }
        }
        Ok((vars, secrets))
    }
}
