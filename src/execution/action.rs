//! Action steps - named, version-pinned executables

use crate::execution::executor::{collect_output, StepError};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::debug;

/// One invocation of an action step
#[derive(Debug, Clone)]
pub struct ActionInvocation {
    pub name: String,
    pub version: String,
    pub params: BTreeMap<String, String>,
    pub workspace: PathBuf,
    /// Full step environment
    pub env: Vec<(String, String)>,
}

impl ActionInvocation {
    pub fn reference(&self) -> String {
        format!("{}@{}", self.name, self.version)
    }

    /// Params exported as `INPUT_<PARAM>`
    pub fn input_env(&self) -> Vec<(String, String)> {
        self.params
            .iter()
            .map(|(key, value)| (format!("INPUT_{}", crate::core::job::env_key(key)), value.clone()))
            .collect()
    }
}

/// Trait for action execution - allows for different implementations
#[async_trait]
pub trait ActionRunner: Send + Sync {
    /// Run the action to completion; returns captured stdout
    ///
    /// Dropping the returned future must stop the action.
    async fn run(&self, invocation: &ActionInvocation) -> Result<String, StepError>;
}

/// Runs `<actions_dir>/<name>/<version>/run` as a child process
///
/// Checkout and runtime setup actions are satisfied by the provisioner and
/// succeed without an executable.
#[derive(Debug, Clone, Default)]
pub struct ProcessActionRunner {
    actions_dir: Option<PathBuf>,
}

impl ProcessActionRunner {
    pub fn new(actions_dir: Option<PathBuf>) -> Self {
        Self { actions_dir }
    }

    fn executable(&self, invocation: &ActionInvocation) -> Option<PathBuf> {
        let dir = self.actions_dir.as_deref()?;
        let path = dir.join(&invocation.name).join(&invocation.version).join("run");
        path.is_file().then_some(path)
    }

    /// Actions covered by environment provisioning
    fn is_provisioned(name: &str) -> bool {
        let short = name.rsplit('/').next().unwrap_or(name);
        short == "checkout" || short.starts_with("setup-")
    }

    async fn spawn(&self, program: &Path, invocation: &ActionInvocation) -> Result<String, StepError> {
        let mut command = Command::new(program);
        command
            .current_dir(&invocation.workspace)
            .envs(invocation.env.iter().cloned())
            .envs(invocation.input_env())
            .kill_on_drop(true);

        let output = command.output().await.map_err(|source| StepError::Spawn {
            program: program.display().to_string(),
            source,
        })?;
        collect_output(output).map_err(|e| match e {
            StepError::Exit { code, stderr } => StepError::Action {
                action: invocation.reference(),
                reason: format!("exited with code {}: {}", code, stderr),
            },
            other => other,
        })
    }
}

#[async_trait]
impl ActionRunner for ProcessActionRunner {
    async fn run(&self, invocation: &ActionInvocation) -> Result<String, StepError> {
        match self.executable(invocation) {
            Some(program) => {
                debug!("Running action {} from {}", invocation.reference(), program.display());
                self.spawn(&program, invocation).await
            }
            None if Self::is_provisioned(&invocation.name) => {
                debug!("Action {} satisfied by the provisioned environment", invocation.reference());
                Ok(String::new())
            }
            None => Err(StepError::Action {
                action: invocation.reference(),
                reason: "no such action".to_string(),
            }),
        }
    }
}
