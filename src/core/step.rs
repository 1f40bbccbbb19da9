//! Step domain model

use crate::core::{
    config::StepConfig,
    context::{self, TemplateContext},
    matrix::scalar_to_string,
    state::Tolerance,
};
use anyhow::{Context, Result};
use std::collections::BTreeMap;

/// What a step does
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepAction {
    /// Run a literal command through a shell; non-zero exit is failure
    Command { command: String, shell: String },
    /// Invoke a named, version-pinned external action
    Action {
        name: String,
        version: String,
        params: BTreeMap<String, String>,
    },
}

/// Value bound to a step environment variable
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnvBinding {
    Literal(String),
    /// Resolved through the secret store when the step runs
    Secret(String),
}

/// A single rendered step of a job instance
#[derive(Debug, Clone)]
pub struct Step {
    pub name: String,
    pub action: StepAction,
    pub continue_on_error: bool,
    pub timeout_secs: Option<u64>,
    pub env: BTreeMap<String, EnvBinding>,
}

/// Defaults applied to every step of a pipeline
#[derive(Debug, Clone)]
pub struct StepDefaults {
    pub shell: String,
    pub timeout_secs: Option<u64>,
}

impl Default for StepDefaults {
    fn default() -> Self {
        Self {
            shell: "sh".to_string(),
            timeout_secs: None,
        }
    }
}

/// Split `name@version` into its parts; the version pin is mandatory
pub fn parse_action_ref(reference: &str) -> Result<(String, String)> {
    match reference.rsplit_once('@') {
        Some((name, version)) if !name.is_empty() && !version.is_empty() => {
            Ok((name.to_string(), version.to_string()))
        }
        _ => anyhow::bail!(
            "Action reference '{}' must be of the form name@version",
            reference
        ),
    }
}

impl Step {
    /// Instantiate a step template for one job
    pub fn from_config(
        config: &StepConfig,
        defaults: &StepDefaults,
        ctx: &TemplateContext,
    ) -> Result<Self> {
        let action = match (&config.command, &config.action) {
            (Some(command), None) => StepAction::Command {
                command: ctx.render(command)?,
                shell: config.shell.clone().unwrap_or_else(|| defaults.shell.clone()),
            },
            (None, Some(reference)) => {
                let (name, version) = parse_action_ref(&ctx.render(reference)?)?;
                let mut params = BTreeMap::new();
                for (key, value) in &config.params {
                    let value = scalar_to_string(value)
                        .with_context(|| format!("Step '{}' param '{}'", config.name, key))?;
                    params.insert(key.clone(), ctx.render(&value)?);
                }
                StepAction::Action { name, version, params }
            }
            _ => anyhow::bail!(
                "Step '{}' must declare exactly one of 'command' or 'action'",
                config.name
            ),
        };

        let mut env = BTreeMap::new();
        for (key, value) in &config.env {
            let binding = match context::parse_secret_reference(value) {
                Some(secret) => EnvBinding::Secret(secret),
                None => EnvBinding::Literal(ctx.render(value)?),
            };
            env.insert(key.clone(), binding);
        }

        Ok(Step {
            name: ctx.render(&config.name)?,
            action,
            continue_on_error: config.continue_on_error,
            timeout_secs: config.timeout_secs.or(defaults.timeout_secs),
            env,
        })
    }

    pub fn tolerance(&self) -> Tolerance {
        Tolerance::from_continue_on_error(self.continue_on_error)
    }

    /// Short human-readable description of the action
    pub fn describe(&self) -> String {
        match &self.action {
            StepAction::Command { command, .. } => {
                let first_line = command.lines().next().unwrap_or_default();
                format!("run: {}", first_line)
            }
            StepAction::Action { name, version, .. } => format!("uses: {}@{}", name, version),
        }
    }
}
