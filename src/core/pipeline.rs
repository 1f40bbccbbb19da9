//! Pipeline domain model

use crate::core::{
    config::{PipelineConfig, ReportingConfig, RuntimeConfig, ServiceConfig, StepConfig},
    context::TemplateContext,
    job::{JobInstance, ReportSpec, RuntimeSpec, ServiceSpec},
    matrix::{MatrixCombination, MatrixSpec},
    step::{Step, StepDefaults},
    trigger::{RepositoryEvent, Triggers},
};
use anyhow::{Context, Result};
use std::collections::HashMap;
use std::path::{Component, Path};

/// A pipeline definition
///
/// Immutable once built; every run expands fresh job instances from it.
#[derive(Debug, Clone)]
pub struct Pipeline {
    /// Pipeline name
    pub name: String,

    /// Global variables available to all step templates
    pub variables: HashMap<String, String>,

    pub triggers: Triggers,

    pub matrix: MatrixSpec,

    /// Cancel sibling jobs once one fails
    pub fail_fast: bool,

    /// Maximum number of concurrently running jobs
    pub max_parallel: Option<usize>,

    /// Wall-clock limit for each job
    pub timeout_secs: Option<u64>,

    step_templates: Vec<StepConfig>,
    step_defaults: StepDefaults,
    runtime: Option<RuntimeConfig>,
    services: Vec<ServiceConfig>,
    reporting: Vec<ReportingConfig>,
}

impl Pipeline {
    /// Create a pipeline from configuration
    pub fn from_config(config: &PipelineConfig) -> Result<Self> {
        let triggers = Triggers::from_config(&config.triggers)
            .with_context(|| format!("Pipeline '{}' has invalid triggers", config.name))?;
        let matrix = MatrixSpec::from_config(&config.matrix)
            .with_context(|| format!("Pipeline '{}' has an invalid matrix", config.name))?;

        let mut step_defaults = StepDefaults::default();
        if let Some(shell) = &config.default_shell {
            step_defaults.shell = shell.clone();
        }
        step_defaults.timeout_secs = config.default_timeout_secs;

        Ok(Pipeline {
            name: config.name.clone(),
            variables: config.variables_as_string_map(),
            triggers,
            matrix,
            fail_fast: config.strategy.fail_fast,
            max_parallel: config.strategy.max_parallel,
            timeout_secs: config.timeout_secs,
            step_templates: config.steps.clone(),
            step_defaults,
            runtime: config.runtime.clone(),
            services: config.services.clone(),
            reporting: config.reporting.clone(),
        })
    }

    /// Whether the event starts this pipeline
    pub fn should_run(&self, event: &RepositoryEvent) -> bool {
        self.triggers.matches(event)
    }

    /// Number of step templates
    pub fn step_count(&self) -> usize {
        self.step_templates.len()
    }

    /// Expand the matrix into concrete, rendered job instances
    pub fn job_instances(&self) -> Result<Vec<JobInstance>> {
        self.matrix
            .expand()
            .into_iter()
            .enumerate()
            .map(|(index, attributes)| self.instantiate(index, attributes))
            .collect()
    }

    fn job_name(&self, attributes: &MatrixCombination) -> String {
        if attributes.is_empty() {
            self.name.clone()
        } else {
            format!("{} ({})", self.name, attributes.label())
        }
    }

    /// Create the template context for a job
    fn create_context_for_job(&self, name: &str, attributes: &MatrixCombination) -> TemplateContext {
        let mut ctx = TemplateContext::new();
        for (key, value) in &self.variables {
            ctx.set_variable(key.as_str(), value.as_str());
        }
        for (key, value) in attributes.iter() {
            ctx.set_variable(format!("matrix.{}", key), value);
        }
        ctx.set_variable("pipeline.name", self.name.as_str());
        ctx.set_variable("job.name", name);
        ctx
    }

    fn instantiate(&self, index: usize, attributes: MatrixCombination) -> Result<JobInstance> {
        let name = self.job_name(&attributes);
        let ctx = self.create_context_for_job(&name, &attributes);

        let steps = self
            .step_templates
            .iter()
            .map(|template| Step::from_config(template, &self.step_defaults, &ctx))
            .collect::<Result<Vec<_>>>()
            .with_context(|| format!("Failed to instantiate steps for job '{}'", name))?;

        let runtime = match &self.runtime {
            Some(runtime) => Some(RuntimeSpec {
                kind: ctx.render(&runtime.kind)?,
                version: ctx
                    .render(&runtime.version)
                    .with_context(|| format!("Runtime version for job '{}'", name))?,
            }),
            None => None,
        };

        let services = self
            .services
            .iter()
            .map(|service| -> Result<ServiceSpec> {
                Ok(ServiceSpec {
                    name: service.name.clone(),
                    image: ctx.render(&service.image)?,
                    version: service.version.as_deref().map(|v| ctx.render(v)).transpose()?,
                    port: service.port,
                    env: service
                        .env
                        .iter()
                        .map(|(k, v)| -> Result<(String, String)> { Ok((k.clone(), ctx.render(v)?)) })
                        .collect::<Result<Vec<_>>>()?,
                })
            })
            .collect::<Result<Vec<_>>>()
            .with_context(|| format!("Failed to instantiate services for job '{}'", name))?;

        let reporting = self
            .reporting
            .iter()
            .map(|sink| -> Result<ReportSpec> {
                Ok(ReportSpec {
                    id: sink.id.clone(),
                    artifact: workspace_relative(ctx.render(&sink.artifact)?)?,
                    format: sink.format.clone(),
                    credentials: sink.credentials.clone(),
                    command: sink.command.as_deref().map(|c| ctx.render(c)).transpose()?,
                    continue_on_error: sink.continue_on_error,
                })
            })
            .collect::<Result<Vec<_>>>()
            .with_context(|| format!("Failed to instantiate reporting for job '{}'", name))?;

        Ok(JobInstance {
            index,
            name,
            pipeline_name: self.name.clone(),
            attributes,
            steps,
            runtime,
            services,
            reporting,
            timeout_secs: self.timeout_secs,
        })
    }
}

/// Artifacts are addressed from the job workspace and may not leave it
fn workspace_relative(artifact: String) -> Result<String> {
    let escapes = Path::new(&artifact)
        .components()
        .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
    if artifact.trim().is_empty() || escapes {
        anyhow::bail!("Artifact '{}' must be a path inside the job workspace", artifact);
    }
    Ok(artifact)
}
