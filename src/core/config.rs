//! Pipeline configuration from YAML

use crate::core::{
    context,
    matrix::{scalar_to_string, MatrixSpec},
    step::parse_action_ref,
    trigger::{EventKind, Triggers},
    Pipeline,
};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;

/// Top-level pipeline configuration loaded from YAML
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Pipeline name
    pub name: String,

    /// Events that start the pipeline
    #[serde(default)]
    pub triggers: TriggersConfig,

    /// Language runtime to provision for every job
    #[serde(default)]
    pub runtime: Option<RuntimeConfig>,

    /// Auxiliary service containers started for every job
    #[serde(default)]
    pub services: Vec<ServiceConfig>,

    /// Job scheduling options
    #[serde(default)]
    pub strategy: StrategyConfig,

    /// Job matrix
    #[serde(default)]
    pub matrix: MatrixConfig,

    /// Global variables available to all step templates
    #[serde(default)]
    variables: HashMap<String, Value>,

    /// Step templates, executed in order
    pub steps: Vec<StepConfig>,

    /// Reporting sinks receiving produced artifacts
    #[serde(default)]
    pub reporting: Vec<ReportingConfig>,

    /// Wall-clock limit for each job (in seconds)
    #[serde(default)]
    pub timeout_secs: Option<u64>,

    /// Default timeout for steps (in seconds)
    #[serde(default)]
    pub default_timeout_secs: Option<u64>,

    /// Default shell for command steps
    #[serde(default)]
    pub default_shell: Option<String>,
}

/// Trigger declaration: either a plain list of event kinds or per-kind filters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TriggersConfig {
    Kinds(Vec<EventKind>),
    Rules(BTreeMap<EventKind, Option<TriggerConfig>>),
}

impl Default for TriggersConfig {
    fn default() -> Self {
        TriggersConfig::Kinds(Vec::new())
    }
}

/// Ref filters for one event kind
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TriggerConfig {
    #[serde(default)]
    pub branches: Vec<String>,

    #[serde(default)]
    pub tags: Vec<String>,
}

/// Requested language runtime
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    pub kind: String,
    pub version: String,
}

/// Requested service container
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub name: String,
    pub image: String,

    /// Image tag (templated)
    #[serde(default)]
    pub version: Option<String>,

    /// Container port to expose
    pub port: u16,

    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

/// Scheduling strategy for job instances
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyConfig {
    /// Cancel sibling jobs once one fails
    #[serde(default = "default_fail_fast")]
    pub fail_fast: bool,

    /// Maximum number of concurrently running jobs
    #[serde(default)]
    pub max_parallel: Option<usize>,
}

fn default_fail_fast() -> bool {
    true
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            fail_fast: default_fail_fast(),
            max_parallel: None,
        }
    }
}

/// Matrix declaration; axis order is preserved
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MatrixConfig {
    #[serde(default)]
    pub axes: Mapping,

    #[serde(default)]
    pub include: Vec<Mapping>,

    #[serde(default)]
    pub exclude: Vec<Mapping>,
}

/// Step template as defined in YAML
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepConfig {
    /// Human-readable step name
    pub name: String,

    /// Shell command to run
    #[serde(default)]
    pub command: Option<String>,

    /// External action reference (`name@version`)
    #[serde(default)]
    pub action: Option<String>,

    /// Parameters passed to the action
    #[serde(default)]
    pub params: BTreeMap<String, Value>,

    /// Record a failure but keep going
    #[serde(default)]
    pub continue_on_error: bool,

    /// Environment bindings; `{{ secrets.NAME }}` as a whole value binds a secret
    #[serde(default)]
    pub env: BTreeMap<String, String>,

    /// Timeout for this step (overrides the pipeline default)
    #[serde(default)]
    pub timeout_secs: Option<u64>,

    /// Shell for this step (overrides the pipeline default)
    #[serde(default)]
    pub shell: Option<String>,
}

/// Reporting sink declaration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportingConfig {
    /// Sink identifier
    pub id: String,

    /// Artifact path relative to the workspace (templated)
    pub artifact: String,

    /// Declared artifact format tag
    pub format: String,

    /// Secret name holding the sink credentials
    #[serde(default)]
    pub credentials: Option<String>,

    /// Uploader command, used when no sink is registered under `id`
    #[serde(default)]
    pub command: Option<String>,

    /// Ignore failures of this sink for aggregation
    #[serde(default)]
    pub continue_on_error: bool,
}

impl PipelineConfig {
    /// Load pipeline configuration from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Self::from_yaml(&content).with_context(|| format!("Invalid pipeline {}", path.display()))
    }

    /// Parse pipeline configuration from YAML string
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: PipelineConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the pipeline configuration
    ///
    /// Everything that can be checked without running anything is checked
    /// here, including a full matrix expansion so that unresolved
    /// placeholders surface at load time.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            anyhow::bail!("Pipeline name must not be empty");
        }

        Triggers::from_config(&self.triggers)
            .with_context(|| format!("Pipeline '{}' has invalid triggers", self.name))?;

        MatrixSpec::from_config(&self.matrix)
            .with_context(|| format!("Pipeline '{}' has an invalid matrix", self.name))?;

        if self.strategy.max_parallel == Some(0) {
            anyhow::bail!("strategy.max_parallel must be at least 1");
        }

        for step in &self.steps {
            match (&step.command, &step.action) {
                (Some(command), None) => {
                    if context::mentions_secret(command) {
                        anyhow::bail!(
                            "Step '{}' references a secret in its command; bind it through 'env' instead",
                            step.name
                        );
                    }
                }
                (None, Some(action)) => {
                    parse_action_ref(action)?;
                    for (key, value) in &step.params {
                        let value = scalar_to_string(value)
                            .with_context(|| format!("Step '{}' param '{}'", step.name, key))?;
                        if context::mentions_secret(&value) {
                            anyhow::bail!(
                                "Step '{}' param '{}' references a secret; bind it through 'env' instead",
                                step.name,
                                key
                            );
                        }
                    }
                }
                _ => anyhow::bail!(
                    "Step '{}' must declare exactly one of 'command' or 'action'",
                    step.name
                ),
            }

            for (key, value) in &step.env {
                if context::mentions_secret(value) && context::parse_secret_reference(value).is_none() {
                    anyhow::bail!(
                        "Step '{}' env '{}' must be exactly one secret reference",
                        step.name,
                        key
                    );
                }
            }
        }

        let mut service_names = HashSet::new();
        for service in &self.services {
            if !service_names.insert(&service.name) {
                anyhow::bail!("Duplicate service name: {}", service.name);
            }
        }

        let mut sink_ids = HashSet::new();
        for sink in &self.reporting {
            if !sink_ids.insert(&sink.id) {
                anyhow::bail!("Duplicate reporting sink: {}", sink.id);
            }
        }

        for (key, value) in &self.variables {
            scalar_to_string(value).with_context(|| format!("Variable '{}'", key))?;
        }

        let pipeline = self.to_pipeline()?;
        pipeline.job_instances()?;

        Ok(())
    }

    /// Get variables as string map
    pub fn variables_as_string_map(&self) -> HashMap<String, String> {
        self.variables
            .iter()
            .filter_map(|(k, v)| scalar_to_string(v).ok().map(|v| (k.clone(), v)))
            .collect()
    }

    /// Convert config to a Pipeline domain model
    pub fn to_pipeline(&self) -> Result<Pipeline> {
        Pipeline::from_config(self)
    }
}
