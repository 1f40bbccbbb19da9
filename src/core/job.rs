//! Job instance model - one concrete, fully rendered matrix combination

use crate::core::{matrix::MatrixCombination, step::Step};
use serde::{Deserialize, Serialize};

/// Language runtime requested by a job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeSpec {
    pub kind: String,
    pub version: String,
}

/// Auxiliary service container requested by a job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceSpec {
    /// Name used for endpoint lookup and exported variables
    pub name: String,
    pub image: String,
    pub version: Option<String>,
    /// Container port exposed to the job
    pub port: u16,
    pub env: Vec<(String, String)>,
}

impl ServiceSpec {
    /// Image reference with the version as tag
    pub fn image_ref(&self) -> String {
        match &self.version {
            Some(version) => format!("{}:{}", self.image, version),
            None => self.image.clone(),
        }
    }
}

/// Artifact forwarding request for one reporting sink
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportSpec {
    pub id: String,
    /// Artifact path relative to the workspace
    pub artifact: String,
    pub format: String,
    /// Name of the secret holding the sink credentials
    pub credentials: Option<String>,
    /// Uploader command used when no sink is registered under `id`
    pub command: Option<String>,
    pub continue_on_error: bool,
}

/// A concrete job produced by matrix expansion
#[derive(Debug, Clone)]
pub struct JobInstance {
    /// Position in expansion order
    pub index: usize,
    pub name: String,
    pub pipeline_name: String,
    pub attributes: MatrixCombination,
    pub steps: Vec<Step>,
    pub runtime: Option<RuntimeSpec>,
    pub services: Vec<ServiceSpec>,
    pub reporting: Vec<ReportSpec>,
    pub timeout_secs: Option<u64>,
}

impl JobInstance {
    /// Filesystem- and container-name-safe identifier
    pub fn slug(&self) -> String {
        let mut slug = String::with_capacity(self.name.len());
        let mut last_dash = false;
        for c in self.name.chars() {
            if c.is_ascii_alphanumeric() || c == '.' || c == '_' {
                slug.push(c.to_ascii_lowercase());
                last_dash = false;
            } else if !last_dash && !slug.is_empty() {
                slug.push('-');
                last_dash = true;
            }
        }
        while slug.ends_with('-') {
            slug.pop();
        }
        format!("{}-{}", self.index, slug)
    }

    /// Environment variables describing the job to its steps
    pub fn job_env(&self) -> Vec<(String, String)> {
        let mut env = vec![
            ("CI".to_string(), "true".to_string()),
            ("CI_PIPELINE".to_string(), self.pipeline_name.clone()),
            ("CI_JOB_NAME".to_string(), self.name.clone()),
        ];
        for (key, value) in self.attributes.iter() {
            env.push((format!("MATRIX_{}", env_key(key)), value.to_string()));
        }
        env
    }
}

/// Upper-case a name into an environment variable key
pub fn env_key(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect()
}
