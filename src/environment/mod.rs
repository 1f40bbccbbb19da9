//! Environment provisioning for job instances
//!
//! A provisioner prepares an isolated execution context per job (workspace,
//! runtime, service containers). Every environment it hands out must be
//! released exactly once, whatever happened to the job.

pub mod local;
pub mod services;

use crate::core::{
    job::{env_key, JobInstance, RuntimeSpec, ServiceSpec},
    trigger::RepositoryEvent,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

pub use local::LocalProvisioner;
pub use services::{DockerServiceRuntime, ServiceRuntime};

/// Error types for provisioning
#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("failed to prepare workspace {path}: {source}")]
    Workspace {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("checkout of {git_ref} failed: {reason}")]
    Checkout { git_ref: String, reason: String },

    #[error("runtime {kind} {version} unavailable: {reason}")]
    Runtime {
        kind: String,
        version: String,
        reason: String,
    },

    #[error("service '{name}' failed to start: {reason}")]
    Service { name: String, reason: String },
}

/// What a job needs from its environment
#[derive(Debug, Clone)]
pub struct ProvisionRequest {
    pub execution_id: Uuid,
    pub job_name: String,
    pub job_slug: String,
    pub git_ref: String,
    pub runtime: Option<RuntimeSpec>,
    pub services: Vec<ServiceSpec>,
    /// End of the job's wall-clock budget
    pub deadline: Option<Instant>,
}

impl ProvisionRequest {
    pub fn for_job(execution_id: Uuid, job: &JobInstance, event: &RepositoryEvent, deadline: Option<Instant>) -> Self {
        Self {
            execution_id,
            job_name: job.name.clone(),
            job_slug: job.slug(),
            git_ref: event.git_ref.clone(),
            runtime: job.runtime.clone(),
            services: job.services.clone(),
            deadline,
        }
    }
}

/// Network address of a running service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceEndpoint {
    pub host: String,
    pub port: u16,
}

impl fmt::Display for ServiceEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// A provisioned execution context, owned by exactly one job
#[derive(Debug)]
pub struct ProvisionedEnvironment {
    pub handle_id: Uuid,
    /// Working directory shared by the steps of the job
    pub workspace: PathBuf,
    pub service_endpoints: BTreeMap<String, ServiceEndpoint>,
    /// Variables exported to every step
    pub env: BTreeMap<String, String>,
    containers: Vec<String>,
    released: AtomicBool,
}

impl ProvisionedEnvironment {
    pub fn new(workspace: PathBuf) -> Self {
        let mut env = BTreeMap::new();
        env.insert("CI_WORKSPACE".to_string(), workspace.display().to_string());
        Self {
            handle_id: Uuid::new_v4(),
            workspace,
            service_endpoints: BTreeMap::new(),
            env,
            containers: Vec::new(),
            released: AtomicBool::new(false),
        }
    }

    /// Register a service endpoint and export `<NAME>_HOST` / `<NAME>_PORT`
    pub fn add_service(&mut self, name: &str, endpoint: ServiceEndpoint) {
        let prefix = env_key(name);
        self.env.insert(format!("{}_HOST", prefix), endpoint.host.clone());
        self.env.insert(format!("{}_PORT", prefix), endpoint.port.to_string());
        self.service_endpoints.insert(name.to_string(), endpoint);
    }

    pub fn set_env(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.env.insert(key.into(), value.into());
    }

    /// Track a container that must be removed on release
    pub fn add_container(&mut self, id: impl Into<String>) {
        self.containers.push(id.into());
    }

    pub fn containers(&self) -> &[String] {
        &self.containers
    }

    /// Flip the released flag; true only for the first caller
    pub fn mark_released(&self) -> bool {
        !self.released.swap(true, Ordering::SeqCst)
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }
}

/// Trait for environment provisioning - allows for different implementations
#[async_trait]
pub trait Provisioner: Send + Sync {
    /// Acquire an isolated environment for one job
    async fn provision(&self, request: &ProvisionRequest) -> Result<ProvisionedEnvironment, ProvisionError>;

    /// Tear down everything acquired for the environment
    ///
    /// Callers go through [`release_environment`], which guarantees a single
    /// call per environment.
    async fn release(&self, environment: &ProvisionedEnvironment);
}

/// Release an environment once; later calls are no-ops
pub async fn release_environment(provisioner: &dyn Provisioner, environment: &ProvisionedEnvironment) -> bool {
    if environment.mark_released() {
        provisioner.release(environment).await;
        true
    } else {
        debug!("Environment {} already released", environment.handle_id);
        false
    }
}
