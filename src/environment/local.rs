//! Provisioner backed by the local filesystem and the docker CLI

use crate::environment::{
    services::{DockerServiceRuntime, ServiceRuntime},
    ProvisionError, ProvisionRequest, ProvisionedEnvironment, Provisioner,
};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::process::Command;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Provisions a fresh directory per job, optionally checked out from a git
/// source, with runtimes resolved from a toolchain root and services started
/// as containers.
pub struct LocalProvisioner {
    work_root: PathBuf,
    source: Option<PathBuf>,
    runtime_root: Option<PathBuf>,
    services: Arc<dyn ServiceRuntime>,
    keep_workspace: bool,
}

impl LocalProvisioner {
    pub fn new(work_root: impl Into<PathBuf>) -> Self {
        Self {
            work_root: work_root.into(),
            source: None,
            runtime_root: None,
            services: Arc::new(DockerServiceRuntime::default()),
            keep_workspace: false,
        }
    }

    /// Repository checked out into every workspace
    pub fn with_source(mut self, source: impl Into<PathBuf>) -> Self {
        self.source = Some(source.into());
        self
    }

    /// Directory holding `<kind>/<version>/bin` toolchains
    pub fn with_runtime_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.runtime_root = Some(root.into());
        self
    }

    pub fn with_service_runtime(mut self, services: Arc<dyn ServiceRuntime>) -> Self {
        self.services = services;
        self
    }

    /// Leave workspaces on disk after release
    pub fn keep_workspace(mut self, keep: bool) -> Self {
        self.keep_workspace = keep;
        self
    }

    fn workspace_for(&self, request: &ProvisionRequest) -> PathBuf {
        self.work_root
            .join(request.execution_id.to_string())
            .join(&request.job_slug)
    }

    async fn checkout(
        &self,
        source: &Path,
        workspace: &Path,
        git_ref: &str,
        deadline: Option<Instant>,
    ) -> Result<(), ProvisionError> {
        let failed = |reason: String| ProvisionError::Checkout {
            git_ref: git_ref.to_string(),
            reason,
        };

        let source = source.display().to_string();
        let ws = workspace.display().to_string();
        let steps: [Vec<&str>; 3] = [
            vec!["clone", "--quiet", source.as_str(), ws.as_str()],
            vec!["-C", ws.as_str(), "fetch", "--quiet", "origin", git_ref],
            vec!["-C", ws.as_str(), "checkout", "--quiet", "FETCH_HEAD"],
        ];

        for args in steps.iter() {
            if deadline.is_some_and(|d| Instant::now() >= d) {
                return Err(failed("job timeout reached during checkout".to_string()));
            }
            debug!("git {}", args.join(" "));
            let git = Command::new("git").args(args).kill_on_drop(true).output();
            let output = match deadline {
                Some(deadline) => tokio::time::timeout_at(deadline, git)
                    .await
                    .map_err(|_| failed("job timeout reached during checkout".to_string()))?,
                None => git.await,
            }
            .map_err(|e| failed(format!("failed to execute git: {}", e)))?;
            if !output.status.success() {
                return Err(failed(String::from_utf8_lossy(&output.stderr).trim().to_string()));
            }
        }
        Ok(())
    }

    fn resolve_runtime(&self, request: &ProvisionRequest, env: &mut ProvisionedEnvironment) -> Result<(), ProvisionError> {
        let Some(runtime) = &request.runtime else {
            return Ok(());
        };

        env.set_env("CI_RUNTIME", runtime.kind.as_str());
        env.set_env("CI_RUNTIME_VERSION", runtime.version.as_str());

        if let Some(root) = &self.runtime_root {
            let bin = root.join(&runtime.kind).join(&runtime.version).join("bin");
            if !bin.is_dir() {
                return Err(ProvisionError::Runtime {
                    kind: runtime.kind.clone(),
                    version: runtime.version.clone(),
                    reason: format!("{} does not exist", bin.display()),
                });
            }
            let path = match std::env::var("PATH") {
                Ok(existing) if !existing.is_empty() => format!("{}:{}", bin.display(), existing),
                _ => bin.display().to_string(),
            };
            env.set_env("PATH", path);
        }
        Ok(())
    }

    async fn start_services(&self, request: &ProvisionRequest, env: &mut ProvisionedEnvironment) -> Result<(), ProvisionError> {
        for service in &request.services {
            let container_name = format!(
                "ci-{}-{}-{}",
                &request.execution_id.simple().to_string()[..8],
                request.job_slug,
                service.name
            );
            let (id, endpoint) = self.services.start(service, &container_name).await?;
            info!("Service {} for {} listening on {}", service.name, request.job_name, endpoint);
            env.add_container(id);
            env.add_service(&service.name, endpoint);
        }
        Ok(())
    }

    async fn teardown(&self, env: &ProvisionedEnvironment) {
        for container in env.containers() {
            self.services.stop(container).await;
        }
        if !self.keep_workspace {
            if let Err(e) = tokio::fs::remove_dir_all(&env.workspace).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!("Failed to remove workspace {}: {}", env.workspace.display(), e);
                }
            }
        }
    }
}

#[async_trait]
impl Provisioner for LocalProvisioner {
    async fn provision(&self, request: &ProvisionRequest) -> Result<ProvisionedEnvironment, ProvisionError> {
        let workspace = self.workspace_for(request);

        if let Some(parent) = workspace.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| ProvisionError::Workspace {
                    path: parent.to_path_buf(),
                    source,
                })?;
        }

        match &self.source {
            // git clone creates the directory itself
            Some(source) => {
                if let Err(e) = self.checkout(source, &workspace, &request.git_ref, request.deadline).await {
                    let _ = tokio::fs::remove_dir_all(&workspace).await;
                    return Err(e);
                }
            }
            None => tokio::fs::create_dir_all(&workspace)
                .await
                .map_err(|source| ProvisionError::Workspace {
                    path: workspace.clone(),
                    source,
                })?,
        }

        let mut env = ProvisionedEnvironment::new(workspace);
        env.set_env("CI_REF", request.git_ref.as_str());

        let prepared = match self.resolve_runtime(request, &mut env) {
            Ok(()) => self.start_services(request, &mut env).await,
            Err(e) => Err(e),
        };

        if let Err(e) = prepared {
            // Roll back whatever was acquired before the failure
            self.teardown(&env).await;
            return Err(e);
        }

        debug!("Provisioned {} at {}", request.job_name, env.workspace.display());
        Ok(env)
    }

    async fn release(&self, environment: &ProvisionedEnvironment) {
        debug!("Releasing environment {}", environment.handle_id);
        self.teardown(environment).await;
    }
}
