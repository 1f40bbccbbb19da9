//! Service containers through the docker CLI

use crate::core::job::ServiceSpec;
use crate::environment::{ProvisionError, ServiceEndpoint};
use async_trait::async_trait;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, warn};

/// Starts and stops auxiliary service containers
#[async_trait]
pub trait ServiceRuntime: Send + Sync {
    /// Start a container; returns its id and the endpoint reachable from the job
    async fn start(&self, service: &ServiceSpec, container_name: &str) -> Result<(String, ServiceEndpoint), ProvisionError>;

    /// Remove a container; failures are logged, never propagated
    async fn stop(&self, container_id: &str);
}

/// Client for the docker CLI
#[derive(Debug, Clone)]
pub struct DockerServiceRuntime {
    /// Path to docker executable
    docker_path: String,

    /// Timeout for each docker invocation in seconds
    timeout_secs: u64,
}

impl Default for DockerServiceRuntime {
    fn default() -> Self {
        Self::new("docker".to_string(), 300)
    }
}

impl DockerServiceRuntime {
    pub fn new(docker_path: String, timeout_secs: u64) -> Self {
        Self {
            docker_path,
            timeout_secs,
        }
    }

    /// Arguments for `docker run`
    fn run_args(service: &ServiceSpec, container_name: &str) -> Vec<String> {
        let mut args = vec![
            "run".to_string(),
            "--detach".to_string(),
            "--rm".to_string(),
            "--name".to_string(),
            container_name.to_string(),
            "--publish".to_string(),
            format!("127.0.0.1::{}", service.port),
        ];
        for (key, value) in &service.env {
            args.push("--env".to_string());
            args.push(format!("{}={}", key, value));
        }
        args.push(service.image_ref());
        args
    }

    async fn docker(&self, args: &[String]) -> Result<String, String> {
        debug!("Running {} {}", self.docker_path, args.join(" "));
        let output = timeout(
            Duration::from_secs(self.timeout_secs),
            Command::new(&self.docker_path)
                .args(args)
                .kill_on_drop(true)
                .output(),
        )
        .await
        .map_err(|_| format!("docker timed out after {} seconds", self.timeout_secs))?
        .map_err(|e| format!("failed to execute docker: {}", e))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(format!(
                "docker exited with code {}: {}",
                output.status.code().unwrap_or(-1),
                stderr.trim()
            ));
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

/// Parse the host port out of `docker port` output (`127.0.0.1:49153`)
pub fn parse_published_port(output: &str) -> Option<u16> {
    output
        .lines()
        .filter_map(|line| line.trim().rsplit_once(':'))
        .find_map(|(_, port)| port.parse().ok())
}

#[async_trait]
impl ServiceRuntime for DockerServiceRuntime {
    async fn start(&self, service: &ServiceSpec, container_name: &str) -> Result<(String, ServiceEndpoint), ProvisionError> {
        let failed = |reason: String| ProvisionError::Service {
            name: service.name.clone(),
            reason,
        };

        let container_id = self
            .docker(&Self::run_args(service, container_name))
            .await
            .map_err(failed)?;

        let port_args = vec![
            "port".to_string(),
            container_id.clone(),
            format!("{}/tcp", service.port),
        ];
        let port = match self.docker(&port_args).await {
            Ok(output) => parse_published_port(&output)
                .ok_or_else(|| format!("unexpected docker port output: {}", output)),
            Err(e) => Err(e),
        };

        match port {
            Ok(port) => Ok((
                container_id,
                ServiceEndpoint {
                    host: "127.0.0.1".to_string(),
                    port,
                },
            )),
            Err(reason) => {
                self.stop(&container_id).await;
                Err(failed(reason))
            }
        }
    }

    async fn stop(&self, container_id: &str) {
        let args = vec!["rm".to_string(), "--force".to_string(), container_id.to_string()];
        if let Err(e) = self.docker(&args).await {
            warn!("Failed to remove container {}: {}", container_id, e);
        }
    }
}
