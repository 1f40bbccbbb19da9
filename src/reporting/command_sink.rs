//! Sink that runs an uploader command in the workspace

use crate::core::context::{mask_secrets, Secret};
use crate::execution::executor::{run_shell, StepError};
use crate::reporting::{ReportRequest, ReportingSink, SinkError};
use async_trait::async_trait;
use tracing::debug;

/// Runs `sh -c <command>` with `REPORT_ARTIFACT`, `REPORT_FORMAT` and
/// `REPORT_TOKEN` exported
#[derive(Debug, Clone)]
pub struct CommandSink {
    command: String,
    shell: String,
}

impl CommandSink {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            shell: "sh".to_string(),
        }
    }

    fn environment(request: &ReportRequest, credentials: Option<&Secret>) -> Vec<(String, String)> {
        let mut env: Vec<(String, String)> = request
            .env
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        env.push(("REPORT_ARTIFACT".to_string(), request.artifact.display().to_string()));
        env.push(("REPORT_FORMAT".to_string(), request.format.clone()));
        if let Some(secret) = credentials {
            env.push(("REPORT_TOKEN".to_string(), secret.expose().to_string()));
        }
        env
    }
}

#[async_trait]
impl ReportingSink for CommandSink {
    async fn send(&self, request: &ReportRequest, credentials: Option<&Secret>) -> Result<(), SinkError> {
        debug!("Sink {} running: {}", request.sink_id, self.command);
        let env = Self::environment(request, credentials);
        let secrets: Vec<Secret> = credentials.into_iter().cloned().collect();

        match run_shell(&self.shell, &self.command, &request.workspace, &env).await {
            Ok(_) => Ok(()),
            Err(e @ StepError::Spawn { .. }) => Err(SinkError::Unavailable(e.to_string())),
            Err(e) => Err(SinkError::Rejected(mask_secrets(&e.to_string(), &secrets))),
        }
    }
}
