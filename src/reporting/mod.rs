//! Reporting forwarder - ships job artifacts to external reporting sinks

pub mod command_sink;

use crate::core::{
    context::{Secret, SecretStore},
    job::ReportSpec,
    state::{ReportOutcome, ReportRecord, Tolerance},
};
use crate::environment::ProvisionedEnvironment;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{error, info, warn};

pub use command_sink::CommandSink;

/// Why a sink did not accept an artifact
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("artifact {0} does not exist")]
    MissingArtifact(PathBuf),

    #[error("credentials '{0}' are not available")]
    MissingCredentials(String),

    #[error("sink unavailable: {0}")]
    Unavailable(String),

    #[error("sink rejected the report: {0}")]
    Rejected(String),

    /// The job ran out of time while the sink was sending
    #[error("job timeout reached while sending")]
    TimedOut,
}

/// Everything a sink needs to upload one artifact
#[derive(Debug, Clone)]
pub struct ReportRequest {
    pub sink_id: String,
    /// Absolute path of the artifact inside the workspace
    pub artifact: PathBuf,
    pub format: String,
    pub workspace: PathBuf,
    /// Variables of the provisioned environment
    pub env: BTreeMap<String, String>,
}

/// Trait for reporting sinks - allows for different implementations
#[async_trait]
pub trait ReportingSink: Send + Sync {
    async fn send(&self, request: &ReportRequest, credentials: Option<&Secret>) -> Result<(), SinkError>;
}

/// Registry of sinks by id
#[derive(Clone, Default)]
pub struct ReportingForwarder {
    sinks: HashMap<String, Arc<dyn ReportingSink>>,
}

impl ReportingForwarder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sink(mut self, id: impl Into<String>, sink: Arc<dyn ReportingSink>) -> Self {
        self.sinks.insert(id.into(), sink);
        self
    }

    /// Forward each declared artifact; sinks are independent of one another
    pub async fn forward(
        &self,
        specs: &[ReportSpec],
        env: &ProvisionedEnvironment,
        secrets: &dyn SecretStore,
        deadline: Option<Instant>,
    ) -> Vec<ReportRecord> {
        let mut records = Vec::with_capacity(specs.len());
        for spec in specs {
            let outcome = match self.send_one(spec, env, secrets, deadline).await {
                Ok(()) => {
                    info!("Report '{}' sent to {}", spec.artifact, spec.id);
                    ReportOutcome::Sent
                }
                Err(e) => {
                    // The job deadline fails the job whatever the sink tolerates
                    let tolerance = match e {
                        SinkError::TimedOut => Tolerance::Fatal,
                        _ => Tolerance::from_continue_on_error(spec.continue_on_error),
                    };
                    match tolerance {
                        Tolerance::Fatal => error!("Sink {} failed: {}", spec.id, e),
                        Tolerance::Tolerated => warn!("Sink {} failed (tolerated): {}", spec.id, e),
                    }
                    ReportOutcome::Failed {
                        error: e.to_string(),
                        tolerance,
                    }
                }
            };
            records.push(ReportRecord {
                sink_id: spec.id.clone(),
                artifact: spec.artifact.clone(),
                format: spec.format.clone(),
                outcome,
            });
        }
        records
    }

    async fn send_one(
        &self,
        spec: &ReportSpec,
        env: &ProvisionedEnvironment,
        secrets: &dyn SecretStore,
        deadline: Option<Instant>,
    ) -> Result<(), SinkError> {
        let artifact = env.workspace.join(&spec.artifact);
        match tokio::fs::metadata(&artifact).await {
            Ok(meta) if meta.is_file() => {}
            _ => return Err(SinkError::MissingArtifact(artifact)),
        }

        let credentials = match &spec.credentials {
            Some(name) => Some(
                secrets
                    .resolve(name)
                    .ok_or_else(|| SinkError::MissingCredentials(name.clone()))?,
            ),
            None => None,
        };

        let sink: Arc<dyn ReportingSink> = match (self.sinks.get(&spec.id), &spec.command) {
            (Some(sink), _) => sink.clone(),
            (None, Some(command)) => Arc::new(CommandSink::new(command.clone())),
            (None, None) => {
                return Err(SinkError::Unavailable(format!(
                    "no sink registered for '{}' and no command declared",
                    spec.id
                )))
            }
        };

        let request = ReportRequest {
            sink_id: spec.id.clone(),
            artifact,
            format: spec.format.clone(),
            workspace: env.workspace.clone(),
            env: env.env.clone(),
        };

        let send = sink.send(&request, credentials.as_ref());
        match deadline {
            Some(deadline) => tokio::time::timeout_at(deadline, send)
                .await
                .map_err(|_| SinkError::TimedOut)?,
            None => send.await,
        }
    }
}
