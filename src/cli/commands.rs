//! CLI command definitions

use crate::core::EventKind;
use crate::execution::SchedulingStrategy;
use clap::Args;
use std::path::PathBuf;

/// Run the pipelines triggered by an event
#[derive(Debug, Args, Clone)]
pub struct RunCommand {
    /// Pipeline YAML files
    #[arg(short, long = "file", required = true)]
    pub files: Vec<PathBuf>,

    /// Repository event kind (push, pull_request)
    #[arg(long, env = "CI_EVENT", default_value = "push")]
    pub event: EventKind,

    /// Git ref of the event (refs/heads/<branch>, refs/tags/<tag>)
    #[arg(long = "ref", env = "CI_REF", default_value = "refs/heads/master")]
    pub git_ref: String,

    /// Variable overrides (key=value)
    #[arg(long, value_parser = parse_key_value)]
    pub variable: Vec<(String, String)>,

    /// Git repository checked out into each job workspace
    #[arg(long)]
    pub source: Option<PathBuf>,

    /// Root directory for job workspaces
    #[arg(long)]
    pub work_dir: Option<PathBuf>,

    /// Directory holding <kind>/<version>/bin runtimes
    #[arg(long)]
    pub runtime_root: Option<PathBuf>,

    /// Directory holding <name>/<version>/run actions
    #[arg(long)]
    pub actions_dir: Option<PathBuf>,

    /// Override job scheduling: sequential, parallel, or a job count
    #[arg(long)]
    pub strategy: Option<SchedulingStrategy>,

    /// Keep workspaces after jobs finish
    #[arg(long)]
    pub keep_workspace: bool,

    /// Don't save runs to history
    #[arg(long)]
    pub no_history: bool,

    /// Print run results as JSON
    #[arg(long)]
    pub json: bool,
}

/// Validate pipeline configurations
#[derive(Debug, Args, Clone)]
pub struct ValidateCommand {
    /// Pipeline YAML files
    #[arg(short, long = "file", required = true)]
    pub files: Vec<PathBuf>,

    /// Output in JSON format
    #[arg(long)]
    pub json: bool,
}

/// Show the job instances of a pipeline
#[derive(Debug, Args, Clone)]
pub struct ExpandCommand {
    /// Pipeline YAML file
    #[arg(short, long)]
    pub file: PathBuf,

    /// Output in JSON format
    #[arg(long)]
    pub json: bool,
}

/// List pipelines with recorded runs
#[derive(Debug, Args, Clone)]
pub struct ListCommand {
    /// Show run counts
    #[arg(long)]
    pub with_counts: bool,

    /// Output in JSON format
    #[arg(long)]
    pub json: bool,
}

/// Show run history
#[derive(Debug, Args, Clone)]
pub struct HistoryCommand {
    /// Pipeline name to filter by
    #[arg(short, long)]
    pub pipeline: Option<String>,

    /// Number of recent runs to show
    #[arg(short, long, default_value_t = 10)]
    pub limit: usize,

    /// Show job details
    #[arg(long)]
    pub verbose: bool,

    /// Output in JSON format
    #[arg(long)]
    pub json: bool,

    /// Show a specific run
    #[arg(long)]
    pub execution_id: Option<String>,
}

/// Parse key=value pairs
pub fn parse_key_value(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("Invalid key=value pair: {}", s)),
    }
}
