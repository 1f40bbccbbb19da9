use anyhow::{Context, Result};
use ci_pipeline::cli::commands::{ExpandCommand, HistoryCommand, ListCommand, RunCommand, ValidateCommand};
use ci_pipeline::cli::output::*;
use ci_pipeline::cli::{Cli, Command};
use ci_pipeline::core::{config::PipelineConfig, EnvSecretStore, Pipeline, RepositoryEvent, RunStatus};
use ci_pipeline::environment::LocalProvisioner;
use ci_pipeline::execution::{ExecutionEngine, ExecutionEvent, PipelineRunOutcome, ProcessActionRunner};
use ci_pipeline::persistence::{InMemoryPersistence, PersistenceBackend, RunSummary, SqliteExecutionStore};
use ci_pipeline::reporting::ReportingForwarder;
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{error, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Upper bound on runs read per pipeline by `list`
const HISTORY_SCAN_LIMIT: usize = 10_000;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::from_args();

    // Initialize logging
    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber).context("Failed to set logging subscriber")?;

    // Execute command
    let success = match &cli.command {
        Command::Run(cmd) => run_pipelines(cmd).await?,
        Command::Validate(cmd) => validate_pipelines(cmd)?,
        Command::Expand(cmd) => expand_pipeline(cmd)?,
        Command::List(cmd) => list_pipelines(cmd).await?,
        Command::History(cmd) => show_history(cmd).await?,
    };

    if !success {
        std::process::exit(1);
    }
    Ok(())
}

fn load_pipeline(path: &std::path::Path, overrides: &[(String, String)]) -> Result<Pipeline> {
    let config = PipelineConfig::from_file(path)?;
    let mut pipeline = config
        .to_pipeline()
        .with_context(|| format!("Failed to build pipeline from {}", path.display()))?;

    for (key, value) in overrides {
        pipeline.variables.insert(key.clone(), value.clone());
    }
    Ok(pipeline)
}

async fn open_store(no_history: bool) -> Result<Arc<dyn PersistenceBackend>> {
    if no_history {
        return Ok(Arc::new(InMemoryPersistence::new()));
    }
    match SqliteExecutionStore::with_default_path().await {
        Ok(store) => Ok(Arc::new(store)),
        Err(e) => {
            warn!("Run history unavailable, keeping it in memory: {:#}", e);
            Ok(Arc::new(InMemoryPersistence::new()))
        }
    }
}

async fn run_pipelines(cmd: &RunCommand) -> Result<bool> {
    let mut pipelines = Vec::with_capacity(cmd.files.len());
    for file in &cmd.files {
        let pipeline = load_pipeline(file, &cmd.variable)?;
        println!("{} Loaded pipeline: {}", INFO, style(&pipeline.name).bold());
        pipelines.push(Arc::new(pipeline));
    }
    for (key, value) in &cmd.variable {
        println!(
            "{} Variable override: {} = {}",
            INFO,
            style(key).cyan(),
            style(value).dim()
        );
    }

    let event = RepositoryEvent::new(cmd.event, cmd.git_ref.clone());
    println!("{} Event: {} on {}", INFO, style(event.kind).cyan(), style(&event.git_ref).cyan());

    // Expansion errors (e.g. an override breaking a template) surface before anything runs
    let mut total_jobs = 0;
    for pipeline in pipelines.iter().filter(|p| p.should_run(&event)) {
        total_jobs += pipeline.job_instances()?.len();
    }

    let store = open_store(cmd.no_history).await?;

    let work_root = cmd
        .work_dir
        .clone()
        .unwrap_or_else(|| std::env::temp_dir().join("ci-pipeline"));
    let mut provisioner = LocalProvisioner::new(work_root).keep_workspace(cmd.keep_workspace);
    if let Some(source) = &cmd.source {
        provisioner = provisioner.with_source(source);
    }
    if let Some(root) = &cmd.runtime_root {
        provisioner = provisioner.with_runtime_root(root);
    }

    let progress = create_progress_bar(total_jobs);
    let bar = progress.clone();
    let mut engine = ExecutionEngine::new(
        Arc::new(provisioner),
        Arc::new(ProcessActionRunner::new(cmd.actions_dir.clone())),
        ReportingForwarder::new(),
        Arc::new(EnvSecretStore),
    )
    .with_event_handler(move |event| {
        if let Some(line) = format_execution_event(&event) {
            bar.println(line);
        }
        if matches!(event, ExecutionEvent::JobFinished { .. }) {
            bar.inc(1);
        }
    });
    if let Some(strategy) = cmd.strategy {
        engine = engine.with_strategy(strategy);
    }
    let engine = Arc::new(engine);

    // Ctrl-C cancels every running job; environments are still released
    let shutdown = engine.shutdown_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling running jobs");
            shutdown.cancel();
        }
    });

    let mut set = JoinSet::new();
    for (index, pipeline) in pipelines.iter().enumerate() {
        let engine = engine.clone();
        let pipeline = pipeline.clone();
        let event = event.clone();
        set.spawn(async move { (index, engine.execute(&pipeline, &event).await) });
    }

    let mut outcomes: Vec<(usize, Result<PipelineRunOutcome>)> = Vec::with_capacity(pipelines.len());
    while let Some(joined) = set.join_next().await {
        outcomes.push(joined.context("Pipeline task failed")?);
    }
    outcomes.sort_by_key(|(index, _)| *index);
    progress.finish_and_clear();

    let mut success = true;
    let mut results = Vec::new();
    for (index, outcome) in outcomes {
        let name = &pipelines[index].name;
        match outcome {
            Ok(PipelineRunOutcome::Skipped) => {
                println!("{} {} skipped (not triggered)", SKIP, style(name).bold());
            }
            Ok(PipelineRunOutcome::Completed(result)) => {
                success &= result.is_success();
                if !cmd.json {
                    print!("\n{}", format_run_result(&result));
                }
                if let Err(e) = store.save_run(&RunSummary::from_result(&result)).await {
                    warn!("Failed to save run of '{}': {:#}", name, e);
                }
                results.push(result);
            }
            Err(e) => {
                success = false;
                error!("Pipeline '{}' could not run: {:#}", name, e);
            }
        }
    }

    if cmd.json {
        println!("{}", serde_json::to_string_pretty(&results)?);
    } else if success {
        println!("\n{} All triggered pipelines {}", CHECK, style("succeeded").green());
    } else {
        println!("\n{} {}", CROSS, style("Some pipelines failed").red());
    }

    Ok(success)
}

fn validate_pipelines(cmd: &ValidateCommand) -> Result<bool> {
    println!("{} Validating {} pipeline file(s)...", INFO, cmd.files.len());

    let mut valid = true;
    let mut report = Vec::new();
    for file in &cmd.files {
        match PipelineConfig::from_file(file).and_then(|config| {
            let jobs = config.to_pipeline()?.job_instances()?.len();
            Ok((config, jobs))
        }) {
            Ok((config, jobs)) => {
                println!("{} {} is valid", CHECK, style(file.display()).bold());
                println!("  Name: {}", style(&config.name).bold());
                println!("  Steps: {}", style(config.steps.len()).cyan());
                println!("  Jobs: {}", style(jobs).cyan());
                println!("  Sinks: {}", style(config.reporting.len()).cyan());
                report.push(serde_json::json!({
                    "file": file.display().to_string(),
                    "valid": true,
                    "name": config.name,
                    "jobs": jobs,
                }));
            }
            Err(e) => {
                valid = false;
                println!("{} {} is invalid:", CROSS, style(file.display()).bold());
                println!("  {}", style(format!("{:#}", e)).red());
                report.push(serde_json::json!({
                    "file": file.display().to_string(),
                    "valid": false,
                    "error": format!("{:#}", e),
                }));
            }
        }
    }

    if cmd.json {
        println!("\n{}", serde_json::to_string_pretty(&report)?);
    }
    Ok(valid)
}

fn expand_pipeline(cmd: &ExpandCommand) -> Result<bool> {
    let pipeline = load_pipeline(&cmd.file, &[])?;
    let jobs = pipeline.job_instances()?;

    if cmd.json {
        let data: Vec<_> = jobs
            .iter()
            .map(|job| {
                serde_json::json!({
                    "index": job.index,
                    "name": job.name,
                    "attributes": job.attributes,
                    "steps": job.steps.iter().map(|s| s.name.clone()).collect::<Vec<_>>(),
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&data)?);
        return Ok(true);
    }

    println!(
        "{} {} expands into {} job(s):",
        INFO,
        style(&pipeline.name).bold(),
        style(jobs.len()).cyan()
    );
    for job in &jobs {
        print!("{}", format_job_instance(job));
    }
    Ok(true)
}

async fn list_pipelines(cmd: &ListCommand) -> Result<bool> {
    let store = SqliteExecutionStore::with_default_path().await?;
    let pipelines = store.list_pipelines().await?;

    if pipelines.is_empty() {
        println!("{} No pipelines found in history", INFO);
        return Ok(true);
    }

    let mut json_data = Vec::new();
    println!("{} Pipelines in history:", INFO);
    for pipeline_name in &pipelines {
        let runs = store.list_runs(pipeline_name, HISTORY_SCAN_LIMIT).await?;
        let succeeded = runs.iter().filter(|r| r.status == RunStatus::Success).count();
        let failed = runs.len() - succeeded;

        if cmd.with_counts {
            println!(
                "  {} ({} runs: {} succeeded, {} failed)",
                style(pipeline_name).bold(),
                style(runs.len()).cyan(),
                style(succeeded).green(),
                style(failed).red()
            );
        } else {
            println!("  {}", style(pipeline_name).bold());
        }
        json_data.push(serde_json::json!({
            "name": pipeline_name,
            "run_count": runs.len(),
            "succeeded": succeeded,
            "failed": failed,
        }));
    }

    if cmd.json {
        let data = serde_json::json!({ "pipelines": json_data });
        println!("\n{}", serde_json::to_string_pretty(&data)?);
    }

    Ok(true)
}

async fn show_history(cmd: &HistoryCommand) -> Result<bool> {
    let store = SqliteExecutionStore::with_default_path().await?;

    if let Some(exec_id_str) = &cmd.execution_id {
        let exec_id = uuid::Uuid::parse_str(exec_id_str).context("Invalid execution ID format")?;
        match store.load_run(exec_id).await? {
            Some(summary) => print_run_details(&summary, cmd.verbose, cmd.json)?,
            None => println!("{} Run not found", WARN),
        }
        return Ok(true);
    }

    let runs = match &cmd.pipeline {
        Some(pipeline_name) => store.list_runs(pipeline_name, cmd.limit).await?,
        None => {
            let mut all_runs = Vec::new();
            for pipeline in store.list_pipelines().await? {
                all_runs.extend(store.list_runs(&pipeline, cmd.limit).await?);
            }
            all_runs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
            all_runs.truncate(cmd.limit);
            all_runs
        }
    };

    if cmd.json {
        let data = serde_json::json!({ "runs": runs });
        println!("{}", serde_json::to_string_pretty(&data)?);
        return Ok(true);
    }

    if runs.is_empty() {
        println!("{} No runs found", INFO);
        return Ok(true);
    }

    println!("{} Run history (showing latest {}):", INFO, cmd.limit);
    for summary in &runs {
        println!("  {}", format_run_summary(summary));
        if cmd.verbose {
            for job in &summary.jobs {
                print!("  {}", format_job_result(job));
            }
        }
    }

    Ok(true)
}

fn print_run_details(summary: &RunSummary, verbose: bool, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(summary)?);
        return Ok(());
    }

    println!("{} Run Details", INFO);
    println!("  ID: {}", style(summary.execution_id).cyan());
    println!("  Pipeline: {}", style(&summary.pipeline_name).bold());
    println!("  Event: {} on {}", summary.event_kind, summary.git_ref);
    println!("  Status: {}", format_status(summary.status));
    println!("  Started: {}", style(summary.started_at.to_rfc3339()).dim());
    println!("  Completed: {}", style(summary.completed_at.to_rfc3339()).dim());
    if let Ok(duration) = summary.completed_at.signed_duration_since(summary.started_at).to_std() {
        println!("  Duration: {}", style(format_duration(duration)).dim());
    }
    println!("  Jobs: {} ({} failed)", summary.total_jobs, summary.failed_jobs);

    if verbose {
        for job in &summary.jobs {
            print!("{}", format_job_result(job));
        }
    }

    Ok(())
}
