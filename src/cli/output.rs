//! CLI output formatting

use crate::{
    core::{JobInstance, JobRunResult, JobStatus, PipelineRunResult, ReportOutcome, RunStatus, StepOutcome, Tolerance},
    execution::ExecutionEvent,
    persistence::RunSummary,
};
use console::Emoji;
use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;

// Re-export style
pub use console::style;

// Emojis for output
pub static CHECK: Emoji<'_, '_> = Emoji("✅ ", "✓ ");
pub static CROSS: Emoji<'_, '_> = Emoji("❌ ", "✗ ");
pub static SPINNER: Emoji<'_, '_> = Emoji("⏳ ", "~ ");
pub static INFO: Emoji<'_, '_> = Emoji("ℹ️  ", "i ");
pub static WARN: Emoji<'_, '_> = Emoji("⚠️  ", "! ");
pub static ROCKET: Emoji<'_, '_> = Emoji("🚀 ", "> ");
pub static SKIP: Emoji<'_, '_> = Emoji("⏭️  ", "- ");

/// Create a progress bar over job instances
pub fn create_progress_bar(total: usize) -> ProgressBar {
    let progress = ProgressBar::new(total as u64);
    let style = ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} jobs {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("#>-");
    progress.set_style(style);
    progress.enable_steady_tick(Duration::from_millis(100));
    progress
}

/// Short form of an execution id
pub fn short_id(id: &uuid::Uuid) -> String {
    id.simple().to_string()[..8].to_string()
}

/// Format a run status for display
pub fn format_status(status: RunStatus) -> String {
    match status {
        RunStatus::Success => style("SUCCESS").green().to_string(),
        RunStatus::Failure => style("FAILURE").red().to_string(),
    }
}

/// Format a job status for display
pub fn format_job_status(status: JobStatus) -> String {
    match status {
        JobStatus::Success => style("SUCCESS").green().to_string(),
        JobStatus::Failure => style("FAILURE").red().to_string(),
        JobStatus::Cancelled => style("CANCELLED").yellow().to_string(),
    }
}

/// Format a step outcome for display
pub fn format_step_outcome(outcome: &StepOutcome) -> String {
    match outcome {
        StepOutcome::Success => style("OK").green().to_string(),
        StepOutcome::Failed { error, tolerance: Tolerance::Fatal } => {
            format!("{} {}", style("FAILED").red(), style(error).dim())
        }
        StepOutcome::Failed { error, tolerance: Tolerance::Tolerated } => {
            format!("{} {}", style("FAILED (tolerated)").yellow(), style(error).dim())
        }
        StepOutcome::TimedOut { after_secs, tolerance } => {
            let label = format!("TIMED OUT after {}s", after_secs);
            match tolerance {
                Tolerance::Fatal => style(label).red().to_string(),
                Tolerance::Tolerated => style(format!("{} (tolerated)", label)).yellow().to_string(),
            }
        }
        StepOutcome::Skipped { reason } => format!("{} {}", style("SKIPPED").dim(), style(reason).dim()),
        StepOutcome::Cancelled => style("CANCELLED").yellow().to_string(),
    }
}

/// Format a report outcome for display
pub fn format_report_outcome(outcome: &ReportOutcome) -> String {
    match outcome {
        ReportOutcome::Sent => style("SENT").green().to_string(),
        ReportOutcome::Failed { error, tolerance: Tolerance::Fatal } => {
            format!("{} {}", style("FAILED").red(), style(error).dim())
        }
        ReportOutcome::Failed { error, tolerance: Tolerance::Tolerated } => {
            format!("{} {}", style("FAILED (tolerated)").yellow(), style(error).dim())
        }
        ReportOutcome::Skipped { reason } => format!("{} {}", style("SKIPPED").dim(), style(reason).dim()),
    }
}

/// Format an execution event; `None` for events not worth a line
pub fn format_execution_event(event: &ExecutionEvent) -> Option<String> {
    let line = match event {
        ExecutionEvent::PipelineStarted {
            execution_id,
            pipeline_name,
            job_count,
        } => format!(
            "{} Starting pipeline {} ({}) with {} job(s)",
            ROCKET,
            style(pipeline_name).bold(),
            style(short_id(execution_id)).dim(),
            job_count
        ),
        ExecutionEvent::PipelineSkipped { pipeline_name, event } => format!(
            "{} {} not triggered by {} on {}",
            SKIP,
            style(pipeline_name).bold(),
            event.kind,
            style(&event.git_ref).dim()
        ),
        ExecutionEvent::JobStarted { job_name, .. } => {
            format!("{} {}", SPINNER, style(job_name).cyan())
        }
        ExecutionEvent::JobProvisioned { .. } | ExecutionEvent::StepStarted { .. } => return None,
        ExecutionEvent::StepFinished {
            job_name,
            step_name,
            outcome,
        } => {
            let icon = match outcome {
                StepOutcome::Success => CHECK,
                o if o.is_fatal() => CROSS,
                StepOutcome::Skipped { .. } | StepOutcome::Cancelled => SKIP,
                _ => WARN,
            };
            format!(
                "  {} {} › {} {}",
                icon,
                style(job_name).dim(),
                step_name,
                format_step_outcome(outcome)
            )
        }
        ExecutionEvent::ReportFinished {
            job_name,
            sink_id,
            outcome,
        } => format!(
            "  {} {} › report {} {}",
            INFO,
            style(job_name).dim(),
            style(sink_id).cyan(),
            format_report_outcome(outcome)
        ),
        ExecutionEvent::JobFinished { job_name, status } => {
            let icon = match status {
                JobStatus::Success => CHECK,
                JobStatus::Failure => CROSS,
                JobStatus::Cancelled => SKIP,
            };
            format!("{} {} {}", icon, style(job_name).bold(), format_job_status(*status))
        }
        ExecutionEvent::PipelineCompleted {
            execution_id,
            pipeline_name,
            status,
        } => format!(
            "{} Pipeline {} ({}) {}",
            INFO,
            style(pipeline_name).bold(),
            style(short_id(execution_id)).dim(),
            format_status(*status)
        ),
    };
    Some(line)
}

/// Detailed per-job report of a finished run
pub fn format_run_result(result: &PipelineRunResult) -> String {
    let mut out = format!(
        "{} {} ({}) {}\n",
        if result.is_success() { CHECK } else { CROSS },
        style(&result.pipeline_name).bold(),
        style(short_id(&result.execution_id)).dim(),
        format_status(result.status)
    );
    for job in &result.jobs {
        out.push_str(&format_job_result(job));
    }
    out
}

/// One job with its steps and reports
pub fn format_job_result(job: &JobRunResult) -> String {
    let mut out = format!("  {} {}\n", style(&job.name).bold(), format_job_status(job.status));
    if let Some(error) = &job.provision_error {
        out.push_str(&format!("    {} {}\n", style("provisioning:").red(), error));
    }
    for step in &job.steps {
        out.push_str(&format!("    {} {}\n", step.name, format_step_outcome(&step.outcome)));
    }
    for report in &job.reports {
        out.push_str(&format!(
            "    report {} ({}) {}\n",
            style(&report.sink_id).cyan(),
            report.artifact,
            format_report_outcome(&report.outcome)
        ));
    }
    out
}

/// Format an expanded job instance
pub fn format_job_instance(job: &JobInstance) -> String {
    let mut out = format!("{:>3}. {}\n", job.index, style(&job.name).bold());
    for (key, value) in job.attributes.iter() {
        out.push_str(&format!("       {} = {}\n", style(key).cyan(), value));
    }
    for step in &job.steps {
        out.push_str(&format!("       - {} ({})\n", step.name, style(step.describe()).dim()));
    }
    out
}

/// Format a stored run summary for display
pub fn format_run_summary(summary: &RunSummary) -> String {
    let status_icon = match summary.status {
        RunStatus::Success => CHECK,
        RunStatus::Failure => CROSS,
    };

    format!(
        "{} {} - {} - {} - {} {} - {}/{} jobs failed - {}",
        status_icon,
        style(short_id(&summary.execution_id)).dim(),
        style(&summary.pipeline_name).bold(),
        format_status(summary.status),
        summary.event_kind,
        summary.git_ref,
        summary.failed_jobs,
        summary.total_jobs,
        style(summary.started_at.format("%Y-%m-%d %H:%M:%S")).dim()
    )
}

pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    if secs < 60 {
        format!("{}s", secs)
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m {}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    }
}
