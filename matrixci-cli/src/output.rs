// Terminal rendering of runs, job instances and their steps
//
// Everything goes to stderr; stdout is reserved for reports, requirements
// files and JSON listings.

use std::time::Duration;

use pipeline_orchestrator::coverage::{ForwardOutcome, SuppressReason};
use pipeline_orchestrator::execution::{DriftFinding, LogLevel};
use pipeline_orchestrator::{JobSpec, JobStatus, PipelineOutcome, PipelineStatus, StepKind, StepOutcome};

const BOLD: &str = "1";
const DIM: &str = "2";
const RED: &str = "31";
const GREEN: &str = "32";
const YELLOW: &str = "33";
const CYAN: &str = "36";
const BOLD_BLUE: &str = "1;34";
const BOLD_CYAN: &str = "1;36";
const BOLD_RED: &str = "1;31";

fn paint(code: &str, text: &str) -> String {
    format!("\x1b[{}m{}\x1b[0m", code, text)
}

fn seconds(duration: &Duration) -> String {
    format!("{:.2}s", duration.as_secs_f64())
}

/// Right-aligned action word, as in `   Validating ci/pipeline.yml`.
pub fn action(verb: &str, subject: &str) {
    eprintln!("{} {}", paint(BOLD_CYAN, &format!("{:>12}", verb)), subject);
}

pub fn check(message: &str) {
    eprintln!("  {} {}", paint(GREEN, "\u{2713}"), message);
}

pub fn note(message: &str) {
    eprintln!("  {} {}", paint(CYAN, "i"), message);
}

pub fn warning(message: &str) {
    eprintln!("  {} {}", paint(YELLOW, "!"), message);
}

pub fn error(message: &str) {
    eprintln!("{} {}", paint(BOLD_RED, "error:"), message);
}

/// Section line for a job or a run.
pub fn section(title: &str) {
    eprintln!("{}", paint(BOLD, &format!("==> {}", title)));
}

/// One row of a validation summary.
pub fn job_summary(job: &str, role: &str, instances: usize) {
    let plural = if instances == 1 { "" } else { "s" };
    eprintln!("{}", paint(DIM, &format!("    {} ({}): {} instance{}", job, role, instances, plural)));
}

/// Identifier and display name of one expanded instance.
pub fn instance_row(spec: &JobSpec) -> String {
    let minimum = if spec.is_minimum_version() { "  (minimum versions)" } else { "" };
    format!("  {:<40} {}{}", spec.id(), spec.display_name, minimum)
}

pub fn run_started(workflow: &str, group: &str, instances: usize) {
    section(&format!("Workflow '{}' ({} job instances, group '{}')", workflow, instances, group));
}

pub fn run_finished(status: PipelineStatus, duration: &Duration) {
    let line = format!("Pipeline {} in {}", status, seconds(duration));
    match status {
        PipelineStatus::Succeeded | PipelineStatus::Skipped => check(&line),
        PipelineStatus::Cancelled => warning(&line),
        PipelineStatus::Failed => eprintln!("  {} {}", paint(BOLD_RED, "\u{2717}"), line),
    }
}

/// `pytest[ubuntu-latest,3.10]` followed by its display name when the two differ.
pub fn instance_label(job: &str, display_name: &str) -> String {
    if display_name.is_empty() || display_name == job {
        job.to_string()
    } else {
        format!("{}  {}", job, display_name)
    }
}

pub fn instance_started(job: &str, display_name: &str, total_steps: usize) {
    eprintln!(
        "{} {} ({} steps)",
        paint(BOLD_BLUE, "  Job"),
        instance_label(job, display_name),
        total_steps
    );
}

pub fn instance_finished(job: &str, status: JobStatus, duration: &Duration) {
    let line = format!("    {} {} ({})", job, status, seconds(duration));
    match status {
        JobStatus::Succeeded => eprintln!("{}", paint(GREEN, &line)),
        JobStatus::Failed => eprintln!("{}", paint(RED, &line)),
        JobStatus::Cancelled => eprintln!("{}", paint(DIM, &line)),
    }
}

pub fn step_started(step: StepKind, step_index: usize) {
    eprintln!("{}", paint(DIM, &format!("      [{}] {}", step_index + 1, step)));
}

/// Status word and timing of a finished step. Partition steps carry their
/// pass/fail counts in the message, which follows as indented tool output.
pub fn step_finished(step: StepKind, outcome: StepOutcome, message: Option<&str>, duration: &Duration) {
    let (word, code) = match outcome {
        StepOutcome::Success => ("OK", GREEN),
        StepOutcome::Failure => ("FAIL", RED),
        StepOutcome::Skipped => ("SKIP", DIM),
    };
    eprintln!("{}", paint(code, &format!("        {:<4} {} ({})", word, step, seconds(duration))));
    for line in message.into_iter().flat_map(str::lines) {
        eprintln!("        | {}", line);
    }
}

pub fn coverage_line(job: &str, outcome: &ForwardOutcome) -> String {
    match outcome {
        ForwardOutcome::Forwarded => format!("coverage for {} forwarded", job),
        ForwardOutcome::Suppressed(SuppressReason::MergeGroup) => {
            format!("coverage for {} withheld (merge group run)", job)
        }
        ForwardOutcome::Suppressed(SuppressReason::Cancelled) => {
            format!("coverage for {} withheld (instance cancelled)", job)
        }
    }
}

pub fn coverage(job: &str, outcome: &ForwardOutcome) {
    eprintln!("{}", paint(DIM, &format!("        {}", coverage_line(job, outcome))));
}

/// Advisory from the orchestrator, prefixed with the instance it concerns.
pub fn advisory(level: LogLevel, job: Option<&str>, message: &str) {
    let line = match job {
        Some(job) => format!("{}: {}", job, message),
        None => message.to_string(),
    };
    match level {
        LogLevel::Warning => warning(&line),
        LogLevel::Info => note(&line),
    }
}

/// `six: 1.16.0 (pytest[3.10,true]) | 1.17.0 (pytest[3.11,true])`
pub fn drift_line(finding: &DriftFinding) -> String {
    let versions: Vec<String> = finding
        .versions
        .iter()
        .map(|(version, jobs)| format!("{} ({})", version, jobs.join(", ")))
        .collect();
    format!("{}: {}", finding.package, versions.join(" | "))
}

/// Per-status instance counts and every drift finding of a finished run.
pub fn run_summary(outcome: &PipelineOutcome) {
    let count = |status: JobStatus| outcome.jobs.iter().filter(|j| j.status == status).count();
    note(&format!(
        "{} instances: {} succeeded, {} failed, {} cancelled",
        outcome.jobs.len(),
        count(JobStatus::Succeeded),
        count(JobStatus::Failed),
        count(JobStatus::Cancelled),
    ));
    for finding in &outcome.drift {
        warning(&format!("drift {}", drift_line(finding)));
    }
}
