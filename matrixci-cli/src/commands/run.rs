use crate::commands::{load_definition, workflow_name};
use crate::output;

use std::path::PathBuf;
use std::sync::Arc;

use clap::Args;
use color_eyre::Result;

use pipeline_orchestrator::utils::resolve_working_dir;
use pipeline_orchestrator::{
    progress_channel, ConfigLayer, EventKind, ExecutionEvent, FileCoverageReporter,
    OrchestratorConfig, PipelineExecutor, ReportFormat, RunReporter, RunnerRegistry, TriggerEvent,
};

/// Run a pipeline locally for one trigger event
#[derive(Args, Debug)]
pub struct RunArgs {
    /// Path to the pipeline YAML file
    pub pipeline: PathBuf,

    /// Trigger event kind (push, pull_request, schedule, manual, merge_group)
    #[arg(long, default_value = "push")]
    pub event: EventKind,

    /// Git ref the event applies to
    #[arg(long = "ref", value_name = "REF", default_value = "refs/heads/main")]
    pub git_ref: String,

    /// Commit the event applies to
    #[arg(long, default_value = "HEAD")]
    pub commit: String,

    /// Target branch of a pull request
    #[arg(long, value_name = "BRANCH")]
    pub base_ref: Option<String>,

    /// Cron expression of a scheduled event
    #[arg(long, value_name = "CRON")]
    pub schedule: Option<String>,

    /// Repository root (default: enclosing git repository)
    #[arg(long, short = 'w', value_name = "DIR")]
    pub working_dir: Option<PathBuf>,

    /// Maximum job instances running at once (0 = unlimited)
    #[arg(long, value_name = "N")]
    pub max_parallel: Option<usize>,

    /// Parallel-safe test workers for jobs that declare none
    #[arg(long, value_name = "N")]
    pub workers: Option<usize>,

    /// Directory the coverage reports are written to
    #[arg(long, value_name = "DIR")]
    pub coverage_dir: Option<PathBuf>,

    /// Report format (terminal, json, junit)
    #[arg(long, short = 'r', default_value = "terminal")]
    pub report: ReportFormat,

    /// Write the report to a file instead of stdout
    #[arg(long, short = 'o', value_name = "FILE")]
    pub output: Option<PathBuf>,
}

pub async fn execute(args: RunArgs) -> Result<()> {
    output::action("Parsing", &args.pipeline.display().to_string());
    let definition = load_definition(&args.pipeline)?;
    let workflow = workflow_name(&definition, &args.pipeline);

    let root = match &args.working_dir {
        Some(dir) => dir.clone(),
        None => resolve_working_dir(),
    };

    let config = OrchestratorConfig::load(&root)?.with_overrides(ConfigLayer {
        max_parallel: args.max_parallel,
        workers: args.workers,
        coverage_dir: args.coverage_dir.clone(),
        ..ConfigLayer::default()
    })?;
    tracing::debug!(?config, root = %root.display(), "effective configuration");

    let mut event = TriggerEvent::new(args.event, &args.git_ref, &args.commit);
    if let Some(base) = &args.base_ref {
        event = event.with_base_ref(base);
    }
    if let Some(cron) = &args.schedule {
        event = event.with_schedule(cron);
    }

    output::note(&format!(
        "Workflow '{}': {} jobs, {} on {}",
        workflow,
        definition.jobs.len(),
        event.kind,
        event.git_ref
    ));

    let reporter = FileCoverageReporter::new(config.coverage_dir(&root));
    let registry = RunnerRegistry::shell(Arc::new(reporter));

    let (tx, mut rx) = progress_channel();
    let executor = PipelineExecutor::new(Arc::new(definition), registry)
        .with_config(config.executor_config(&root))
        .with_workflow(&workflow)
        .with_progress(tx);

    // Spawn execution in background
    let exec_handle = tokio::spawn(async move { executor.run(event).await });

    // Process events in the foreground
    while let Some(event) = rx.recv().await {
        render(&event);
    }

    let outcome = exec_handle.await??;
    output::run_summary(&outcome);

    let report = RunReporter::report(&outcome, args.report)?;
    match &args.output {
        Some(path) => {
            std::fs::write(path, report)?;
            output::note(&format!("Report written to {}", path.display()));
        }
        None => print!("{}", report),
    }

    if !outcome.success() {
        std::process::exit(1);
    }

    Ok(())
}

fn render(event: &ExecutionEvent) {
    match event {
        ExecutionEvent::RunSkipped { reason, .. } => {
            output::warning(&format!("Run skipped: {}", reason));
        }

        ExecutionEvent::PipelineStarted {
            workflow,
            group,
            total_jobs,
            ..
        } => output::run_started(workflow, group, *total_jobs),

        ExecutionEvent::RunSuperseded { cancelled, .. } => {
            output::warning(&format!("Cancelled earlier run {} of this group", cancelled));
        }

        ExecutionEvent::PipelineCompleted {
            status, duration, ..
        } => output::run_finished(*status, duration),

        ExecutionEvent::JobStarted {
            job,
            display_name,
            total_steps,
        } => output::instance_started(job, display_name, *total_steps),

        ExecutionEvent::JobCompleted {
            job,
            status,
            duration,
        } => output::instance_finished(job, *status, duration),

        ExecutionEvent::StepStarted { step, step_index, .. } => output::step_started(*step, *step_index),

        ExecutionEvent::StepCompleted {
            step,
            outcome,
            message,
            duration,
            ..
        } => output::step_finished(*step, *outcome, message.as_deref(), duration),

        ExecutionEvent::Coverage { job, outcome } => output::coverage(job, outcome),

        ExecutionEvent::Log { level, message, job } => output::advisory(*level, job.as_deref(), message),
    }
}
