// Pipeline Executor
// Admits a run, expands every job and schedules the instances

use crate::error::{OrchestratorError, OrchestratorResult};
use crate::execution::concurrency::{group_key, AdmissionPolicy, ConcurrencyController, RunId};
use crate::execution::context::JobContext;
use crate::execution::events::{EventSender, ExecutionEvent, ProgressSender};
use crate::execution::job::{JobOutcome, JobRunner, JobStatus};
use crate::execution::matrix::{JobSpec, MatrixExpander};
use crate::execution::trigger::{TriggerEvent, TriggerFilter};
use crate::runners::RunnerRegistry;
use crate::workflow::models::{JobDefinition, PipelineDefinition};

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStatus {
    Succeeded,
    Failed,
    /// Superseded by a newer run of the same group
    Cancelled,
    /// The trigger filter rejected the event
    Skipped,
}

impl fmt::Display for PipelineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineStatus::Succeeded => write!(f, "succeeded"),
            PipelineStatus::Failed => write!(f, "failed"),
            PipelineStatus::Cancelled => write!(f, "cancelled"),
            PipelineStatus::Skipped => write!(f, "skipped"),
        }
    }
}

/// An unconstrained package that ended up at different versions across the
/// jobs of one run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DriftFinding {
    pub package: String,
    /// Installed version -> ids of the jobs that got it
    pub versions: BTreeMap<String, Vec<String>>,
}

/// Result of one pipeline run.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineOutcome {
    pub run_id: RunId,
    pub workflow: String,
    pub group: String,
    pub event: TriggerEvent,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub status: PipelineStatus,
    /// In definition order
    pub jobs: Vec<JobOutcome>,
    pub drift: Vec<DriftFinding>,
    /// Whether a newer run of the group cancelled this one
    pub superseded: bool,
}

impl PipelineOutcome {
    pub fn success(&self) -> bool {
        matches!(self.status, PipelineStatus::Succeeded | PipelineStatus::Skipped)
    }

    pub fn job(&self, id: &str) -> Option<&JobOutcome> {
        self.jobs.iter().find(|j| j.spec.id() == id)
    }

    pub fn failed_jobs(&self) -> impl Iterator<Item = &JobOutcome> {
        self.jobs.iter().filter(|j| j.status == JobStatus::Failed)
    }

    pub fn duration(&self) -> Duration {
        (self.finished_at - self.started_at).to_std().unwrap_or_default()
    }
}

/// Configuration for pipeline execution
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Maximum job instances running at once across the run (0 = unlimited)
    pub max_parallel: usize,
    /// Parallel-safe partition workers when a job declares none
    pub default_workers: usize,
    /// Repository root every command runs from
    pub work_dir: PathBuf,
    /// Parent of the per-run job directories, `<work_dir>/.matrixci` by default
    pub job_root: Option<PathBuf>,
    /// Step timeout for jobs without `timeout-minutes`
    pub step_timeout: Option<Duration>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_parallel: 0,
            default_workers: 4,
            work_dir: PathBuf::from("."),
            job_root: None,
            step_timeout: None,
        }
    }
}

/// Pipeline executor
pub struct PipelineExecutor {
    definition: Arc<PipelineDefinition>,
    registry: RunnerRegistry,
    config: ExecutorConfig,
    controller: Arc<ConcurrencyController>,
    workflow: String,
    event_tx: Option<ProgressSender>,
}

struct ScheduledJob {
    spec: JobSpec,
    definition: Arc<JobDefinition>,
    token: CancellationToken,
    permits: Option<Arc<Semaphore>>,
    fail_fast: bool,
}

/// Slot held while a job instance runs.
struct Slot {
    _global: Option<OwnedSemaphorePermit>,
    _job: Option<OwnedSemaphorePermit>,
}

impl PipelineExecutor {
    pub fn new(definition: Arc<PipelineDefinition>, registry: RunnerRegistry) -> Self {
        let workflow = definition
            .name
            .clone()
            .unwrap_or_else(|| "workflow".to_string());

        Self {
            definition,
            registry,
            config: ExecutorConfig::default(),
            controller: Arc::new(ConcurrencyController::new()),
            workflow,
            event_tx: None,
        }
    }

    pub fn with_config(mut self, config: ExecutorConfig) -> Self {
        self.config = config;
        self
    }

    /// Share a controller between executors so their runs see each other's
    /// concurrency groups.
    pub fn with_controller(mut self, controller: Arc<ConcurrencyController>) -> Self {
        self.controller = controller;
        self
    }

    pub fn with_progress(mut self, tx: ProgressSender) -> Self {
        self.event_tx = Some(tx);
        self
    }

    /// Override the workflow identity used for grouping and templates.
    pub fn with_workflow(mut self, workflow: impl Into<String>) -> Self {
        self.workflow = workflow.into();
        self
    }

    pub fn workflow(&self) -> &str {
        &self.workflow
    }

    /// Every job instance the definition expands to, in definition order.
    pub fn job_specs(&self) -> OrchestratorResult<Vec<(JobSpec, Arc<JobDefinition>)>> {
        let mut specs = Vec::new();
        for (job_id, job) in &self.definition.jobs {
            let definition = Arc::new(job.clone());
            let expanded = MatrixExpander::expand_job(job_id, job).map_err(|source| {
                OrchestratorError::Matrix {
                    job: job_id.clone(),
                    source,
                }
            })?;
            specs.extend(expanded.into_iter().map(|spec| (spec, definition.clone())));
        }
        Ok(specs)
    }

    /// Run the pipeline for one trigger event.
    pub async fn run(&self, event: TriggerEvent) -> OrchestratorResult<PipelineOutcome> {
        let started_at = Utc::now();
        let start = Instant::now();
        let group = group_key(self.definition.concurrency.as_ref(), &self.workflow, &event);

        if !TriggerFilter::accepts(&self.definition.on, &event) {
            let reason = format!("{} on {} does not match the trigger filter", event.kind, event.git_ref);
            tracing::info!(workflow = %self.workflow, %reason, "run skipped");
            self.event_tx.send_event(ExecutionEvent::RunSkipped {
                workflow: self.workflow.clone(),
                reason,
            });
            return Ok(PipelineOutcome {
                run_id: Uuid::new_v4(),
                workflow: self.workflow.clone(),
                group,
                event,
                started_at,
                finished_at: Utc::now(),
                status: PipelineStatus::Skipped,
                jobs: Vec::new(),
                drift: Vec::new(),
                superseded: false,
            });
        }

        // Definition errors surface before the run claims its group
        let specs = self.job_specs()?;

        let policy = AdmissionPolicy::from_definition(self.definition.concurrency.as_ref());
        let admission = self.controller.admit(&group, policy).await;
        let handle = admission.handle;

        tracing::info!(
            workflow = %self.workflow,
            run = %handle.id,
            group = %group,
            jobs = specs.len(),
            "pipeline started"
        );
        self.event_tx.send_event(ExecutionEvent::PipelineStarted {
            run_id: handle.id,
            workflow: self.workflow.clone(),
            group: group.clone(),
            total_jobs: specs.len(),
        });
        for cancelled in admission.cancelled {
            self.event_tx.send_event(ExecutionEvent::RunSuperseded {
                cancelled,
                by: handle.id,
            });
        }

        let job_root = self
            .config
            .job_root
            .clone()
            .unwrap_or_else(|| self.config.work_dir.join(".matrixci"))
            .join(handle.id.to_string());

        let scheduled = self.schedule(specs, &handle.token);
        let jobs = self.run_jobs(scheduled, &event, &job_root).await;

        let drift = detect_drift(&jobs);
        for finding in &drift {
            let versions: Vec<&str> = finding.versions.keys().map(String::as_str).collect();
            tracing::warn!(
                package = %finding.package,
                versions = %versions.join(", "),
                "unconstrained package installed at different versions across jobs"
            );
            self.event_tx.send_event(ExecutionEvent::warning(
                format!("{} installed at different versions across jobs: {}", finding.package, versions.join(", ")),
                None,
            ));
        }

        let superseded = handle.is_cancelled();
        let status = if superseded {
            PipelineStatus::Cancelled
        } else if jobs.iter().any(|j| j.status != JobStatus::Succeeded) {
            PipelineStatus::Failed
        } else {
            PipelineStatus::Succeeded
        };

        let duration = start.elapsed();
        tracing::info!(workflow = %self.workflow, run = %handle.id, %status, ?duration, "pipeline finished");
        self.event_tx.send_event(ExecutionEvent::PipelineCompleted {
            run_id: handle.id,
            workflow: self.workflow.clone(),
            status,
            duration,
        });

        // Queued runs of the group may start from here on
        self.controller.release(&handle);

        Ok(PipelineOutcome {
            run_id: handle.id,
            workflow: self.workflow.clone(),
            group,
            event,
            started_at,
            finished_at: Utc::now(),
            status,
            jobs,
            drift,
            superseded,
        })
    }

    /// Attach per-job cancellation and parallelism limits to every instance.
    fn schedule(&self, specs: Vec<(JobSpec, Arc<JobDefinition>)>, run_token: &CancellationToken) -> Vec<ScheduledJob> {
        let mut tokens: HashMap<String, CancellationToken> = HashMap::new();
        let mut permits: HashMap<String, Option<Arc<Semaphore>>> = HashMap::new();

        specs
            .into_iter()
            .map(|(spec, definition)| {
                let token = tokens
                    .entry(spec.job.clone())
                    .or_insert_with(|| run_token.child_token())
                    .clone();
                let permits = permits
                    .entry(spec.job.clone())
                    .or_insert_with(|| {
                        MatrixExpander::max_parallel(&definition)
                            .map(|limit| Arc::new(Semaphore::new(limit.max(1) as usize)))
                    })
                    .clone();
                let fail_fast = definition.strategy.as_ref().is_some_and(|s| s.fail_fast);

                ScheduledJob {
                    spec,
                    definition,
                    token,
                    permits,
                    fail_fast,
                }
            })
            .collect()
    }

    async fn run_jobs(&self, scheduled: Vec<ScheduledJob>, event: &TriggerEvent, job_root: &std::path::Path) -> Vec<JobOutcome> {
        let global = match self.config.max_parallel {
            0 => None,
            limit => Some(Arc::new(Semaphore::new(limit))),
        };

        let mut runner = JobRunner::new(self.registry.clone());
        if let Some(tx) = &self.event_tx {
            runner = runner.with_progress(tx.clone());
        }

        let specs: Vec<JobSpec> = scheduled.iter().map(|s| s.spec.clone()).collect();
        let mut set = JoinSet::new();

        for (order, job) in scheduled.into_iter().enumerate() {
            let ctx = self.context(&job, event, job_root);
            let runner = runner.clone();
            let global = global.clone();

            set.spawn(async move {
                let Some(_slot) = acquire(global, job.permits, &job.token).await else {
                    tracing::info!(job = %ctx.spec.id(), "job cancelled before it started");
                    return (order, JobOutcome::cancelled(ctx.spec));
                };

                let outcome = runner.run(ctx).await;
                if job.fail_fast && outcome.status == JobStatus::Failed {
                    tracing::info!(job = %outcome.spec.job, "fail-fast: cancelling sibling instances");
                    job.token.cancel();
                }
                (order, outcome)
            });
        }

        let mut finished = BTreeMap::new();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((order, outcome)) => {
                    finished.insert(order, outcome);
                }
                Err(e) => tracing::error!(error = %e, "job task failed"),
            }
        }

        specs
            .into_iter()
            .enumerate()
            .map(|(order, spec)| {
                finished
                    .remove(&order)
                    .unwrap_or_else(|| JobOutcome::lost(spec, "job task did not complete"))
            })
            .collect()
    }

    fn context(&self, job: &ScheduledJob, event: &TriggerEvent, job_root: &std::path::Path) -> JobContext {
        let mut env = self.definition.env.clone();
        env.extend(job.definition.env.iter().map(|(k, v)| (k.clone(), v.clone())));

        let timeout = job
            .definition
            .timeout_minutes
            .map(|minutes| Duration::from_secs(u64::from(minutes) * 60))
            .or(self.config.step_timeout);

        JobContext {
            workflow: self.workflow.clone(),
            event: event.clone(),
            job_dir: job_root.join(job.spec.slug()),
            spec: job.spec.clone(),
            definition: job.definition.clone(),
            work_dir: self.config.work_dir.clone(),
            env,
            default_workers: self.config.default_workers.max(1),
            timeout,
            cancel: job.token.clone(),
        }
    }
}

/// Wait for both the run-wide and the per-job slot, giving up when the
/// token is cancelled first.
async fn acquire(
    global: Option<Arc<Semaphore>>,
    job: Option<Arc<Semaphore>>,
    token: &CancellationToken,
) -> Option<Slot> {
    let job = permit(job, token).await?;
    let global = permit(global, token).await?;
    Some(Slot {
        _global: global,
        _job: job,
    })
}

async fn permit(semaphore: Option<Arc<Semaphore>>, token: &CancellationToken) -> Option<Option<OwnedSemaphorePermit>> {
    if token.is_cancelled() {
        return None;
    }
    let Some(semaphore) = semaphore else {
        return Some(None);
    };

    tokio::select! {
        biased;
        _ = token.cancelled() => None,
        permit = semaphore.acquire_owned() => permit.ok().map(Some),
    }
}

/// Unconstrained packages installed at more than one version across jobs.
pub fn detect_drift(jobs: &[JobOutcome]) -> Vec<DriftFinding> {
    let mut seen: BTreeMap<String, BTreeMap<String, Vec<String>>> = BTreeMap::new();

    for job in jobs {
        let Some(resolved) = &job.resolved else {
            continue;
        };
        for package in resolved.unconstrained() {
            if let Some(version) = job.installed.get(package) {
                seen.entry(package.clone())
                    .or_default()
                    .entry(version.as_str().to_string())
                    .or_default()
                    .push(job.spec.id());
            }
        }
    }

    seen.into_iter()
        .filter(|(_, versions)| versions.len() > 1)
        .map(|(package, versions)| DriftFinding { package, versions })
        .collect()
}
