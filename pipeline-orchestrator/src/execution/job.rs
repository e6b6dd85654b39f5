// Job Runner
// Runs one job instance through its fixed step sequence

use crate::coverage::{CoverageAggregator, CoverageFragment, CoverageReport, ForwardOutcome, SuppressReason};
use crate::error::{InstallError, JobError};
use crate::execution::context::JobContext;
use crate::execution::events::{EventSender, ExecutionEvent, ProgressSender};
use crate::execution::matrix::JobSpec;
use crate::resolver::{
    DependencyResolver, LockSet, PackageIndex, PackageVersion, ResolutionMode, ResolveError,
    ResolvedDependencySet, StaticPackageIndex,
};
use crate::runners::{Environment, RunnerRegistry};
use crate::testing::partition::{CaseResult, PartitionKind, PartitionRunner, TestCatalog};
use crate::workflow::models::{DependencySpec, JobRole, TestSpec};

use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// The steps a job can record, in the order they run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum StepKind {
    Setup,
    Install,
    TypeCheck,
    ParallelTests,
    SerialTests,
    Lint,
    StaticAnalysis,
}

impl StepKind {
    pub fn name(&self) -> &'static str {
        match self {
            StepKind::Setup => "environment setup",
            StepKind::Install => "dependency install",
            StepKind::TypeCheck => "type-check",
            StepKind::ParallelTests => "tests (parallel-safe)",
            StepKind::SerialTests => "tests (serial-only)",
            StepKind::Lint => "lint",
            StepKind::StaticAnalysis => "static analysis",
        }
    }

    /// The step sequence for a role.
    pub fn sequence(role: JobRole) -> &'static [StepKind] {
        match role {
            JobRole::Test => &[
                StepKind::Setup,
                StepKind::Install,
                StepKind::TypeCheck,
                StepKind::ParallelTests,
                StepKind::SerialTests,
            ],
            JobRole::Lint => &[StepKind::Lint],
            JobRole::StaticAnalysis => &[StepKind::StaticAnalysis],
        }
    }
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepOutcome {
    Success,
    Failure,
    Skipped,
}

/// Output attached to a step, e.g. a lint diff or analysis findings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Artifact {
    pub name: String,
    pub content: String,
}

impl Artifact {
    pub fn new(name: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepResult {
    pub kind: StepKind,
    pub name: String,
    pub outcome: StepOutcome,
    pub message: Option<String>,
    pub artifacts: Vec<Artifact>,
    /// Per-case results for test partitions
    pub cases: Vec<CaseResult>,
    #[serde(with = "crate::testing::partition::duration_ms")]
    pub duration: Duration,
}

impl StepResult {
    fn new(kind: StepKind, outcome: StepOutcome, duration: Duration) -> Self {
        Self {
            kind,
            name: kind.name().to_string(),
            outcome,
            message: None,
            artifacts: Vec::new(),
            cases: Vec::new(),
            duration,
        }
    }

    pub fn success(kind: StepKind, duration: Duration) -> Self {
        Self::new(kind, StepOutcome::Success, duration)
    }

    pub fn failure(kind: StepKind, message: impl Into<String>, duration: Duration) -> Self {
        Self::new(kind, StepOutcome::Failure, duration).with_message(message)
    }

    pub fn skipped(kind: StepKind, reason: impl Into<String>) -> Self {
        Self::new(kind, StepOutcome::Skipped, Duration::ZERO).with_message(reason)
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_artifact(mut self, artifact: Artifact) -> Self {
        self.artifacts.push(artifact);
        self
    }

    pub fn is_failure(&self) -> bool {
        self.outcome == StepOutcome::Failure
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Succeeded,
    Failed,
    Cancelled,
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobStatus::Succeeded => write!(f, "succeeded"),
            JobStatus::Failed => write!(f, "failed"),
            JobStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Everything one job instance produced.
#[derive(Debug, Clone, Serialize)]
pub struct JobOutcome {
    pub spec: JobSpec,
    pub status: JobStatus,
    pub steps: Vec<StepResult>,
    pub resolved: Option<ResolvedDependencySet>,
    pub installed: BTreeMap<String, PackageVersion>,
    pub coverage: Option<CoverageReport>,
    pub coverage_errors: Vec<String>,
    pub forward: Option<ForwardOutcome>,
    #[serde(with = "crate::testing::partition::duration_ms")]
    pub duration: Duration,
}

impl JobOutcome {
    fn new(spec: JobSpec) -> Self {
        Self {
            spec,
            status: JobStatus::Succeeded,
            steps: Vec::new(),
            resolved: None,
            installed: BTreeMap::new(),
            coverage: None,
            coverage_errors: Vec::new(),
            forward: None,
            duration: Duration::ZERO,
        }
    }

    /// An outcome for a job that was cancelled before it started.
    pub fn cancelled(spec: JobSpec) -> Self {
        let mut outcome = Self::new(spec);
        outcome.status = JobStatus::Cancelled;
        outcome.forward = Some(ForwardOutcome::Suppressed(SuppressReason::Cancelled));
        outcome
    }

    /// An outcome for a job whose task died without reporting.
    pub fn lost(spec: JobSpec, reason: impl Into<String>) -> Self {
        let mut outcome = Self::new(spec);
        outcome.status = JobStatus::Failed;
        outcome.coverage_errors.push(reason.into());
        outcome
    }

    pub fn step(&self, kind: StepKind) -> Option<&StepResult> {
        self.steps.iter().find(|s| s.kind == kind)
    }
}

/// Steps end early either because the job failed fatally or because the
/// run was cancelled.
enum Halt {
    Failed,
    Cancelled,
}

type StepFlow<T> = Result<T, Halt>;

/// Runs job instances against a set of collaborators.
#[derive(Clone)]
pub struct JobRunner {
    registry: RunnerRegistry,
    event_tx: Option<ProgressSender>,
}

impl JobRunner {
    pub fn new(registry: RunnerRegistry) -> Self {
        Self {
            registry,
            event_tx: None,
        }
    }

    pub fn with_progress(mut self, tx: ProgressSender) -> Self {
        self.event_tx = Some(tx);
        self
    }

    /// Run one job instance to completion (or cancellation).
    pub async fn run(&self, ctx: JobContext) -> JobOutcome {
        let start = Instant::now();
        let ctx = Arc::new(ctx);
        let job_id = ctx.spec.id();
        let role = ctx.definition.role().unwrap_or(JobRole::Test);

        self.event_tx.send_event(ExecutionEvent::job_started(
            &job_id,
            &ctx.spec.display_name,
            StepKind::sequence(role).len(),
        ));
        tracing::info!(job = %job_id, ?role, "job started");

        let mut outcome = JobOutcome::new(ctx.spec.clone());

        let flow = match role {
            JobRole::Test => self.run_test_job(&ctx, &mut outcome).await,
            JobRole::Lint => self.run_lint_job(&ctx, &mut outcome).await,
            JobRole::StaticAnalysis => self.run_analysis_job(&ctx, &mut outcome).await,
        };

        outcome.status = match flow {
            Err(Halt::Cancelled) => JobStatus::Cancelled,
            Err(Halt::Failed) => JobStatus::Failed,
            Ok(()) if outcome.steps.iter().any(StepResult::is_failure) => JobStatus::Failed,
            Ok(()) => JobStatus::Succeeded,
        };

        if outcome.status == JobStatus::Cancelled {
            outcome.forward = Some(ForwardOutcome::Suppressed(SuppressReason::Cancelled));
            self.event_tx.send_event(ExecutionEvent::Coverage {
                job: job_id.clone(),
                outcome: ForwardOutcome::Suppressed(SuppressReason::Cancelled),
            });
        }

        outcome.duration = start.elapsed();
        tracing::info!(job = %job_id, status = %outcome.status, "job finished");
        self.event_tx.send_event(ExecutionEvent::job_completed(
            &job_id,
            outcome.status,
            outcome.duration,
        ));

        outcome
    }

    async fn run_test_job(&self, ctx: &Arc<JobContext>, outcome: &mut JobOutcome) -> StepFlow<()> {
        let mut index = 0;

        let env = self.setup(ctx, outcome, &mut index).await?;
        self.checkpoint(ctx)?;

        self.install(ctx, &env, outcome, &mut index).await?;
        self.checkpoint(ctx)?;

        self.type_check(ctx, &env, outcome, &mut index).await;
        self.checkpoint(ctx)?;

        let Some(tests) = ctx.definition.tests.clone() else {
            self.record(ctx, outcome, &mut index, StepResult::skipped(StepKind::ParallelTests, "no test suite declared"));
            self.record(ctx, outcome, &mut index, StepResult::skipped(StepKind::SerialTests, "no test suite declared"));
            return Ok(());
        };

        let env = Arc::new(env);
        let fragments = self.run_partitions(ctx, &env, &tests, outcome, &mut index).await?;
        self.checkpoint(ctx)?;

        self.aggregate_coverage(ctx, fragments, outcome).await;
        Ok(())
    }

    async fn setup(
        &self,
        ctx: &JobContext,
        outcome: &mut JobOutcome,
        index: &mut usize,
    ) -> StepFlow<Environment> {
        self.checkpoint(ctx)?;
        self.announce(ctx, StepKind::Setup, *index);
        let started = Instant::now();

        match with_timeout(ctx.timeout, self.registry.provisioner.provision(ctx)).await {
            Ok(Ok(env)) => {
                let runtime = env.runtime_version.as_deref().unwrap_or("default");
                let step = StepResult::success(StepKind::Setup, started.elapsed())
                    .with_message(format!("runtime {} at {}", runtime, env.path.display()));
                self.record(ctx, outcome, index, step);
                Ok(env)
            }
            Ok(Err(e)) => {
                let message = JobError::from(e).to_string();
                tracing::warn!(job = %ctx.spec.id(), error = %message, "environment setup failed");
                self.record(ctx, outcome, index, StepResult::failure(StepKind::Setup, message, started.elapsed()));
                Err(Halt::Failed)
            }
            Err(limit) => {
                self.record(ctx, outcome, index, StepResult::failure(StepKind::Setup, timed_out(limit), started.elapsed()));
                Err(Halt::Failed)
            }
        }
    }

    async fn install(
        &self,
        ctx: &JobContext,
        env: &Environment,
        outcome: &mut JobOutcome,
        index: &mut usize,
    ) -> StepFlow<()> {
        let Some(deps) = ctx.definition.dependencies.as_ref() else {
            self.record(ctx, outcome, index, StepResult::skipped(StepKind::Install, "no dependencies declared"));
            return Ok(());
        };

        self.announce(ctx, StepKind::Install, *index);
        let started = Instant::now();

        let resolved = match self.resolve(ctx, deps) {
            Ok(resolved) => resolved,
            Err(e) => {
                let message = JobError::from(e).to_string();
                tracing::warn!(job = %ctx.spec.id(), error = %message, "dependency resolution failed");
                self.record(ctx, outcome, index, StepResult::failure(StepKind::Install, message, started.elapsed()));
                return Err(Halt::Failed);
            }
        };

        let requirements_text = resolved.to_requirements();
        let requirements = ctx.job_dir.join("requirements.txt");
        let written = async {
            tokio::fs::create_dir_all(&ctx.job_dir).await?;
            tokio::fs::write(&requirements, &requirements_text).await
        }
        .await;
        if let Err(e) = written {
            let error = InstallError {
                diagnostics: format!("cannot write {}: {}", requirements.display(), e),
            };
            self.record(ctx, outcome, index, StepResult::failure(StepKind::Install, error.to_string(), started.elapsed()));
            return Err(Halt::Failed);
        }

        let requirements_artifact = Artifact::new("requirements.txt", requirements_text);
        let installed = with_timeout(
            ctx.timeout,
            self.registry.installer.install(ctx, env, &resolved, &requirements),
        )
        .await;
        outcome.resolved = Some(resolved.clone());

        match installed {
            Ok(Ok(report)) => {
                let step = StepResult::success(StepKind::Install, started.elapsed())
                    .with_message(format!("{} packages ({})", resolved.len(), resolved.mode))
                    .with_artifact(requirements_artifact);
                outcome.installed = report.installed;
                self.record(ctx, outcome, index, step);
                let unconstrained: Vec<&str> = resolved.unconstrained().map(String::as_str).collect();
                if !unconstrained.is_empty() {
                    self.event_tx.send_event(ExecutionEvent::info(
                        format!("left to the installer: {}", unconstrained.join(", ")),
                        Some(ctx.spec.id()),
                    ));
                }
                Ok(())
            }
            Ok(Err(e)) => {
                let message = JobError::from(e).to_string();
                tracing::warn!(job = %ctx.spec.id(), error = %message, "dependency install failed");
                let step = StepResult::failure(StepKind::Install, message, started.elapsed())
                    .with_artifact(requirements_artifact);
                self.record(ctx, outcome, index, step);
                Err(Halt::Failed)
            }
            Err(limit) => {
                self.record(ctx, outcome, index, StepResult::failure(StepKind::Install, timed_out(limit), started.elapsed()));
                Err(Halt::Failed)
            }
        }
    }

    fn resolve(&self, ctx: &JobContext, deps: &DependencySpec) -> Result<ResolvedDependencySet, ResolveError> {
        resolve_dependencies(
            deps,
            &ctx.work_dir,
            ctx.spec.is_minimum_version(),
            self.registry.index.clone(),
        )
    }

    async fn type_check(&self, ctx: &JobContext, env: &Environment, outcome: &mut JobOutcome, index: &mut usize) {
        if ctx.spec.is_minimum_version() {
            self.record(ctx, outcome, index, StepResult::skipped(StepKind::TypeCheck, "minimum-version variant"));
            return;
        }
        if ctx.definition.type_check.is_none() {
            self.record(ctx, outcome, index, StepResult::skipped(StepKind::TypeCheck, "no type-check configured"));
            return;
        }

        self.announce(ctx, StepKind::TypeCheck, *index);
        let started = Instant::now();

        let step = match with_timeout(ctx.timeout, self.registry.type_checker.check(ctx, env)).await {
            Ok(Ok(output)) if output.success => StepResult::success(StepKind::TypeCheck, started.elapsed()),
            Ok(Ok(output)) => StepResult::failure(StepKind::TypeCheck, "type-check reported errors", started.elapsed())
                .with_artifact(Artifact::new("type-check.log", output.output)),
            Ok(Err(e)) => StepResult::failure(StepKind::TypeCheck, e.to_string(), started.elapsed()),
            Err(limit) => StepResult::failure(StepKind::TypeCheck, timed_out(limit), started.elapsed()),
        };

        self.record(ctx, outcome, index, step);
    }

    async fn run_partitions(
        &self,
        ctx: &Arc<JobContext>,
        env: &Arc<Environment>,
        tests: &TestSpec,
        outcome: &mut JobOutcome,
        index: &mut usize,
    ) -> StepFlow<Vec<CoverageFragment>> {
        let discovered = match with_timeout(ctx.timeout, self.registry.tests.discover(ctx, env)).await {
            Ok(Ok(found)) => found,
            Ok(Err(e)) => {
                let message = format!("test discovery failed: {}", e);
                self.record(ctx, outcome, index, StepResult::failure(StepKind::ParallelTests, message.clone(), Duration::ZERO));
                self.record(ctx, outcome, index, StepResult::failure(StepKind::SerialTests, message, Duration::ZERO));
                return Ok(Vec::new());
            }
            Err(limit) => {
                let message = format!("test discovery {}", timed_out(limit));
                self.record(ctx, outcome, index, StepResult::failure(StepKind::ParallelTests, message.clone(), Duration::ZERO));
                self.record(ctx, outcome, index, StepResult::failure(StepKind::SerialTests, message, Duration::ZERO));
                return Ok(Vec::new());
            }
        };

        let catalog = TestCatalog::build(tests, discovered);
        let workers = tests.workers.unwrap_or(ctx.default_workers).max(1);
        let runner = PartitionRunner::new(self.registry.tests.clone());
        let mut fragments = Vec::new();

        for (kind, step_kind) in [
            (PartitionKind::ParallelSafe, StepKind::ParallelTests),
            (PartitionKind::SerialOnly, StepKind::SerialTests),
        ] {
            if kind == PartitionKind::SerialOnly {
                self.checkpoint(ctx)?;
            }

            let cases = catalog.partition(kind);
            if cases.is_empty() {
                let step = StepResult::success(step_kind, Duration::ZERO).with_message("no cases");
                self.record(ctx, outcome, index, step);
                continue;
            }

            self.announce(ctx, step_kind, *index);
            let started = Instant::now();

            let run = runner.run(ctx.clone(), env.clone(), kind, cases, workers);
            let step = match with_timeout(ctx.timeout, run).await {
                Ok(result) => {
                    let summary = format!(
                        "{} passed, {} failed ({} worker{})",
                        result.cases.len() - result.failed(),
                        result.failed(),
                        result.workers,
                        if result.workers == 1 { "" } else { "s" }
                    );
                    let mut step = if result.passed() {
                        StepResult::success(step_kind, started.elapsed()).with_message(summary)
                    } else {
                        StepResult::failure(step_kind, summary, started.elapsed())
                    };
                    step.cases = result.cases;
                    fragments.extend(result.fragments);
                    step
                }
                Err(limit) => StepResult::failure(step_kind, timed_out(limit), started.elapsed()),
            };

            self.record(ctx, outcome, index, step);
        }

        Ok(fragments)
    }

    async fn aggregate_coverage(&self, ctx: &JobContext, fragments: Vec<CoverageFragment>, outcome: &mut JobOutcome) {
        let (report, errors) = CoverageAggregator::merge_lenient(&fragments);
        outcome.coverage_errors.extend(errors.iter().map(ToString::to_string));
        outcome.coverage = Some(report.clone());

        let forwarded = CoverageAggregator::forward(
            self.registry.reporter.as_ref(),
            report,
            &ctx.spec,
            &ctx.event,
            ctx.is_cancelled(),
        )
        .await;

        match forwarded {
            Ok(result) => {
                outcome.forward = Some(result);
                self.event_tx.send_event(ExecutionEvent::Coverage {
                    job: ctx.spec.id(),
                    outcome: result,
                });
            }
            Err(e) => {
                tracing::warn!(job = %ctx.spec.id(), error = %e, "coverage forwarding failed");
                self.event_tx.send_event(ExecutionEvent::warning(
                    format!("coverage not forwarded: {}", e),
                    Some(ctx.spec.id()),
                ));
                outcome.coverage_errors.push(e.to_string());
            }
        }
    }

    async fn run_lint_job(&self, ctx: &Arc<JobContext>, outcome: &mut JobOutcome) -> StepFlow<()> {
        self.checkpoint(ctx)?;
        let mut index = 0;
        let Some(lint) = ctx.definition.lint.as_ref() else {
            return Ok(());
        };

        self.announce(ctx, StepKind::Lint, index);
        let started = Instant::now();

        let step = match with_timeout(ctx.timeout, self.registry.lint.diff(ctx, &lint.path, &lint.base)).await {
            Ok(Ok(diff)) if diff.trim().is_empty() => {
                StepResult::success(StepKind::Lint, started.elapsed()).with_message("no formatting changes required")
            }
            Ok(Ok(diff)) => StepResult::failure(StepKind::Lint, "formatting changes required", started.elapsed())
                .with_artifact(Artifact::new("lint.diff", diff)),
            Ok(Err(e)) => StepResult::failure(StepKind::Lint, e.to_string(), started.elapsed()),
            Err(limit) => StepResult::failure(StepKind::Lint, timed_out(limit), started.elapsed()),
        };

        self.record(ctx, outcome, &mut index, step);
        Ok(())
    }

    async fn run_analysis_job(&self, ctx: &Arc<JobContext>, outcome: &mut JobOutcome) -> StepFlow<()> {
        self.checkpoint(ctx)?;
        let mut index = 0;
        let Some(analysis) = ctx.definition.static_analysis.as_ref() else {
            return Ok(());
        };

        self.announce(ctx, StepKind::StaticAnalysis, index);
        let started = Instant::now();

        let scan = self.registry.analyzer.analyze(ctx, &analysis.path, &analysis.language);
        let step = match with_timeout(ctx.timeout, scan).await {
            Ok(Ok(findings)) => {
                let mut step = StepResult::success(StepKind::StaticAnalysis, started.elapsed())
                    .with_message(format!("{} findings", findings.len()));
                if !findings.is_empty() {
                    step = step.with_artifact(Artifact::new("findings.txt", findings.join("\n")));
                }
                step
            }
            Ok(Err(e)) => StepResult::failure(StepKind::StaticAnalysis, e.to_string(), started.elapsed()),
            Err(limit) => StepResult::failure(StepKind::StaticAnalysis, timed_out(limit), started.elapsed()),
        };

        self.record(ctx, outcome, &mut index, step);
        Ok(())
    }

    /// Step boundary: stop if the run has been cancelled.
    fn checkpoint(&self, ctx: &JobContext) -> StepFlow<()> {
        if ctx.is_cancelled() {
            tracing::info!(job = %ctx.spec.id(), "cancellation observed at step boundary");
            return Err(Halt::Cancelled);
        }
        Ok(())
    }

    fn announce(&self, ctx: &JobContext, kind: StepKind, index: usize) {
        tracing::debug!(job = %ctx.spec.id(), step = %kind, "step started");
        self.event_tx
            .send_event(ExecutionEvent::step_started(ctx.spec.id(), kind, index));
    }

    fn record(&self, ctx: &JobContext, outcome: &mut JobOutcome, index: &mut usize, step: StepResult) {
        tracing::debug!(job = %ctx.spec.id(), step = %step.kind, outcome = ?step.outcome, "step finished");
        self.event_tx.send_event(ExecutionEvent::StepCompleted {
            job: ctx.spec.id(),
            step: step.kind,
            step_index: *index,
            outcome: step.outcome,
            message: step.message.clone(),
            duration: step.duration,
        });
        outcome.steps.push(step);
        *index += 1;
    }
}

/// Resolve a job's declared dependencies. Lock and index files are taken
/// relative to `work_dir`; an explicit `index` wins over `index-file`.
pub fn resolve_dependencies(
    deps: &DependencySpec,
    work_dir: &Path,
    minimum: bool,
    index: Option<Arc<dyn PackageIndex>>,
) -> Result<ResolvedDependencySet, ResolveError> {
    let lock_path = deps.lock_file.as_ref().map(|p| work_dir.join(p));

    let mode = if minimum {
        let lock = lock_path.and_then(|path| match LockSet::from_file(&path) {
            Ok(lock) => Some(lock),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "lock file unavailable, transitive packages not reported");
                None
            }
        });
        ResolutionMode::Minimum(lock)
    } else {
        match lock_path {
            Some(path) => ResolutionMode::Pinned(LockSet::from_file(&path)?),
            None => ResolutionMode::Pinned(LockSet::new()),
        }
    };

    let mut resolver = DependencyResolver::new();
    if let Some(index) = index.or_else(|| load_index(deps, work_dir)) {
        resolver = resolver.with_index(index);
    }

    resolver.resolve(&deps.constraints, &mode)
}

fn load_index(deps: &DependencySpec, work_dir: &Path) -> Option<Arc<dyn PackageIndex>> {
    let path = work_dir.join(deps.index_file.as_ref()?);
    let loaded = std::fs::read_to_string(&path)
        .map_err(|e| e.to_string())
        .and_then(|content| {
            serde_yaml::from_str::<StaticPackageIndex>(&content).map_err(|e| e.to_string())
        });

    match loaded {
        Ok(index) => Some(Arc::new(index)),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "ignoring unreadable package index");
            None
        }
    }
}

async fn with_timeout<F, T>(limit: Option<Duration>, future: F) -> Result<T, Duration>
where
    F: Future<Output = T>,
{
    match limit {
        Some(limit) => tokio::time::timeout(limit, future).await.map_err(|_| limit),
        None => Ok(future.await),
    }
}

fn timed_out(limit: Duration) -> String {
    format!("timed out after {}s", limit.as_secs())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::matrix::MatrixExpander;
    use crate::execution::trigger::{EventKind, TriggerEvent};
    use crate::runners::fakes::FakeCollaborators;
    use crate::workflow::models::JobDefinition;

    use std::collections::HashMap;
    use tokio_util::sync::CancellationToken;

    const TEST_JOB: &str = r#"
strategy:
  matrix:
    os: [ubuntu-latest]
    python-version: ["3.10"]
    include:
      - { os: ubuntu-latest, python-version: "3.10", min-version: true }
runtime: { axis: python-version }
dependencies:
  constraints: ["numpy>=1.21", "numpy>=1.24"]
type-check: { run: mypy }
tests:
  cases: [unit_a, unit_b, { id: serial_c, serial: true }]
  workers: 2
"#;

    fn context(definition: JobDefinition, spec_index: usize, dir: &std::path::Path) -> JobContext {
        let specs = MatrixExpander::expand_job("pytest", &definition).unwrap();
        let spec = specs[spec_index].clone();
        JobContext {
            workflow: "tests".to_string(),
            event: TriggerEvent::new(EventKind::Push, "main", "abc"),
            job_dir: dir.join(spec.slug()),
            spec,
            definition: Arc::new(definition),
            work_dir: dir.to_path_buf(),
            env: HashMap::new(),
            default_workers: 2,
            timeout: None,
            cancel: CancellationToken::new(),
        }
    }

    fn kinds(outcome: &JobOutcome) -> Vec<(StepKind, StepOutcome)> {
        outcome.steps.iter().map(|s| (s.kind, s.outcome)).collect()
    }

    #[tokio::test]
    async fn test_minimum_variant_skips_type_check() {
        let dir = tempfile::tempdir().unwrap();
        let fakes = FakeCollaborators::new();
        let runner = JobRunner::new(fakes.registry());

        let definition: JobDefinition = serde_yaml::from_str(TEST_JOB).unwrap();
        let outcome = runner.run(context(definition, 1, dir.path())).await;

        assert_eq!(outcome.status, JobStatus::Succeeded);
        assert_eq!(
            kinds(&outcome),
            vec![
                (StepKind::Setup, StepOutcome::Success),
                (StepKind::Install, StepOutcome::Success),
                (StepKind::TypeCheck, StepOutcome::Skipped),
                (StepKind::ParallelTests, StepOutcome::Success),
                (StepKind::SerialTests, StepOutcome::Success),
            ]
        );

        let resolved = outcome.resolved.unwrap();
        assert_eq!(resolved.mode, crate::resolver::ResolutionKind::Minimum);
        assert_eq!(resolved.get("numpy").unwrap().to_string(), "1.24");
        let written = std::fs::read_to_string(dir.path().join(outcome.spec.slug()).join("requirements.txt")).unwrap();
        assert_eq!(written, "numpy==1.24\n");
    }

    #[tokio::test]
    async fn test_setup_failure_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let fakes = FakeCollaborators::new().fail_setup();
        let runner = JobRunner::new(fakes.registry());

        let definition: JobDefinition = serde_yaml::from_str(TEST_JOB).unwrap();
        let outcome = runner.run(context(definition, 0, dir.path())).await;

        assert_eq!(outcome.status, JobStatus::Failed);
        assert_eq!(kinds(&outcome), vec![(StepKind::Setup, StepOutcome::Failure)]);
        assert!(outcome.forward.is_none());
    }

    #[tokio::test]
    async fn test_pinned_mode_without_lock_is_missing_pin() {
        let dir = tempfile::tempdir().unwrap();
        let fakes = FakeCollaborators::new();
        let runner = JobRunner::new(fakes.registry());

        let definition: JobDefinition = serde_yaml::from_str(TEST_JOB).unwrap();
        let outcome = runner.run(context(definition, 0, dir.path())).await;

        assert_eq!(outcome.status, JobStatus::Failed);
        let install = outcome.step(StepKind::Install).unwrap();
        assert_eq!(install.outcome, StepOutcome::Failure);
        assert!(install.message.as_deref().unwrap().contains("numpy"));
        assert_eq!(outcome.steps.len(), 2);
    }

    #[tokio::test]
    async fn test_failing_case_fails_step_but_keeps_coverage() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("requirements.lock"), "numpy==1.26.4\n").unwrap();

        let fakes = FakeCollaborators::new()
            .fail_case("unit_b")
            .with_coverage("unit_b", r#"{"files": {"src/x.py": {"lines": {"3": 1}}}}"#);
        let runner = JobRunner::new(fakes.registry());

        let mut definition: JobDefinition = serde_yaml::from_str(TEST_JOB).unwrap();
        if let Some(deps) = definition.dependencies.as_mut() {
            deps.lock_file = Some("requirements.lock".into());
        }
        let outcome = runner.run(context(definition, 0, dir.path())).await;

        assert_eq!(outcome.status, JobStatus::Failed);
        assert_eq!(outcome.step(StepKind::ParallelTests).unwrap().outcome, StepOutcome::Failure);
        assert_eq!(outcome.step(StepKind::SerialTests).unwrap().outcome, StepOutcome::Success);
        assert_eq!(outcome.coverage.as_ref().unwrap().line_hits("src/x.py", 3), Some(1));
        assert_eq!(outcome.forward, Some(ForwardOutcome::Forwarded));
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let dir = tempfile::tempdir().unwrap();
        let fakes = FakeCollaborators::new();
        let runner = JobRunner::new(fakes.registry());

        let definition: JobDefinition = serde_yaml::from_str(TEST_JOB).unwrap();
        let ctx = context(definition, 1, dir.path());
        ctx.cancel.cancel();

        let outcome = runner.run(ctx).await;
        assert_eq!(outcome.status, JobStatus::Cancelled);
        assert!(outcome.steps.is_empty());
        assert!(outcome.coverage.is_none());
        assert!(fakes.uploads().is_empty());
    }

    #[tokio::test]
    async fn test_lint_job_attaches_diff() {
        let dir = tempfile::tempdir().unwrap();
        let fakes = FakeCollaborators::new().with_lint_diff("-x=1\n+x = 1\n");
        let runner = JobRunner::new(fakes.registry());

        let definition: JobDefinition = serde_yaml::from_str("lint: { path: src }").unwrap();
        let outcome = runner.run(context(definition, 0, dir.path())).await;

        assert_eq!(outcome.status, JobStatus::Failed);
        let step = outcome.step(StepKind::Lint).unwrap();
        assert_eq!(step.artifacts[0].name, "lint.diff");
    }

    #[tokio::test]
    async fn test_analysis_findings_do_not_fail() {
        let dir = tempfile::tempdir().unwrap();
        let fakes = FakeCollaborators::new().with_findings(vec!["py/unused-import at a.py:1".to_string()]);
        let runner = JobRunner::new(fakes.registry());

        let definition: JobDefinition = serde_yaml::from_str("static-analysis: { language: python }").unwrap();
        let outcome = runner.run(context(definition, 0, dir.path())).await;

        assert_eq!(outcome.status, JobStatus::Succeeded);
        let step = outcome.step(StepKind::StaticAnalysis).unwrap();
        assert_eq!(step.message.as_deref(), Some("1 findings"));
        assert_eq!(step.artifacts.len(), 1);
    }
}
