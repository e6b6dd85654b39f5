// In-memory Collaborators
// Scriptable stand-ins for every external tool, used by tests

use crate::coverage::CoverageUpload;
use crate::error::{InstallError, SetupError};
use crate::execution::context::JobContext;
use crate::resolver::{PackageVersion, ResolvedDependencySet};
use crate::runners::{
    CaseOutcome, CollaboratorError, CoverageReporter, Environment, EnvironmentProvisioner,
    InstallReport, LintTool, PackageInstaller, RunnerRegistry, StaticAnalyzer, TestExecutor,
    TestInvocation, ToolOutput, TypeChecker,
};
use crate::testing::partition::PartitionKind;

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Records every upload it receives.
#[derive(Debug, Default)]
pub struct RecordingReporter {
    uploads: Mutex<Vec<CoverageUpload>>,
}

impl RecordingReporter {
    pub fn uploads(&self) -> Vec<CoverageUpload> {
        self.uploads.lock().map(|u| u.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl CoverageReporter for RecordingReporter {
    async fn submit(&self, upload: &CoverageUpload) -> Result<(), CollaboratorError> {
        if let Ok(mut uploads) = self.uploads.lock() {
            uploads.push(upload.clone());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
struct FakeConfig {
    setup_fails: bool,
    install_fails: bool,
    type_check_fails: bool,
    discover_fails: bool,
    discovered: Vec<String>,
    failing_cases: HashSet<String>,
    erroring_cases: HashSet<String>,
    case_delays: HashMap<String, Duration>,
    coverage: HashMap<String, String>,
    default_coverage: Option<String>,
    case_delay: Duration,
    /// Installed versions keyed by job id, `*` for every job
    installed: HashMap<String, BTreeMap<String, PackageVersion>>,
    lint_diff: String,
    findings: Vec<String>,
}

#[derive(Debug, Default)]
struct FakeRuntime {
    calls: Mutex<Vec<String>>,
    /// (running, peak) per job and partition
    concurrency: Mutex<HashMap<(String, PartitionKind), (usize, usize)>>,
}

/// Every collaborator at once, scripted through builder methods.
#[derive(Debug, Clone, Default)]
pub struct FakeCollaborators {
    config: FakeConfig,
    runtime: Arc<FakeRuntime>,
    reporter: Arc<RecordingReporter>,
}

impl FakeCollaborators {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_setup(mut self) -> Self {
        self.config.setup_fails = true;
        self
    }

    pub fn fail_install(mut self) -> Self {
        self.config.install_fails = true;
        self
    }

    pub fn fail_type_check(mut self) -> Self {
        self.config.type_check_fails = true;
        self
    }

    pub fn fail_discovery(mut self) -> Self {
        self.config.discover_fails = true;
        self
    }

    pub fn with_discovered(mut self, cases: &[&str]) -> Self {
        self.config.discovered = cases.iter().map(|c| c.to_string()).collect();
        self
    }

    pub fn fail_case(mut self, case: &str) -> Self {
        self.config.failing_cases.insert(case.to_string());
        self
    }

    /// The runner itself fails for this case, instead of the case failing.
    pub fn error_case(mut self, case: &str) -> Self {
        self.config.erroring_cases.insert(case.to_string());
        self
    }

    pub fn with_delay_for(mut self, case: &str, delay: Duration) -> Self {
        self.config.case_delays.insert(case.to_string(), delay);
        self
    }

    pub fn with_coverage(mut self, case: &str, payload: &str) -> Self {
        self.config.coverage.insert(case.to_string(), payload.to_string());
        self
    }

    /// Coverage payload for every case without its own.
    pub fn with_default_coverage(mut self, payload: &str) -> Self {
        self.config.default_coverage = Some(payload.to_string());
        self
    }

    pub fn with_case_delay(mut self, delay: Duration) -> Self {
        self.config.case_delay = delay;
        self
    }

    pub fn with_installed(self, package: &str, version: &str) -> Self {
        self.with_installed_for("*", package, version)
    }

    pub fn with_installed_for(mut self, job: &str, package: &str, version: &str) -> Self {
        if let Ok(version) = PackageVersion::parse(version) {
            self.config
                .installed
                .entry(job.to_string())
                .or_default()
                .insert(crate::resolver::normalize_package_name(package), version);
        }
        self
    }

    pub fn with_lint_diff(mut self, diff: &str) -> Self {
        self.config.lint_diff = diff.to_string();
        self
    }

    pub fn with_findings(mut self, findings: Vec<String>) -> Self {
        self.config.findings = findings;
        self
    }

    /// A registry whose collaborators all share this fake's state.
    pub fn registry(&self) -> RunnerRegistry {
        let shared = Arc::new(self.clone());
        RunnerRegistry {
            provisioner: shared.clone(),
            installer: shared.clone(),
            type_checker: shared.clone(),
            tests: shared.clone(),
            lint: shared.clone(),
            analyzer: shared,
            reporter: self.reporter.clone(),
            index: None,
        }
    }

    pub fn reporter(&self) -> Arc<RecordingReporter> {
        self.reporter.clone()
    }

    pub fn uploads(&self) -> Vec<CoverageUpload> {
        self.reporter.uploads()
    }

    /// Calls received, e.g. `setup:pytest[ubuntu-latest,3.10]`.
    pub fn calls(&self) -> Vec<String> {
        self.runtime.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    /// Highest number of cases seen running at once for one job's partition.
    pub fn peak_concurrency(&self, job: &str, partition: PartitionKind) -> usize {
        self.runtime
            .concurrency
            .lock()
            .ok()
            .and_then(|map| map.get(&(job.to_string(), partition)).map(|(_, peak)| *peak))
            .unwrap_or(0)
    }

    fn record(&self, call: String) {
        if let Ok(mut calls) = self.runtime.calls.lock() {
            calls.push(call);
        }
    }

    fn enter(&self, job: &str, partition: PartitionKind) {
        if let Ok(mut map) = self.runtime.concurrency.lock() {
            let entry = map.entry((job.to_string(), partition)).or_insert((0, 0));
            entry.0 += 1;
            entry.1 = entry.1.max(entry.0);
        }
    }

    fn leave(&self, job: &str, partition: PartitionKind) {
        if let Ok(mut map) = self.runtime.concurrency.lock() {
            if let Some(entry) = map.get_mut(&(job.to_string(), partition)) {
                entry.0 = entry.0.saturating_sub(1);
            }
        }
    }
}

#[async_trait]
impl EnvironmentProvisioner for FakeCollaborators {
    async fn provision(&self, ctx: &JobContext) -> Result<Environment, SetupError> {
        self.record(format!("setup:{}", ctx.spec.id()));
        if self.config.setup_fails {
            return Err(SetupError::new(format!(
                "runtime {} unavailable",
                ctx.runtime_version().unwrap_or("default")
            )));
        }
        Ok(Environment {
            path: ctx.job_dir.join("env"),
            runtime_version: ctx.runtime_version().map(String::from),
            env: HashMap::new(),
        })
    }
}

#[async_trait]
impl PackageInstaller for FakeCollaborators {
    async fn install(
        &self,
        ctx: &JobContext,
        _env: &Environment,
        resolved: &ResolvedDependencySet,
        _requirements: &Path,
    ) -> Result<InstallReport, InstallError> {
        let job = ctx.spec.id();
        self.record(format!("install:{}", job));
        if self.config.install_fails {
            return Err(InstallError {
                diagnostics: "no matching distribution found".to_string(),
            });
        }

        let mut installed = self.config.installed.get("*").cloned().unwrap_or_default();
        if let Some(specific) = self.config.installed.get(&job) {
            installed.extend(specific.clone());
        }

        Ok(InstallReport {
            installed,
            log: format!("installed {} packages", resolved.len()),
        })
    }
}

#[async_trait]
impl TypeChecker for FakeCollaborators {
    async fn check(&self, ctx: &JobContext, _env: &Environment) -> Result<ToolOutput, CollaboratorError> {
        self.record(format!("type-check:{}", ctx.spec.id()));
        Ok(ToolOutput {
            success: !self.config.type_check_fails,
            output: if self.config.type_check_fails {
                "src/x.py:1: error: incompatible types".to_string()
            } else {
                String::new()
            },
        })
    }
}

#[async_trait]
impl TestExecutor for FakeCollaborators {
    async fn discover(&self, ctx: &JobContext, _env: &Environment) -> Result<Vec<String>, CollaboratorError> {
        self.record(format!("discover:{}", ctx.spec.id()));
        if self.config.discover_fails {
            return Err(CollaboratorError::new("discover", "collection error"));
        }
        Ok(self.config.discovered.clone())
    }

    async fn run_case(
        &self,
        ctx: &JobContext,
        _env: &Environment,
        invocation: &TestInvocation,
    ) -> Result<CaseOutcome, CollaboratorError> {
        let job = ctx.spec.id();
        self.record(format!("case:{}:{}", job, invocation.case));

        let delay = self
            .config
            .case_delays
            .get(&invocation.case)
            .copied()
            .unwrap_or(self.config.case_delay);

        self.enter(&job, invocation.partition);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.leave(&job, invocation.partition);
        self.record(format!("done:{}:{}", job, invocation.case));

        if self.config.erroring_cases.contains(&invocation.case) {
            return Err(CollaboratorError::new("test", format!("cannot run {}", invocation.case)));
        }

        let coverage = self
            .config
            .coverage
            .get(&invocation.case)
            .or(self.config.default_coverage.as_ref())
            .cloned();

        Ok(CaseOutcome {
            passed: !self.config.failing_cases.contains(&invocation.case),
            output: format!("ran {}", invocation.case),
            coverage,
            duration: delay,
        })
    }
}

#[async_trait]
impl LintTool for FakeCollaborators {
    async fn diff(&self, ctx: &JobContext, path: &str, base: &str) -> Result<String, CollaboratorError> {
        self.record(format!("lint:{}:{}..{}", ctx.spec.id(), base, path));
        Ok(self.config.lint_diff.clone())
    }
}

#[async_trait]
impl StaticAnalyzer for FakeCollaborators {
    async fn analyze(
        &self,
        ctx: &JobContext,
        _path: &str,
        language: &str,
    ) -> Result<Vec<String>, CollaboratorError> {
        self.record(format!("analyze:{}:{}", ctx.spec.id(), language));
        Ok(self.config.findings.clone())
    }
}
