// Runners Module
// Collaborator traits for the external tools a job drives

pub mod command;
pub mod fakes;
pub mod shell;

pub use command::CommandCollaborator;
pub use shell::{Shell, ShellOutput, ShellRunner};

use crate::coverage::CoverageUpload;
use crate::error::{InstallError, SetupError};
use crate::execution::context::JobContext;
use crate::resolver::{PackageIndex, PackageVersion, ResolvedDependencySet};
use crate::testing::partition::PartitionKind;

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// A collaborator could not do its work at all (as opposed to reporting a
/// failing check).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{tool}: {message}")]
pub struct CollaboratorError {
    pub tool: String,
    pub message: String,
}

impl CollaboratorError {
    pub fn new(tool: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            tool: tool.into(),
            message: message.into(),
        }
    }
}

/// A provisioned runtime environment.
#[derive(Debug, Clone, Default)]
pub struct Environment {
    pub path: PathBuf,
    pub runtime_version: Option<String>,
    /// Extra variables for every later command
    pub env: HashMap<String, String>,
}

/// What an installer reports after a successful install.
#[derive(Debug, Clone, Default)]
pub struct InstallReport {
    /// Versions actually installed, when the installer can tell
    pub installed: BTreeMap<String, PackageVersion>,
    pub log: String,
}

/// Output of a pass/fail tool run.
#[derive(Debug, Clone, Default)]
pub struct ToolOutput {
    pub success: bool,
    pub output: String,
}

/// One test case to run.
#[derive(Debug, Clone)]
pub struct TestInvocation {
    pub case: String,
    pub partition: PartitionKind,
    /// Where the case should write its coverage fragment
    pub coverage_path: PathBuf,
    /// Worker count of the partition the case runs in
    pub workers: usize,
}

/// Result of one test case.
#[derive(Debug, Clone, Default)]
pub struct CaseOutcome {
    pub passed: bool,
    pub output: String,
    /// Raw coverage payload, if the case produced one
    pub coverage: Option<String>,
    pub duration: Duration,
}

#[async_trait]
pub trait EnvironmentProvisioner: Send + Sync {
    async fn provision(&self, ctx: &JobContext) -> Result<Environment, SetupError>;
}

#[async_trait]
pub trait PackageInstaller: Send + Sync {
    async fn install(
        &self,
        ctx: &JobContext,
        env: &Environment,
        resolved: &ResolvedDependencySet,
        requirements: &std::path::Path,
    ) -> Result<InstallReport, InstallError>;
}

#[async_trait]
pub trait TypeChecker: Send + Sync {
    async fn check(&self, ctx: &JobContext, env: &Environment) -> Result<ToolOutput, CollaboratorError>;
}

#[async_trait]
pub trait TestExecutor: Send + Sync {
    /// List test case ids beyond those declared statically.
    async fn discover(&self, ctx: &JobContext, env: &Environment) -> Result<Vec<String>, CollaboratorError>;

    async fn run_case(
        &self,
        ctx: &JobContext,
        env: &Environment,
        invocation: &TestInvocation,
    ) -> Result<CaseOutcome, CollaboratorError>;
}

#[async_trait]
pub trait LintTool: Send + Sync {
    /// The formatting diff required over `path` relative to `base`. Empty
    /// means clean.
    async fn diff(&self, ctx: &JobContext, path: &str, base: &str) -> Result<String, CollaboratorError>;
}

#[async_trait]
pub trait StaticAnalyzer: Send + Sync {
    /// Findings, one per entry, unclassified.
    async fn analyze(
        &self,
        ctx: &JobContext,
        path: &str,
        language: &str,
    ) -> Result<Vec<String>, CollaboratorError>;
}

#[async_trait]
pub trait CoverageReporter: Send + Sync {
    async fn submit(&self, upload: &CoverageUpload) -> Result<(), CollaboratorError>;
}

/// The collaborators a run uses.
#[derive(Clone)]
pub struct RunnerRegistry {
    pub provisioner: Arc<dyn EnvironmentProvisioner>,
    pub installer: Arc<dyn PackageInstaller>,
    pub type_checker: Arc<dyn TypeChecker>,
    pub tests: Arc<dyn TestExecutor>,
    pub lint: Arc<dyn LintTool>,
    pub analyzer: Arc<dyn StaticAnalyzer>,
    pub reporter: Arc<dyn CoverageReporter>,
    pub index: Option<Arc<dyn PackageIndex>>,
}

impl RunnerRegistry {
    /// Shell-backed collaborators for every tool, reporting coverage through
    /// `reporter`.
    pub fn shell(reporter: Arc<dyn CoverageReporter>) -> Self {
        let commands = Arc::new(CommandCollaborator::new());
        Self {
            provisioner: commands.clone(),
            installer: commands.clone(),
            type_checker: commands.clone(),
            tests: commands.clone(),
            lint: commands.clone(),
            analyzer: commands,
            reporter,
            index: None,
        }
    }

    pub fn with_provisioner(mut self, provisioner: Arc<dyn EnvironmentProvisioner>) -> Self {
        self.provisioner = provisioner;
        self
    }

    pub fn with_installer(mut self, installer: Arc<dyn PackageInstaller>) -> Self {
        self.installer = installer;
        self
    }

    pub fn with_type_checker(mut self, type_checker: Arc<dyn TypeChecker>) -> Self {
        self.type_checker = type_checker;
        self
    }

    pub fn with_tests(mut self, tests: Arc<dyn TestExecutor>) -> Self {
        self.tests = tests;
        self
    }

    pub fn with_lint(mut self, lint: Arc<dyn LintTool>) -> Self {
        self.lint = lint;
        self
    }

    pub fn with_analyzer(mut self, analyzer: Arc<dyn StaticAnalyzer>) -> Self {
        self.analyzer = analyzer;
        self
    }

    pub fn with_reporter(mut self, reporter: Arc<dyn CoverageReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    pub fn with_index(mut self, index: Arc<dyn PackageIndex>) -> Self {
        self.index = Some(index);
        self
    }
}
