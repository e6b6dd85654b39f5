use crate::resolver::DependencyConstraint;

use serde::de::{self, Deserializer};
use serde::Deserialize;
use serde_yaml::{Mapping, Value};

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;

/// A declarative pipeline definition.
///
/// This represents the top-level structure of a pipeline YAML file. It is
/// loaded once per run and never mutated afterwards.
#[derive(Debug, Clone, Deserialize)]
pub struct PipelineDefinition {
    /// The name of the pipeline, also the default workflow identity
    pub name: Option<String>,

    /// Which trigger events start a run
    #[serde(rename = "on")]
    pub on: Trigger,

    /// Pipeline-level environment variables
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Concurrency group and cancellation policy
    #[serde(default)]
    pub concurrency: Option<Concurrency>,

    /// The jobs that make up this pipeline, keyed by job id
    pub jobs: Jobs,
}

/// Job definitions keyed by id, in declaration order.
#[derive(Debug, Clone, Default)]
pub struct Jobs(Vec<(String, JobDefinition)>);

impl Jobs {
    pub fn get(&self, id: &str) -> Option<&JobDefinition> {
        self.0.iter().find(|(job_id, _)| job_id == id).map(|(_, job)| job)
    }

    pub fn contains_key(&self, id: &str) -> bool {
        self.get(id).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &JobDefinition)> {
        self.0.iter().map(|(id, job)| (id, job))
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(|(id, _)| id.as_str())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<'a> IntoIterator for &'a Jobs {
    type Item = (&'a String, &'a JobDefinition);
    type IntoIter = std::iter::Map<
        std::slice::Iter<'a, (String, JobDefinition)>,
        fn(&'a (String, JobDefinition)) -> (&'a String, &'a JobDefinition),
    >;

    fn into_iter(self) -> Self::IntoIter {
        fn split(entry: &(String, JobDefinition)) -> (&String, &JobDefinition) {
            (&entry.0, &entry.1)
        }
        self.0.iter().map(split as fn(&'a (String, JobDefinition)) -> (&'a String, &'a JobDefinition))
    }
}

impl<'de> Deserialize<'de> for Jobs {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        // Mapping keeps declaration order, which fixes run and report order
        let mapping = Mapping::deserialize(deserializer)?;
        let mut jobs = Vec::with_capacity(mapping.len());

        for (key, value) in mapping {
            let id = key
                .as_str()
                .ok_or_else(|| de::Error::custom("job ids must be strings"))?
                .to_string();
            let job: JobDefinition = serde_yaml::from_value(value)
                .map_err(|e| de::Error::custom(format!("job '{}': {}", id, e)))?;
            jobs.push((id, job));
        }

        Ok(Jobs(jobs))
    }
}

/// Trigger configuration for when the pipeline should run.
///
/// Supports multiple trigger formats:
/// - Simple: `on: push`
/// - List: `on: [push, pull_request]`
/// - Detailed: `on: { push: { branches: [main] } }`
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum Trigger {
    /// Single event trigger: `on: push`
    Single(String),

    /// Multiple events: `on: [push, pull_request]`
    Multiple(Vec<String>),

    /// Detailed event configuration
    Detailed(BTreeMap<String, Option<EventSpec>>),
}

/// Per-event configuration in the detailed trigger form.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum EventSpec {
    /// `schedule: [{ cron: "..." }]`
    Schedules(Vec<CronEntry>),

    /// Filters for push, pull_request and friends
    Config(EventConfig),
}

#[derive(Debug, Clone, Deserialize)]
pub struct CronEntry {
    pub cron: String,
}

/// Ref filters for a trigger event.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct EventConfig {
    /// Branch filters for push/pull_request events
    #[serde(default)]
    pub branches: Vec<String>,

    /// Branch ignore patterns
    #[serde(default, rename = "branches-ignore")]
    pub branches_ignore: Vec<String>,

    /// Tag filters for push events
    #[serde(default)]
    pub tags: Vec<String>,

    /// Tag ignore patterns
    #[serde(default, rename = "tags-ignore")]
    pub tags_ignore: Vec<String>,

    /// Event types (accepted for compatibility, not filtered on)
    #[serde(default)]
    pub types: Vec<String>,

    /// Cron schedule in the single-entry form
    #[serde(default)]
    pub cron: Option<String>,
}

/// Concurrency settings to limit pipeline runs.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum Concurrency {
    /// Simple concurrency group template
    Simple(String),

    /// Detailed concurrency configuration
    Detailed {
        group: String,
        #[serde(default = "default_cancel_in_progress", rename = "cancel-in-progress")]
        cancel_in_progress: bool,
    },
}

fn default_cancel_in_progress() -> bool {
    true
}

impl Concurrency {
    pub fn group(&self) -> &str {
        match self {
            Concurrency::Simple(group) => group,
            Concurrency::Detailed { group, .. } => group,
        }
    }

    pub fn cancel_in_progress(&self) -> bool {
        match self {
            Concurrency::Simple(_) => true,
            Concurrency::Detailed {
                cancel_in_progress, ..
            } => *cancel_in_progress,
        }
    }
}

/// What kind of work a job performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobRole {
    /// Setup, install, type-check and partitioned tests
    Test,
    /// Formatting diff over a source subtree
    Lint,
    /// Static-analysis scan
    StaticAnalysis,
}

/// A job within a pipeline.
#[derive(Debug, Clone, Deserialize)]
pub struct JobDefinition {
    /// Display name for the job
    #[serde(default)]
    pub name: Option<String>,

    /// Runner label, informational (`${{ matrix.os }}` is typical)
    #[serde(default, rename = "runs-on")]
    pub runs_on: Option<String>,

    /// Matrix strategy for running multiple job instances
    #[serde(default)]
    pub strategy: Option<Strategy>,

    /// Per-step timeout in minutes
    #[serde(default, rename = "timeout-minutes")]
    pub timeout_minutes: Option<u32>,

    /// Job-level environment variables
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Which axis selects the runtime version, and how to provision it
    #[serde(default)]
    pub runtime: Option<RuntimeSpec>,

    /// Declared dependency constraints and install commands
    #[serde(default)]
    pub dependencies: Option<DependencySpec>,

    /// Static type/shape verification
    #[serde(default, rename = "type-check")]
    pub type_check: Option<CommandSpec>,

    /// Test suite definition
    #[serde(default)]
    pub tests: Option<TestSpec>,

    /// Lint over a diff region
    #[serde(default)]
    pub lint: Option<LintSpec>,

    /// Static-analysis scan
    #[serde(default, rename = "static-analysis")]
    pub static_analysis: Option<AnalysisSpec>,
}

impl JobDefinition {
    /// The job's role, or `None` when it declares more than one.
    pub fn role(&self) -> Option<JobRole> {
        let test_like = self.tests.is_some()
            || self.type_check.is_some()
            || self.dependencies.is_some()
            || self.runtime.is_some();

        match (test_like, self.lint.is_some(), self.static_analysis.is_some()) {
            (_, false, false) => Some(JobRole::Test),
            (false, true, false) => Some(JobRole::Lint),
            (false, false, true) => Some(JobRole::StaticAnalysis),
            _ => None,
        }
    }

    /// The matrix declaration, if any.
    pub fn matrix(&self) -> Option<&Matrix> {
        self.strategy.as_ref().and_then(|s| s.matrix.as_ref())
    }
}

/// Strategy configuration for matrix builds.
#[derive(Debug, Clone, Deserialize)]
pub struct Strategy {
    /// Matrix configuration
    #[serde(default)]
    pub matrix: Option<Matrix>,

    /// Whether to cancel sibling instances once one fails
    #[serde(default, rename = "fail-fast")]
    pub fail_fast: bool,

    /// Maximum number of instances to run in parallel
    #[serde(default, rename = "max-parallel")]
    pub max_parallel: Option<u32>,
}

/// Matrix configuration as declared, in declaration order.
///
/// Every key other than `include`/`exclude` is an axis; its value must be a
/// sequence of scalars.
#[derive(Debug, Clone, Default)]
pub struct Matrix {
    /// Axes and their candidate values
    pub axes: Vec<(String, Vec<Value>)>,

    /// Extra combinations to append
    pub include: Vec<Mapping>,

    /// Combinations to remove after inclusion
    pub exclude: Vec<Mapping>,
}

impl<'de> Deserialize<'de> for Matrix {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        // serde_yaml::Mapping keeps insertion order, which fixes job numbering
        let mapping = Mapping::deserialize(deserializer)?;
        let mut matrix = Matrix::default();

        for (key, value) in mapping {
            let key = key
                .as_str()
                .ok_or_else(|| de::Error::custom("matrix keys must be strings"))?
                .to_string();

            match key.as_str() {
                "include" | "exclude" => {
                    let rules: Vec<Mapping> =
                        serde_yaml::from_value(value).map_err(de::Error::custom)?;
                    if key == "include" {
                        matrix.include = rules;
                    } else {
                        matrix.exclude = rules;
                    }
                }
                _ => match value {
                    Value::Sequence(values) => matrix.axes.push((key, values)),
                    _ => {
                        return Err(de::Error::custom(format!(
                            "matrix axis '{}' must be a list of values",
                            key
                        )))
                    }
                },
            }
        }

        Ok(matrix)
    }
}

/// Runtime provisioning for a job.
#[derive(Debug, Clone, Deserialize)]
pub struct RuntimeSpec {
    /// Matrix axis that carries the runtime version
    pub axis: String,

    /// Command that establishes the runtime in `${{ env.path }}`
    #[serde(default)]
    pub setup: Option<String>,
}

/// Dependency declarations for a job.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DependencySpec {
    /// Declared version bounds
    #[serde(default)]
    pub constraints: Vec<DependencyConstraint>,

    /// Pinned set used by normal jobs
    #[serde(default, rename = "lock-file")]
    pub lock_file: Option<PathBuf>,

    /// Published versions per package, consulted in minimum mode
    #[serde(default, rename = "index-file")]
    pub index_file: Option<PathBuf>,

    /// Install command; `${{ deps.requirements }}` names the requirement file
    #[serde(default)]
    pub install: Option<String>,

    /// Command printing installed `name==version` lines
    #[serde(default)]
    pub freeze: Option<String>,
}

/// A single shell command.
#[derive(Debug, Clone, Deserialize)]
pub struct CommandSpec {
    pub run: String,
}

/// Test suite definition for a job.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TestSpec {
    /// Command printing one test id per line
    #[serde(default)]
    pub discover: Option<String>,

    /// Statically declared cases
    #[serde(default)]
    pub cases: Vec<TestCaseDef>,

    /// Patterns marking cases as serial-only
    #[serde(default)]
    pub serial: Vec<String>,

    /// Command running one case; sees `${{ test.case }}`,
    /// `${{ test.coverage }}` and `${{ test.workers }}`
    #[serde(default)]
    pub run: Option<String>,

    /// Worker count for the parallel-safe partition
    #[serde(default)]
    pub workers: Option<usize>,
}

/// A statically declared test case.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum TestCaseDef {
    Id(String),
    Detailed {
        id: String,
        #[serde(default)]
        serial: bool,
    },
}

impl TestCaseDef {
    pub fn id(&self) -> &str {
        match self {
            TestCaseDef::Id(id) => id,
            TestCaseDef::Detailed { id, .. } => id,
        }
    }

    pub fn is_serial(&self) -> bool {
        matches!(self, TestCaseDef::Detailed { serial: true, .. })
    }
}

/// Lint over a diff region.
#[derive(Debug, Clone, Deserialize)]
pub struct LintSpec {
    /// Source subtree to lint
    #[serde(default = "default_path")]
    pub path: String,

    /// Diff base revision
    #[serde(default = "default_base")]
    pub base: String,

    /// Command printing the required formatting diff
    #[serde(default)]
    pub run: Option<String>,
}

/// Static-analysis scan.
#[derive(Debug, Clone, Deserialize)]
pub struct AnalysisSpec {
    /// Declared source language
    pub language: String,

    /// Source tree to scan
    #[serde(default = "default_path")]
    pub path: String,

    /// Command printing one finding per line
    #[serde(default)]
    pub run: Option<String>,
}

fn default_path() -> String {
    ".".to_string()
}

fn default_base() -> String {
    "origin/main".to_string()
}
