// Orchestrator Configuration
// Layered settings: built-ins, user file, project file, environment, overrides

use crate::error::{OrchestratorError, OrchestratorResult};
use crate::execution::executor::ExecutorConfig;
use crate::utils::find_repo_root;

use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// File name of the project-level configuration, looked up at the repository root
pub const PROJECT_CONFIG_FILE: &str = ".matrixci.yml";

pub const ENV_MAX_PARALLEL: &str = "MATRIXCI_MAX_PARALLEL";
pub const ENV_WORKERS: &str = "MATRIXCI_WORKERS";
pub const ENV_WORK_DIR: &str = "MATRIXCI_WORK_DIR";
pub const ENV_COVERAGE_DIR: &str = "MATRIXCI_COVERAGE_DIR";

/// Effective orchestrator settings
#[derive(Debug, Clone, PartialEq)]
pub struct OrchestratorConfig {
    /// Job instances running at once across a run (0 = unlimited)
    pub max_parallel: usize,
    /// Parallel-safe partition workers when a job declares none
    pub workers: usize,
    /// Parent of per-run job directories; relative paths are taken from the repository root
    pub work_dir: PathBuf,
    /// Where the file coverage reporter writes its reports
    pub coverage_dir: PathBuf,
    /// Step timeout for jobs without `timeout-minutes`
    pub step_timeout_minutes: Option<u32>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        let workers = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(2);

        Self {
            max_parallel: 0,
            workers,
            work_dir: PathBuf::from(".matrixci"),
            coverage_dir: PathBuf::from(".matrixci").join("coverage"),
            step_timeout_minutes: None,
        }
    }
}

/// One configuration layer. Unset keys leave the layer below untouched.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct ConfigLayer {
    #[serde(default)]
    pub max_parallel: Option<usize>,
    #[serde(default)]
    pub workers: Option<usize>,
    #[serde(default)]
    pub work_dir: Option<PathBuf>,
    #[serde(default)]
    pub coverage_dir: Option<PathBuf>,
    #[serde(default)]
    pub step_timeout_minutes: Option<u32>,
}

impl ConfigLayer {
    pub fn from_file(path: &Path) -> OrchestratorResult<Self> {
        let content = std::fs::read_to_string(path)?;
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(&content)
            .map_err(|e| OrchestratorError::Config(format!("{}: {}", path.display(), e)))
    }

    /// The layer described by `MATRIXCI_*` variables.
    pub fn from_env(env: &HashMap<String, String>) -> OrchestratorResult<Self> {
        Ok(Self {
            max_parallel: parse_env(env, ENV_MAX_PARALLEL)?,
            workers: parse_env(env, ENV_WORKERS)?,
            work_dir: env.get(ENV_WORK_DIR).map(PathBuf::from),
            coverage_dir: env.get(ENV_COVERAGE_DIR).map(PathBuf::from),
            step_timeout_minutes: None,
        })
    }
}

fn parse_env(env: &HashMap<String, String>, key: &str) -> OrchestratorResult<Option<usize>> {
    env.get(key)
        .map(|value| {
            value
                .trim()
                .parse()
                .map_err(|_| OrchestratorError::Config(format!("{} must be a number, got '{}'", key, value)))
        })
        .transpose()
}

impl OrchestratorConfig {
    /// `<config dir>/matrixci/config.yml`
    pub fn user_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("matrixci").join("config.yml"))
    }

    /// Load every layer for a run from `repo_root` using the process environment.
    pub fn load(repo_root: &Path) -> OrchestratorResult<Self> {
        let env: HashMap<String, String> = std::env::vars().collect();
        Self::load_from(Self::user_config_path().as_deref(), repo_root, &env)
    }

    /// Load with an explicit user file and environment. Missing files are
    /// skipped; malformed ones are errors.
    pub fn load_from(
        user_file: Option<&Path>,
        repo_root: &Path,
        env: &HashMap<String, String>,
    ) -> OrchestratorResult<Self> {
        let mut config = Self::default();

        if let Some(path) = user_file.filter(|p| p.is_file()) {
            tracing::debug!(path = %path.display(), "loading user config");
            config.apply(ConfigLayer::from_file(path)?);
        }

        let root = find_repo_root(repo_root).unwrap_or_else(|| repo_root.to_path_buf());
        let project = root.join(PROJECT_CONFIG_FILE);
        if project.is_file() {
            tracing::debug!(path = %project.display(), "loading project config");
            config.apply(ConfigLayer::from_file(&project)?);
        }

        config.apply(ConfigLayer::from_env(env)?);
        config.validate()?;
        Ok(config)
    }

    pub fn apply(&mut self, layer: ConfigLayer) {
        if let Some(max_parallel) = layer.max_parallel {
            self.max_parallel = max_parallel;
        }
        if let Some(workers) = layer.workers {
            self.workers = workers;
        }
        if let Some(work_dir) = layer.work_dir {
            self.work_dir = work_dir;
        }
        if let Some(coverage_dir) = layer.coverage_dir {
            self.coverage_dir = coverage_dir;
        }
        if let Some(minutes) = layer.step_timeout_minutes {
            self.step_timeout_minutes = Some(minutes);
        }
    }

    /// Apply a final layer, typically from command-line flags.
    pub fn with_overrides(mut self, overrides: ConfigLayer) -> OrchestratorResult<Self> {
        self.apply(overrides);
        self.validate()?;
        Ok(self)
    }

    fn validate(&self) -> OrchestratorResult<()> {
        if self.workers == 0 {
            return Err(OrchestratorError::Config("workers must be at least 1".to_string()));
        }
        if self.step_timeout_minutes == Some(0) {
            return Err(OrchestratorError::Config(
                "step-timeout-minutes must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn coverage_dir(&self, repo_root: &Path) -> PathBuf {
        repo_root.join(&self.coverage_dir)
    }

    pub fn executor_config(&self, repo_root: &Path) -> ExecutorConfig {
        ExecutorConfig {
            max_parallel: self.max_parallel,
            default_workers: self.workers,
            work_dir: repo_root.to_path_buf(),
            job_root: Some(repo_root.join(&self.work_dir)),
            step_timeout: self
                .step_timeout_minutes
                .map(|minutes| Duration::from_secs(u64::from(minutes) * 60)),
        }
    }
}
