// Orchestrator Errors
// Definition, configuration and job-local error types

use crate::execution::matrix::MatrixError;
use crate::resolver::ResolveError;

use thiserror::Error;

pub type OrchestratorResult<T> = Result<T, OrchestratorError>;

/// Errors raised while loading or validating a pipeline definition or config.
///
/// These abort the whole run before any job starts. Errors that happen
/// inside a job are [`JobError`]s and never leave that job.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid definition: {0}")]
    InvalidDefinition(String),

    #[error("Invalid matrix in job '{job}': {source}")]
    Matrix {
        job: String,
        #[source]
        source: MatrixError,
    },

    #[error("Invalid configuration: {0}")]
    Config(String),
}

/// The runtime environment for a job could not be established.
#[derive(Debug, Clone, Error)]
#[error("environment setup failed: {message}")]
pub struct SetupError {
    pub message: String,
}

impl SetupError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Installation of a resolved dependency set failed.
#[derive(Debug, Clone, Error)]
#[error("dependency installation failed: {diagnostics}")]
pub struct InstallError {
    pub diagnostics: String,
}

/// Errors fatal to a single job. Siblings keep running.
#[derive(Debug, Clone, Error)]
pub enum JobError {
    #[error(transparent)]
    Setup(#[from] SetupError),

    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error(transparent)]
    Install(#[from] InstallError),
}
