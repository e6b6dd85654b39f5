// Pipeline Orchestrator Library
// Matrix CI runs: expansion, dependency resolution, test partitions and coverage

pub mod config;
pub mod coverage;
pub mod error;
pub mod execution;
pub mod resolver;
pub mod runners;
pub mod testing;
pub mod utils;
pub mod workflow;

// Re-export commonly used types
pub use config::{ConfigLayer, OrchestratorConfig};
pub use error::{JobError, OrchestratorError, OrchestratorResult};

// Re-export workflow types
pub use workflow::{JobDefinition, PipelineDefinition, WorkflowParser};

// Re-export execution types
pub use execution::{
    progress_channel, ConcurrencyController, EventKind, ExecutionEvent, ExecutorConfig,
    JobOutcome, JobSpec, JobStatus, MatrixExpander, PipelineExecutor, PipelineOutcome,
    PipelineStatus, ProgressSender, StepKind, StepOutcome, TriggerEvent,
};

// Re-export resolver types
pub use resolver::{DependencyResolver, LockSet, ResolutionMode, ResolvedDependencySet};

// Re-export coverage types
pub use coverage::{CoverageAggregator, CoverageReport, FileCoverageReporter};

// Re-export runner types
pub use runners::{CommandCollaborator, RunnerRegistry, ShellRunner};

// Re-export reporting types
pub use testing::{ReportFormat, RunReporter};
