// Execution Engine Module
// Matrix expansion, admission, job runs and pipeline scheduling

pub mod concurrency;
pub mod context;
pub mod events;
pub mod executor;
pub mod job;
pub mod matrix;
pub mod trigger;

// Re-export key types
pub use concurrency::{AdmissionPolicy, ConcurrencyController, RunHandle, RunId};
pub use context::{JobContext, TemplateVars};
pub use events::{progress_channel, ExecutionEvent, LogLevel, ProgressReceiver, ProgressSender};
pub use executor::{DriftFinding, ExecutorConfig, PipelineExecutor, PipelineOutcome, PipelineStatus};
pub use job::{resolve_dependencies, JobOutcome, JobRunner, JobStatus, StepKind, StepOutcome, StepResult};
pub use matrix::{JobSpec, MatrixError, MatrixExpander};
pub use trigger::{EventKind, TriggerEvent, TriggerFilter};
