// Execution Events
// Progress reporting and event types for pipeline execution

use crate::coverage::ForwardOutcome;
use crate::execution::concurrency::RunId;
use crate::execution::executor::PipelineStatus;
use crate::execution::job::{JobStatus, StepKind, StepOutcome};

use std::time::Duration;
use tokio::sync::mpsc;

/// Sender for execution progress events
pub type ProgressSender = mpsc::UnboundedSender<ExecutionEvent>;

/// Receiver for execution progress events
pub type ProgressReceiver = mpsc::UnboundedReceiver<ExecutionEvent>;

/// Create a new progress channel
pub fn progress_channel() -> (ProgressSender, ProgressReceiver) {
    mpsc::unbounded_channel()
}

/// Events emitted during pipeline execution
#[derive(Debug, Clone)]
pub enum ExecutionEvent {
    /// The trigger filter rejected the event
    RunSkipped { workflow: String, reason: String },

    /// Run admitted into its concurrency group
    PipelineStarted {
        run_id: RunId,
        workflow: String,
        group: String,
        total_jobs: usize,
    },

    /// An earlier run of the same group was cancelled by this one
    RunSuperseded { cancelled: RunId, by: RunId },

    /// Pipeline execution completed
    PipelineCompleted {
        run_id: RunId,
        workflow: String,
        status: PipelineStatus,
        duration: Duration,
    },

    /// Job instance started
    JobStarted {
        job: String,
        display_name: String,
        total_steps: usize,
    },

    /// Job instance completed
    JobCompleted {
        job: String,
        status: JobStatus,
        duration: Duration,
    },

    /// Step execution started
    StepStarted {
        job: String,
        step: StepKind,
        step_index: usize,
    },

    /// Step execution completed
    StepCompleted {
        job: String,
        step: StepKind,
        step_index: usize,
        outcome: StepOutcome,
        message: Option<String>,
        duration: Duration,
    },

    /// Coverage handed to (or withheld from) the reporting collaborator
    Coverage { job: String, outcome: ForwardOutcome },

    /// Advisory message about the run or one job instance
    Log {
        level: LogLevel,
        message: String,
        job: Option<String>,
    },
}

/// Log level for log events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Info,
    Warning,
}

impl ExecutionEvent {
    /// Create a job started event
    pub fn job_started(job: impl Into<String>, display_name: impl Into<String>, total_steps: usize) -> Self {
        Self::JobStarted {
            job: job.into(),
            display_name: display_name.into(),
            total_steps,
        }
    }

    /// Create a job completed event
    pub fn job_completed(job: impl Into<String>, status: JobStatus, duration: Duration) -> Self {
        Self::JobCompleted {
            job: job.into(),
            status,
            duration,
        }
    }

    /// Create a step started event
    pub fn step_started(job: impl Into<String>, step: StepKind, step_index: usize) -> Self {
        Self::StepStarted {
            job: job.into(),
            step,
            step_index,
        }
    }

    /// Create a warning log event
    pub fn warning(message: impl Into<String>, job: Option<String>) -> Self {
        Self::Log {
            level: LogLevel::Warning,
            message: message.into(),
            job,
        }
    }

    /// Create an info log event
    pub fn info(message: impl Into<String>, job: Option<String>) -> Self {
        Self::Log {
            level: LogLevel::Info,
            message: message.into(),
            job,
        }
    }
}

/// Helper trait for sending events, ignoring errors (fire-and-forget)
pub trait EventSender {
    fn send_event(&self, event: ExecutionEvent);
}

impl EventSender for ProgressSender {
    fn send_event(&self, event: ExecutionEvent) {
        let _ = self.send(event);
    }
}

impl EventSender for Option<ProgressSender> {
    fn send_event(&self, event: ExecutionEvent) {
        if let Some(sender) = self {
            let _ = sender.send(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_progress_channel() {
        let (tx, mut rx) = progress_channel();

        tx.send_event(ExecutionEvent::job_started("pytest[ubuntu-latest,3.10]", "Tests", 5));
        tx.send_event(ExecutionEvent::step_started("pytest[ubuntu-latest,3.10]", StepKind::Setup, 0));

        let first = rx.recv().await.unwrap();
        assert!(matches!(first, ExecutionEvent::JobStarted { total_steps: 5, .. }));

        let second = rx.recv().await.unwrap();
        assert!(matches!(
            second,
            ExecutionEvent::StepStarted { step: StepKind::Setup, step_index: 0, .. }
        ));
    }

    #[test]
    fn test_optional_sender() {
        let sender: Option<ProgressSender> = None;
        sender.send_event(ExecutionEvent::info("test", None));
    }
}
