pub mod models;
pub mod parser;

pub use models::{
    AnalysisSpec, CommandSpec, Concurrency, CronEntry, DependencySpec, EventConfig, EventSpec,
    JobDefinition, JobRole, Jobs, LintSpec, Matrix, PipelineDefinition, RuntimeSpec, Strategy,
    TestCaseDef, TestSpec, Trigger,
};
pub use parser::WorkflowParser;
