use crate::commands::{load_definition, workflow_name};
use crate::output;

use std::path::PathBuf;

use clap::Args;
use color_eyre::Result;

use pipeline_orchestrator::workflow::JobRole;
use pipeline_orchestrator::MatrixExpander;

/// Validate a pipeline YAML file
#[derive(Args, Debug)]
pub struct ValidateArgs {
    /// Path to the pipeline YAML file
    pub pipeline: PathBuf,
}

pub fn execute(args: ValidateArgs) -> Result<()> {
    output::action("Validating", &args.pipeline.display().to_string());

    let definition = match load_definition(&args.pipeline) {
        Ok(definition) => definition,
        Err(e) => {
            output::error(&e.to_string());
            std::process::exit(1);
        }
    };

    output::check("YAML syntax valid");
    output::check("Job roles and matrices valid");

    let mut total = 0;
    for (job_id, job) in &definition.jobs {
        let specs = MatrixExpander::expand_job(job_id, job)?;
        total += specs.len();

        let role = match job.role() {
            Some(JobRole::Test) => "test",
            Some(JobRole::Lint) => "lint",
            Some(JobRole::StaticAnalysis) => "static-analysis",
            None => "invalid",
        };
        output::job_summary(job_id, role, specs.len());
    }

    output::check(&format!(
        "Workflow '{}' is valid ({} jobs, {} instances)",
        workflow_name(&definition, &args.pipeline),
        definition.jobs.len(),
        total
    ));

    Ok(())
}
