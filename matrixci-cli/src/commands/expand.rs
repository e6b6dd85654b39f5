use crate::commands::load_definition;
use crate::output;

use std::path::PathBuf;

use clap::Args;
use color_eyre::eyre::eyre;
use color_eyre::Result;

use pipeline_orchestrator::{JobSpec, MatrixExpander};

/// Print the job instances a pipeline's matrices expand to
#[derive(Args, Debug)]
pub struct ExpandArgs {
    /// Path to the pipeline YAML file
    pub pipeline: PathBuf,

    /// Only expand this job
    #[arg(long, short = 'j', value_name = "JOB")]
    pub job: Option<String>,

    /// Print JSON instead of a table
    #[arg(long)]
    pub json: bool,
}

pub fn execute(args: ExpandArgs) -> Result<()> {
    let definition = load_definition(&args.pipeline)?;

    if let Some(job) = &args.job {
        if !definition.jobs.contains_key(job) {
            return Err(eyre!("Job '{}' not found in {}", job, args.pipeline.display()));
        }
    }

    let mut specs: Vec<JobSpec> = Vec::new();
    for (job_id, job) in &definition.jobs {
        if args.job.as_deref().is_some_and(|wanted| wanted != job_id) {
            continue;
        }
        specs.extend(MatrixExpander::expand_job(job_id, job)?);
    }

    if args.json {
        let entries: Vec<serde_json::Value> = specs
            .iter()
            .map(|spec| {
                serde_json::json!({
                    "id": spec.id(),
                    "slug": spec.slug(),
                    "minimum_version": spec.is_minimum_version(),
                    "spec": spec,
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }

    let mut current: Option<&str> = None;
    for spec in &specs {
        if current != Some(spec.job.as_str()) {
            output::section(&spec.job);
            current = Some(spec.job.as_str());
        }
        println!("{}", output::instance_row(spec));
    }

    output::note(&format!("{} job instances", specs.len()));
    Ok(())
}
