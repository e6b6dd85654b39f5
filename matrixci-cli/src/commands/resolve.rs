use crate::commands::load_definition;
use crate::output;

use std::path::PathBuf;

use clap::Args;
use color_eyre::eyre::eyre;
use color_eyre::Result;

use pipeline_orchestrator::execution::resolve_dependencies;
use pipeline_orchestrator::utils::resolve_working_dir;

/// Print the dependency set a job would install
#[derive(Args, Debug)]
pub struct ResolveArgs {
    /// Path to the pipeline YAML file
    pub pipeline: PathBuf,

    /// Job whose dependencies are resolved
    #[arg(long, short = 'j', value_name = "JOB")]
    pub job: String,

    /// Resolve to the lowest versions the constraints allow
    #[arg(long)]
    pub minimum: bool,

    /// Directory lock and index files are relative to (default: enclosing git repository)
    #[arg(long, short = 'w', value_name = "DIR")]
    pub working_dir: Option<PathBuf>,

    /// Print JSON instead of a requirements file
    #[arg(long)]
    pub json: bool,
}

pub fn execute(args: ResolveArgs) -> Result<()> {
    let definition = load_definition(&args.pipeline)?;

    let job = definition
        .jobs
        .get(&args.job)
        .ok_or_else(|| eyre!("Job '{}' not found in {}", args.job, args.pipeline.display()))?;
    let deps = job
        .dependencies
        .as_ref()
        .ok_or_else(|| eyre!("Job '{}' declares no dependencies", args.job))?;

    let root = match &args.working_dir {
        Some(dir) => dir.clone(),
        None => resolve_working_dir(),
    };

    let resolved = resolve_dependencies(deps, &root, args.minimum, None)?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&resolved)?);
        return Ok(());
    }

    print!("{}", resolved.to_requirements());

    let unconstrained: Vec<&str> = resolved.unconstrained().map(String::as_str).collect();
    if !unconstrained.is_empty() {
        output::warning(&format!(
            "Left to the installer: {}",
            unconstrained.join(", ")
        ));
    }

    Ok(())
}
