pub mod expand;
pub mod resolve;
pub mod run;
pub mod validate;

use color_eyre::Result;
use pipeline_orchestrator::{PipelineDefinition, WorkflowParser};
use std::path::Path;

/// Parse and validate a definition, naming the file in the error.
pub fn load_definition(path: &Path) -> Result<PipelineDefinition> {
    if !path.exists() {
        color_eyre::eyre::bail!("Pipeline file not found: {}", path.display());
    }
    WorkflowParser::from_file(path)
        .map_err(|e| color_eyre::eyre::eyre!("{}: {}", path.display(), e))
}

/// Workflow identity: the definition's name, else the file stem.
pub fn workflow_name(definition: &PipelineDefinition, path: &Path) -> String {
    definition.name.clone().unwrap_or_else(|| {
        path.file_stem()
            .and_then(|n| n.to_str())
            .unwrap_or("workflow")
            .to_string()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_workflow_name_falls_back_to_file_stem() {
        let named = WorkflowParser::parse("name: tests\non: push\njobs:\n  lint:\n    lint: {}\n").unwrap();
        assert_eq!(workflow_name(&named, Path::new("ci/pipeline.yml")), "tests");

        let unnamed = WorkflowParser::parse("on: push\njobs:\n  lint:\n    lint: {}\n").unwrap();
        assert_eq!(workflow_name(&unnamed, Path::new("ci/nightly.yml")), "nightly");
    }

    #[test]
    fn test_missing_pipeline_file_is_reported() {
        let err = load_definition(Path::new("/nonexistent/pipeline.yml")).unwrap_err();
        assert!(err.to_string().contains("Pipeline file not found"));
    }
}
