use crate::execution::matrix::MatrixExpander;
use crate::workflow::models::{JobDefinition, PipelineDefinition};
use crate::{OrchestratorError, OrchestratorResult};

use std::fs;
use std::path::Path;

/// Parser for pipeline definition YAML files.
pub struct WorkflowParser;

impl WorkflowParser {
    /// Parse a pipeline definition from a file path.
    pub fn from_file<P: AsRef<Path>>(path: P) -> OrchestratorResult<PipelineDefinition> {
        let content = fs::read_to_string(path)?;
        Self::parse_and_validate(&content)
    }

    /// Parse a pipeline definition from a YAML string.
    pub fn parse(content: &str) -> OrchestratorResult<PipelineDefinition> {
        let definition: PipelineDefinition = serde_yaml::from_str(content)?;
        Ok(definition)
    }

    /// Parse and validate a pipeline definition from a YAML string.
    pub fn parse_and_validate(content: &str) -> OrchestratorResult<PipelineDefinition> {
        let definition = Self::parse(content)?;
        Self::validate(&definition)?;
        Ok(definition)
    }

    /// Validate a parsed definition for semantic correctness.
    pub fn validate(definition: &PipelineDefinition) -> OrchestratorResult<()> {
        if definition.jobs.is_empty() {
            return Err(OrchestratorError::InvalidDefinition(
                "pipeline declares no jobs".to_string(),
            ));
        }

        for (job_id, job) in &definition.jobs {
            if job.role().is_none() {
                return Err(OrchestratorError::InvalidDefinition(format!(
                    "Job '{}' mixes test, lint and static-analysis sections",
                    job_id
                )));
            }

            Self::validate_matrix(job_id, job)?;
            Self::validate_runtime(job_id, job)?;

            if let Some(tests) = &job.tests {
                if tests.workers == Some(0) {
                    return Err(OrchestratorError::InvalidDefinition(format!(
                        "Job '{}' requests zero test workers",
                        job_id
                    )));
                }
            }
        }

        Ok(())
    }

    fn validate_matrix(job_id: &str, job: &JobDefinition) -> OrchestratorResult<()> {
        if let Some(matrix) = job.matrix() {
            MatrixExpander::plan(matrix).map_err(|source| OrchestratorError::Matrix {
                job: job_id.to_string(),
                source,
            })?;
        }

        if MatrixExpander::max_parallel(job) == Some(0) {
            return Err(OrchestratorError::InvalidDefinition(format!(
                "Job '{}' sets max-parallel to zero",
                job_id
            )));
        }

        Ok(())
    }

    fn validate_runtime(job_id: &str, job: &JobDefinition) -> OrchestratorResult<()> {
        let Some(runtime) = &job.runtime else {
            return Ok(());
        };

        let declared = job
            .matrix()
            .map_or(false, |m| m.axes.iter().any(|(name, _)| *name == runtime.axis));

        if !declared {
            return Err(OrchestratorError::InvalidDefinition(format!(
                "Job '{}' takes its runtime version from undeclared axis '{}'",
                job_id, runtime.axis
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minimal_definition() {
        let yaml = r#"
on: push
jobs:
  lint:
    lint:
      path: src
"#;
        let definition = WorkflowParser::parse_and_validate(yaml).unwrap();
        assert!(definition.name.is_none());
        assert!(definition.jobs.contains_key("lint"));
    }

    #[test]
    fn test_parse_full_test_job() {
        let yaml = r#"
name: CI
on: [push, pull_request]
concurrency:
  group: ${{ workflow }}-${{ ref }}
  cancel-in-progress: true
jobs:
  pytest:
    runs-on: ${{ matrix.os }}
    timeout-minutes: 30
    strategy:
      matrix:
        os: [ubuntu-latest, windows-latest]
        python-version: ["3.10", "3.11"]
    runtime:
      axis: python-version
      setup: python -m venv ${{ env.path }}
    dependencies:
      constraints: ["numpy>=1.21", "h5py>=3.0"]
      lock-file: requirements.lock
      install: pip install -r ${{ deps.requirements }}
    type-check:
      run: mypy src
    tests:
      cases: [tests/test_a.py, { id: tests/test_b.py, serial: true }]
      serial: ["tests/serial/**"]
      run: pytest ${{ test.case }} --cov-report=json:${{ test.coverage }}
      workers: 4
"#;
        let definition = WorkflowParser::parse_and_validate(yaml).unwrap();
        let job = definition.jobs.get("pytest").unwrap();

        assert_eq!(definition.name.as_deref(), Some("CI"));
        assert_eq!(job.timeout_minutes, Some(30));
        assert_eq!(job.dependencies.as_ref().unwrap().constraints.len(), 2);
        assert_eq!(job.tests.as_ref().unwrap().workers, Some(4));
    }

    #[test]
    fn test_jobs_keep_declaration_order() {
        let yaml = r#"
on: push
jobs:
  pytest:
    tests: { cases: [a] }
  lint:
    lint: { path: src }
  codeql:
    static-analysis: { language: python }
"#;
        let definition = WorkflowParser::parse_and_validate(yaml).unwrap();
        let ids: Vec<&str> = definition.jobs.ids().collect();
        assert_eq!(ids, vec!["pytest", "lint", "codeql"]);
    }

    #[test]
    fn test_reject_empty_jobs() {
        let result = WorkflowParser::parse_and_validate("on: push\njobs: {}\n");
        assert!(matches!(result, Err(OrchestratorError::InvalidDefinition(_))));
    }

    #[test]
    fn test_reject_mixed_roles() {
        let yaml = r#"
on: push
jobs:
  odd:
    lint: { path: src }
    static-analysis: { language: python }
"#;
        let err = WorkflowParser::parse_and_validate(yaml).unwrap_err();
        assert!(err.to_string().contains("odd"));
    }

    #[test]
    fn test_reject_undeclared_runtime_axis() {
        let yaml = r#"
on: push
jobs:
  pytest:
    strategy:
      matrix:
        os: [ubuntu-latest]
    runtime: { axis: python-version }
"#;
        let err = WorkflowParser::parse_and_validate(yaml).unwrap_err();
        assert!(err.to_string().contains("python-version"));
    }

    #[test]
    fn test_reject_invalid_matrix_rule() {
        let yaml = r#"
on: push
jobs:
  pytest:
    strategy:
      matrix:
        os: [ubuntu-latest]
        python-version: ["3.10"]
        include:
          - { os: macos-latest }
"#;
        let err = WorkflowParser::parse_and_validate(yaml).unwrap_err();
        assert!(matches!(err, OrchestratorError::Matrix { ref job, .. } if job == "pytest"));
    }

    #[test]
    fn test_reject_bad_constraint() {
        let yaml = r#"
on: push
jobs:
  pytest:
    dependencies:
      constraints: ["numpy~=1.2"]
"#;
        assert!(matches!(
            WorkflowParser::parse(yaml),
            Err(OrchestratorError::Yaml(_))
        ));
    }
}
