// Runtime Context
// Per-job context and `${{ name }}` placeholder substitution

use crate::execution::matrix::JobSpec;
use crate::execution::trigger::TriggerEvent;
use crate::workflow::models::JobDefinition;

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Named values available to command templates.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TemplateVars {
    values: BTreeMap<String, String>,
}

impl TemplateVars {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.values.insert(name.into(), value.into());
        self
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.set(name, value);
        self
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(String::as_str)
    }

    /// Replace every `${{ name }}` with its value. Unknown names are left in
    /// place so the failing command shows what was missing.
    pub fn render(&self, template: &str) -> String {
        let mut out = String::with_capacity(template.len());
        let mut rest = template;

        while let Some(start) = rest.find("${{") {
            out.push_str(&rest[..start]);
            let after = &rest[start + 3..];

            match after.find("}}") {
                Some(end) => {
                    let name = after[..end].trim();
                    match self.values.get(name) {
                        Some(value) => out.push_str(value),
                        None => {
                            tracing::debug!(placeholder = name, "unknown template placeholder");
                            out.push_str(&rest[start..start + 3 + end + 2]);
                        }
                    }
                    rest = &after[end + 2..];
                }
                None => {
                    out.push_str(&rest[start..]);
                    rest = "";
                }
            }
        }

        out.push_str(rest);
        out
    }
}

/// Everything a collaborator needs to act on one job instance.
#[derive(Debug, Clone)]
pub struct JobContext {
    /// Workflow identity (definition name or file stem)
    pub workflow: String,
    pub event: TriggerEvent,
    pub spec: JobSpec,
    pub definition: Arc<JobDefinition>,
    /// Repository root commands run from
    pub work_dir: PathBuf,
    /// Private directory for this instance's files
    pub job_dir: PathBuf,
    /// Pipeline env overlaid with job env
    pub env: HashMap<String, String>,
    /// Worker count for the parallel-safe partition when the job sets none
    pub default_workers: usize,
    /// Per-step timeout
    pub timeout: Option<Duration>,
    pub cancel: CancellationToken,
}

impl JobContext {
    /// Runtime version taken from the job's runtime axis.
    pub fn runtime_version(&self) -> Option<&str> {
        let axis = &self.definition.runtime.as_ref()?.axis;
        self.spec.assignment.get(axis)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Template values shared by every step of this job.
    pub fn vars(&self) -> TemplateVars {
        let mut vars = TemplateVars::new();
        vars.set("workflow", self.workflow.as_str())
            .set("ref", self.event.git_ref.as_str())
            .set("event", self.event.kind.to_string())
            .set("commit", self.event.commit.as_str())
            .set("job.id", self.spec.id())
            .set("job.dir", self.job_dir.display().to_string());

        for (axis, value) in self.spec.assignment.iter() {
            vars.set(format!("matrix.{}", axis), value);
        }
        if let Some(version) = self.runtime_version() {
            vars.set("runtime.version", version);
        }

        vars
    }
}
