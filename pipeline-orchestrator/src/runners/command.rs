// Command Collaborators
// Shell-backed collaborators driven by command templates in the definition

use crate::error::{InstallError, SetupError};
use crate::execution::context::{JobContext, TemplateVars};
use crate::resolver::{LockSet, ResolvedDependencySet};
use crate::runners::shell::{ShellOutput, ShellRunner};
use crate::runners::{
    CaseOutcome, CollaboratorError, Environment, EnvironmentProvisioner, InstallReport, LintTool,
    PackageInstaller, StaticAnalyzer, TestExecutor, TestInvocation, ToolOutput, TypeChecker,
};

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::Path;
use std::time::Instant;

/// Runs each tool as a rendered shell command from the repository root.
#[derive(Debug, Clone, Default)]
pub struct CommandCollaborator {
    shell: ShellRunner,
}

impl CommandCollaborator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_shell(shell: ShellRunner) -> Self {
        Self { shell }
    }

    async fn run(
        &self,
        ctx: &JobContext,
        template: &str,
        vars: &TemplateVars,
        extra_env: &HashMap<String, String>,
    ) -> ShellOutput {
        let command = vars.render(template);
        let mut env = ctx.env.clone();
        env.extend(extra_env.iter().map(|(k, v)| (k.clone(), v.clone())));
        self.shell.run(&command, &env, &ctx.work_dir, ctx.timeout).await
    }
}

fn env_vars(ctx: &JobContext, env: &Environment) -> TemplateVars {
    ctx.vars().with("env.path", env.path.display().to_string())
}

fn missing(tool: &str, key: &str) -> CollaboratorError {
    CollaboratorError::new(tool, format!("no `{}` command configured", key))
}

#[async_trait]
impl EnvironmentProvisioner for CommandCollaborator {
    async fn provision(&self, ctx: &JobContext) -> Result<Environment, SetupError> {
        let path = ctx.job_dir.join("env");
        tokio::fs::create_dir_all(&path)
            .await
            .map_err(|e| SetupError::new(format!("cannot create {}: {}", path.display(), e)))?;

        let mut env = Environment {
            path,
            runtime_version: ctx.runtime_version().map(String::from),
            env: HashMap::new(),
        };
        env.env
            .insert("MATRIXCI_ENV_PATH".to_string(), env.path.display().to_string());

        if let Some(setup) = ctx.definition.runtime.as_ref().and_then(|r| r.setup.as_deref()) {
            let output = self.run(ctx, setup, &env_vars(ctx, &env), &env.env).await;
            if !output.success() {
                return Err(SetupError::new(output.diagnostics().trim().to_string()));
            }
        }

        Ok(env)
    }
}

#[async_trait]
impl PackageInstaller for CommandCollaborator {
    async fn install(
        &self,
        ctx: &JobContext,
        env: &Environment,
        resolved: &ResolvedDependencySet,
        requirements: &Path,
    ) -> Result<InstallReport, InstallError> {
        let Some(deps) = ctx.definition.dependencies.as_ref() else {
            return Ok(InstallReport::default());
        };

        let vars = env_vars(ctx, env).with("deps.requirements", requirements.display().to_string());
        let mut report = InstallReport::default();

        if let Some(install) = deps.install.as_deref() {
            let output = self.run(ctx, install, &vars, &env.env).await;
            if !output.success() {
                return Err(InstallError {
                    diagnostics: output.diagnostics().trim().to_string(),
                });
            }
            report.log = output.stdout;
        } else {
            tracing::warn!(job = %ctx.spec.id(), packages = resolved.len(), "no install command configured");
        }

        if let Some(freeze) = deps.freeze.as_deref() {
            let output = self.run(ctx, freeze, &vars, &env.env).await;
            match LockSet::parse(&output.stdout) {
                Ok(lock) if output.success() => {
                    report.installed = lock.iter().map(|(n, v)| (n.clone(), v.clone())).collect();
                }
                Ok(_) => tracing::warn!(job = %ctx.spec.id(), "freeze command failed"),
                Err(e) => tracing::warn!(job = %ctx.spec.id(), error = %e, "cannot parse freeze output"),
            }
        }

        Ok(report)
    }
}

#[async_trait]
impl TypeChecker for CommandCollaborator {
    async fn check(&self, ctx: &JobContext, env: &Environment) -> Result<ToolOutput, CollaboratorError> {
        let spec = ctx
            .definition
            .type_check
            .as_ref()
            .ok_or_else(|| missing("type-check", "type-check.run"))?;
        let output = self.run(ctx, &spec.run, &env_vars(ctx, env), &env.env).await;

        if output.exit_code.is_none() && !output.timed_out {
            return Err(CollaboratorError::new("type-check", output.stderr));
        }

        Ok(ToolOutput {
            success: output.success(),
            output: format!("{}\n{}", output.stdout, output.stderr).trim().to_string(),
        })
    }
}

#[async_trait]
impl TestExecutor for CommandCollaborator {
    async fn discover(&self, ctx: &JobContext, env: &Environment) -> Result<Vec<String>, CollaboratorError> {
        let Some(discover) = ctx.definition.tests.as_ref().and_then(|t| t.discover.as_deref()) else {
            return Ok(Vec::new());
        };

        let output = self.run(ctx, discover, &env_vars(ctx, env), &env.env).await;
        if !output.success() {
            return Err(CollaboratorError::new("discover", output.diagnostics().trim()));
        }

        Ok(output
            .stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(String::from)
            .collect())
    }

    async fn run_case(
        &self,
        ctx: &JobContext,
        env: &Environment,
        invocation: &TestInvocation,
    ) -> Result<CaseOutcome, CollaboratorError> {
        let run = ctx
            .definition
            .tests
            .as_ref()
            .and_then(|t| t.run.as_deref())
            .ok_or_else(|| missing("tests", "tests.run"))?;

        if let Some(parent) = invocation.coverage_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| CollaboratorError::new("tests", e.to_string()))?;
        }

        let vars = env_vars(ctx, env)
            .with("test.case", invocation.case.as_str())
            .with("test.coverage", invocation.coverage_path.display().to_string())
            .with("test.workers", invocation.workers.to_string())
            .with("test.partition", invocation.partition.to_string());

        let started = Instant::now();
        let output = self.run(ctx, run, &vars, &env.env).await;

        let coverage = tokio::fs::read_to_string(&invocation.coverage_path).await.ok();

        Ok(CaseOutcome {
            passed: output.success(),
            output: format!("{}\n{}", output.stdout, output.stderr).trim().to_string(),
            coverage,
            duration: started.elapsed(),
        })
    }
}

#[async_trait]
impl LintTool for CommandCollaborator {
    async fn diff(&self, ctx: &JobContext, path: &str, base: &str) -> Result<String, CollaboratorError> {
        let run = ctx
            .definition
            .lint
            .as_ref()
            .and_then(|l| l.run.as_deref())
            .ok_or_else(|| missing("lint", "lint.run"))?;

        let vars = ctx.vars().with("lint.path", path).with("lint.base", base);
        let output = self.run(ctx, run, &vars, &HashMap::new()).await;

        // Formatters exit non-zero when a diff exists. A non-zero exit without a
        // diff, or a shell status (126 not executable, 127 not found), is a tool failure.
        match output.exit_code {
            Some(0) => Ok(output.stdout),
            Some(code) if code < 126 && !output.stdout.trim().is_empty() => Ok(output.stdout),
            _ => Err(CollaboratorError::new("lint", output.diagnostics().trim())),
        }
    }
}

#[async_trait]
impl StaticAnalyzer for CommandCollaborator {
    async fn analyze(
        &self,
        ctx: &JobContext,
        path: &str,
        language: &str,
    ) -> Result<Vec<String>, CollaboratorError> {
        let run = ctx
            .definition
            .static_analysis
            .as_ref()
            .and_then(|a| a.run.as_deref())
            .ok_or_else(|| missing("static-analysis", "static-analysis.run"))?;

        let vars = ctx
            .vars()
            .with("analysis.path", path)
            .with("analysis.language", language);
        let output = self.run(ctx, run, &vars, &HashMap::new()).await;

        if !output.success() {
            return Err(CollaboratorError::new("static-analysis", output.diagnostics().trim()));
        }

        Ok(output
            .stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(String::from)
            .collect())
    }
}
