// Run Reporter
// Renders a pipeline outcome as terminal text, JSON or JUnit XML

use crate::execution::executor::PipelineOutcome;
use crate::execution::job::{JobOutcome, JobStatus, StepOutcome, StepResult};

use std::fmt;

/// Output format for run reports
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportFormat {
    /// JUnit XML format (for CI systems)
    JUnit,
    /// The serialized outcome
    Json,
    /// Human-readable terminal output
    Terminal,
}

impl fmt::Display for ReportFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReportFormat::JUnit => write!(f, "junit"),
            ReportFormat::Json => write!(f, "json"),
            ReportFormat::Terminal => write!(f, "terminal"),
        }
    }
}

impl std::str::FromStr for ReportFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "junit" | "junit-xml" | "xml" => Ok(ReportFormat::JUnit),
            "json" => Ok(ReportFormat::Json),
            "terminal" | "text" | "console" => Ok(ReportFormat::Terminal),
            _ => Err(format!(
                "Unknown report format '{}'. Valid formats: junit, json, terminal",
                s
            )),
        }
    }
}

pub struct RunReporter;

impl RunReporter {
    /// Generate a report in the specified format
    pub fn report(outcome: &PipelineOutcome, format: ReportFormat) -> serde_json::Result<String> {
        match format {
            ReportFormat::JUnit => Ok(Self::to_junit_xml(outcome)),
            ReportFormat::Json => serde_json::to_string_pretty(outcome),
            ReportFormat::Terminal => Ok(Self::to_terminal(outcome)),
        }
    }

    /// One `<testsuite>` per job instance. Test steps contribute one
    /// `<testcase>` per case; every other step is a single testcase.
    pub fn to_junit_xml(outcome: &PipelineOutcome) -> String {
        let cases: Vec<Vec<JunitCase>> = outcome.jobs.iter().map(junit_cases).collect();
        let total: usize = cases.iter().map(Vec::len).sum();
        let failures: usize = cases.iter().flatten().filter(|c| c.failure.is_some()).count();

        let mut xml = String::new();
        xml.push_str("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");
        xml.push_str(&format!(
            "<testsuites name=\"{}\" tests=\"{}\" failures=\"{}\" errors=\"0\" time=\"{:.3}\">\n",
            xml_escape(&outcome.workflow),
            total,
            failures,
            outcome.duration().as_secs_f64()
        ));

        for (job, cases) in outcome.jobs.iter().zip(&cases) {
            let skipped = cases.iter().filter(|c| c.skipped).count();
            xml.push_str(&format!(
                "  <testsuite name=\"{}\" tests=\"{}\" failures=\"{}\" skipped=\"{}\" time=\"{:.3}\">\n",
                xml_escape(&job.spec.id()),
                cases.len(),
                cases.iter().filter(|c| c.failure.is_some()).count(),
                skipped,
                job.duration.as_secs_f64()
            ));

            for case in cases {
                xml.push_str(&format!(
                    "    <testcase classname=\"{}\" name=\"{}\" time=\"{:.3}\"",
                    xml_escape(&case.class),
                    xml_escape(&case.name),
                    case.seconds
                ));

                match (&case.failure, case.skipped) {
                    (Some(message), _) => {
                        xml.push_str(">\n");
                        xml.push_str(&format!("      <failure message=\"{}\">\n", xml_escape(message)));
                        if !case.output.is_empty() {
                            xml.push_str(&format!("        {}\n", xml_escape(&case.output)));
                        }
                        xml.push_str("      </failure>\n");
                        xml.push_str("    </testcase>\n");
                    }
                    (None, true) => xml.push_str(">\n      <skipped />\n    </testcase>\n"),
                    (None, false) => xml.push_str(" />\n"),
                }
            }

            xml.push_str("  </testsuite>\n");
        }

        xml.push_str("</testsuites>\n");
        xml
    }

    /// Generate human-readable terminal output
    pub fn to_terminal(outcome: &PipelineOutcome) -> String {
        let mut out = String::new();

        out.push_str(&format!(
            "\nWorkflow: {} ({} on {})\n",
            outcome.workflow, outcome.event.kind, outcome.event.git_ref
        ));
        out.push_str(&"=".repeat(60));
        out.push('\n');

        for job in &outcome.jobs {
            out.push_str(&format!(
                "  [{}] {} ({:.2}s)\n",
                job_symbol(job.status),
                job.spec.display_name,
                job.duration.as_secs_f64()
            ));

            for step in &job.steps {
                out.push_str(&format!("       {} {}", step_symbol(step.outcome), step.name));
                if let Some(message) = &step.message {
                    out.push_str(&format!(": {}", message));
                }
                out.push('\n');

                for case in step.cases.iter().filter(|c| !c.passed) {
                    out.push_str(&format!("           FAIL {}\n", case.case));
                }
            }

            if let Some(coverage) = job.coverage.as_ref().filter(|c| !c.is_empty()) {
                out.push_str(&format!(
                    "       coverage: {}/{} lines ({:.1}%)\n",
                    coverage.lines_hit(),
                    coverage.lines_found(),
                    coverage.line_rate() * 100.0
                ));
            }
        }

        if !outcome.drift.is_empty() {
            out.push_str(&"-".repeat(60));
            out.push('\n');
            out.push_str("  Unconstrained packages drifted across jobs:\n");
            for finding in &outcome.drift {
                let versions: Vec<String> = finding
                    .versions
                    .iter()
                    .map(|(version, jobs)| format!("{} ({})", version, jobs.len()))
                    .collect();
                out.push_str(&format!("    {}: {}\n", finding.package, versions.join(", ")));
            }
        }

        out.push_str(&"-".repeat(60));
        out.push('\n');

        let failed = outcome.failed_jobs().count();
        let status_line = if outcome.superseded {
            "  Run cancelled by a newer run of the same group".to_string()
        } else if failed == 0 {
            format!(
                "  All {} jobs passed ({:.2}s)",
                outcome.jobs.len(),
                outcome.duration().as_secs_f64()
            )
        } else {
            format!(
                "  {} of {} jobs failed ({:.2}s)",
                failed,
                outcome.jobs.len(),
                outcome.duration().as_secs_f64()
            )
        };
        out.push_str(&status_line);
        out.push_str("\n\n");
        out
    }
}

struct JunitCase {
    class: String,
    name: String,
    seconds: f64,
    failure: Option<String>,
    skipped: bool,
    output: String,
}

fn junit_cases(job: &JobOutcome) -> Vec<JunitCase> {
    let class = job.spec.id();
    let mut cases = Vec::new();

    for step in &job.steps {
        if step.cases.is_empty() {
            cases.push(step_case(&class, step));
            continue;
        }
        for case in &step.cases {
            cases.push(JunitCase {
                class: class.clone(),
                name: case.case.clone(),
                seconds: case.duration.as_secs_f64(),
                failure: (!case.passed).then(|| format!("{} failed", case.case)),
                skipped: false,
                output: case.output.clone(),
            });
        }
    }

    cases
}

fn step_case(class: &str, step: &StepResult) -> JunitCase {
    let message = step.message.clone().unwrap_or_default();
    JunitCase {
        class: class.to_string(),
        name: step.name.clone(),
        seconds: step.duration.as_secs_f64(),
        failure: step.is_failure().then(|| message),
        skipped: step.outcome == StepOutcome::Skipped,
        output: step
            .artifacts
            .iter()
            .map(|a| a.content.as_str())
            .collect::<Vec<_>>()
            .join("\n"),
    }
}

fn job_symbol(status: JobStatus) -> &'static str {
    match status {
        JobStatus::Succeeded => "+",
        JobStatus::Failed => "x",
        JobStatus::Cancelled => "-",
    }
}

fn step_symbol(outcome: StepOutcome) -> &'static str {
    match outcome {
        StepOutcome::Success => "ok  ",
        StepOutcome::Failure => "FAIL",
        StepOutcome::Skipped => "skip",
    }
}

/// Escape special XML characters
fn xml_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::executor::{DriftFinding, PipelineStatus};
    use crate::execution::job::{Artifact, StepKind};
    use crate::execution::matrix::MatrixExpander;
    use crate::execution::trigger::{EventKind, TriggerEvent};
    use crate::testing::partition::CaseResult;
    use crate::workflow::models::JobDefinition;

    use chrono::Utc;
    use std::collections::BTreeMap;
    use std::time::Duration;
    use uuid::Uuid;

    fn job(yaml: &str, status: JobStatus, steps: Vec<StepResult>) -> JobOutcome {
        let definition: JobDefinition = serde_yaml::from_str(yaml).unwrap();
        let spec = MatrixExpander::expand_job("pytest", &definition).unwrap().remove(0);
        let mut outcome = JobOutcome::lost(spec, "");
        outcome.coverage_errors.clear();
        outcome.status = status;
        outcome.steps = steps;
        outcome
    }

    fn outcome() -> PipelineOutcome {
        let mut tests = StepResult::failure(StepKind::ParallelTests, "1 passed, 1 failed (2 workers)", Duration::from_millis(40));
        tests.cases = vec![
            CaseResult {
                case: "tests/test_a.py".to_string(),
                passed: true,
                output: String::new(),
                duration: Duration::from_millis(10),
            },
            CaseResult {
                case: "tests/test_<b>.py".to_string(),
                passed: false,
                output: "assert 1 == 2".to_string(),
                duration: Duration::from_millis(30),
            },
        ];

        let failing = job(
            "strategy: { matrix: { python-version: ['3.10'] } }",
            JobStatus::Failed,
            vec![
                StepResult::success(StepKind::Setup, Duration::from_millis(5)),
                StepResult::skipped(StepKind::TypeCheck, "minimum-version variant"),
                tests,
            ],
        );
        let lint = job(
            "lint: { path: src }",
            JobStatus::Failed,
            vec![StepResult::failure(StepKind::Lint, "formatting changes required", Duration::ZERO)
                .with_artifact(Artifact::new("lint.diff", "-x=1\n+x = 1"))],
        );

        let now = Utc::now();
        PipelineOutcome {
            run_id: Uuid::new_v4(),
            workflow: "tests".to_string(),
            group: "tests-main".to_string(),
            event: TriggerEvent::new(EventKind::Push, "main", "abc"),
            started_at: now,
            finished_at: now,
            status: PipelineStatus::Failed,
            jobs: vec![failing, lint],
            drift: vec![DriftFinding {
                package: "six".to_string(),
                versions: BTreeMap::from([
                    ("1.16.0".to_string(), vec!["a".to_string()]),
                    ("1.17.0".to_string(), vec!["b".to_string()]),
                ]),
            }],
            superseded: false,
        }
    }

    #[test]
    fn test_junit_xml_output() {
        let xml = RunReporter::to_junit_xml(&outcome());

        assert!(xml.starts_with("<?xml version=\"1.0\""));
        assert!(xml.contains("<testsuites name=\"tests\" tests=\"5\" failures=\"2\""));
        assert!(xml.contains("<testsuite name=\"pytest[3.10]\" tests=\"4\" failures=\"1\" skipped=\"1\""));
        assert!(xml.contains("name=\"tests/test_&lt;b&gt;.py\""));
        assert!(xml.contains("assert 1 == 2"));
        assert!(xml.contains("<skipped />"));
        assert!(xml.contains("+x = 1"));
    }

    #[test]
    fn test_terminal_output() {
        let terminal = RunReporter::to_terminal(&outcome());

        assert!(terminal.contains("Workflow: tests (push on main)"));
        assert!(terminal.contains("[x] pytest (3.10)"));
        assert!(terminal.contains("skip type-check: minimum-version variant"));
        assert!(terminal.contains("FAIL tests/test_<b>.py"));
        assert!(terminal.contains("six: 1.16.0 (1), 1.17.0 (1)"));
        assert!(terminal.contains("2 of 2 jobs failed"));
    }

    #[test]
    fn test_json_output() {
        let json = RunReporter::report(&outcome(), ReportFormat::Json).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();

        assert_eq!(value["status"], "failed");
        assert_eq!(value["jobs"][0]["steps"][1]["outcome"], "skipped");
        assert_eq!(value["drift"][0]["package"], "six");
    }

    #[test]
    fn test_xml_escaping() {
        assert_eq!(xml_escape("<test>"), "&lt;test&gt;");
        assert_eq!(xml_escape("a & b"), "a &amp; b");
        assert_eq!(xml_escape("\"quoted\""), "&quot;quoted&quot;");
    }

    #[test]
    fn test_report_format_parsing() {
        assert_eq!("junit".parse::<ReportFormat>().unwrap(), ReportFormat::JUnit);
        assert_eq!("xml".parse::<ReportFormat>().unwrap(), ReportFormat::JUnit);
        assert_eq!("JSON".parse::<ReportFormat>().unwrap(), ReportFormat::Json);
        assert_eq!("text".parse::<ReportFormat>().unwrap(), ReportFormat::Terminal);
        assert!("tap".parse::<ReportFormat>().is_err());
    }
}
