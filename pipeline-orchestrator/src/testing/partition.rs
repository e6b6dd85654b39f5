// Test Partitions
// Case catalog, serial marking and bounded fan-out of test cases

use crate::coverage::CoverageFragment;
use crate::execution::context::JobContext;
use crate::runners::{Environment, TestExecutor, TestInvocation};
use crate::utils::any_pattern_matches;
use crate::workflow::models::TestSpec;

use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

/// Which half of a suite a case belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum PartitionKind {
    /// Cases that tolerate running alongside each other
    ParallelSafe,
    /// Cases that must run one at a time
    SerialOnly,
}

impl fmt::Display for PartitionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PartitionKind::ParallelSafe => write!(f, "parallel-safe"),
            PartitionKind::SerialOnly => write!(f, "serial-only"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestCase {
    pub id: String,
    pub serial: bool,
}

/// Every case of a suite, in declaration then discovery order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TestCatalog {
    cases: Vec<TestCase>,
}

impl TestCatalog {
    /// Combine declared and discovered cases. Duplicates keep their first
    /// position; a case is serial when it is declared serial or matches
    /// one of the suite's serial patterns.
    pub fn build(spec: &TestSpec, discovered: Vec<String>) -> Self {
        let mut seen = HashSet::new();
        let mut cases = Vec::new();

        let declared = spec.cases.iter().map(|c| (c.id().to_string(), c.is_serial()));
        let found = discovered.into_iter().map(|id| (id, false));

        for (id, marked) in declared.chain(found) {
            let id = id.trim().to_string();
            if id.is_empty() || !seen.insert(id.clone()) {
                continue;
            }
            let serial = marked || any_pattern_matches(&spec.serial, &id);
            cases.push(TestCase { id, serial });
        }

        Self { cases }
    }

    pub fn cases(&self) -> &[TestCase] {
        &self.cases
    }

    pub fn partition(&self, kind: PartitionKind) -> Vec<TestCase> {
        let serial = kind == PartitionKind::SerialOnly;
        self.cases.iter().filter(|c| c.serial == serial).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.cases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cases.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CaseResult {
    pub case: String,
    pub passed: bool,
    pub output: String,
    #[serde(with = "duration_ms")]
    pub duration: Duration,
}

#[derive(Debug, Clone)]
pub struct PartitionResult {
    pub kind: PartitionKind,
    pub workers: usize,
    /// In catalog order
    pub cases: Vec<CaseResult>,
    pub fragments: Vec<CoverageFragment>,
}

impl PartitionResult {
    pub fn passed(&self) -> bool {
        self.cases.iter().all(|c| c.passed)
    }

    pub fn failed(&self) -> usize {
        self.cases.iter().filter(|c| !c.passed).count()
    }
}

/// Runs one partition's cases with at most `workers` in flight.
pub struct PartitionRunner {
    executor: Arc<dyn TestExecutor>,
}

impl PartitionRunner {
    pub fn new(executor: Arc<dyn TestExecutor>) -> Self {
        Self { executor }
    }

    /// Run every case and join them all before returning. The serial
    /// partition always uses a single worker.
    pub async fn run(
        &self,
        ctx: Arc<JobContext>,
        env: Arc<Environment>,
        kind: PartitionKind,
        cases: Vec<TestCase>,
        workers: usize,
    ) -> PartitionResult {
        let workers = match kind {
            PartitionKind::SerialOnly => 1,
            PartitionKind::ParallelSafe => workers.max(1),
        };

        tracing::debug!(job = %ctx.spec.id(), partition = %kind, cases = cases.len(), workers, "running partition");

        let permits = Arc::new(Semaphore::new(workers));
        let coverage_dir = ctx.job_dir.join("coverage");
        let mut set = JoinSet::new();

        for (index, case) in cases.iter().enumerate() {
            let permits = permits.clone();
            let executor = self.executor.clone();
            let ctx = ctx.clone();
            let env = env.clone();
            let invocation = TestInvocation {
                case: case.id.clone(),
                partition: kind,
                coverage_path: coverage_dir.join(format!("{}-{:04}.json", kind, index)),
                workers,
            };

            set.spawn(async move {
                let _permit = permits.acquire_owned().await.ok();
                let result = executor.run_case(&ctx, &env, &invocation).await;
                (index, invocation.case, result)
            });
        }

        let mut finished = BTreeMap::new();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((index, case, result)) => {
                    finished.insert(index, (case, result));
                }
                Err(e) => tracing::error!(error = %e, "test case task failed"),
            }
        }

        let mut results = Vec::with_capacity(cases.len());
        let mut fragments = Vec::new();

        for (index, case) in cases.into_iter().enumerate() {
            match finished.remove(&index) {
                Some((_, Ok(outcome))) => {
                    // Failing cases still contribute coverage
                    if let Some(payload) = outcome.coverage {
                        fragments.push(CoverageFragment::new(ctx.spec.id(), kind, payload));
                    }
                    results.push(CaseResult {
                        case: case.id,
                        passed: outcome.passed,
                        output: outcome.output,
                        duration: outcome.duration,
                    });
                }
                Some((_, Err(e))) => results.push(CaseResult {
                    case: case.id,
                    passed: false,
                    output: e.to_string(),
                    duration: Duration::ZERO,
                }),
                None => results.push(CaseResult {
                    case: case.id,
                    passed: false,
                    output: "test case task did not complete".to_string(),
                    duration: Duration::ZERO,
                }),
            }
        }

        PartitionResult {
            kind,
            workers,
            cases: results,
            fragments,
        }
    }
}

pub(crate) mod duration_ms {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_millis() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::matrix::MatrixExpander;
    use crate::execution::trigger::{EventKind, TriggerEvent};
    use crate::runners::fakes::FakeCollaborators;
    use crate::workflow::models::{JobDefinition, TestCaseDef};

    use std::collections::HashMap;
    use tokio_util::sync::CancellationToken;

    const COVERAGE: &str = r#"{"files": {"src/app.py": {"lines": {"1": 1}}}}"#;

    fn context(dir: &std::path::Path) -> Arc<JobContext> {
        let definition: JobDefinition = serde_yaml::from_str("tests: { cases: [] }").unwrap();
        let spec = MatrixExpander::expand_job("pytest", &definition).unwrap().remove(0);
        Arc::new(JobContext {
            workflow: "tests".to_string(),
            event: TriggerEvent::new(EventKind::Push, "refs/heads/main", "abc"),
            job_dir: dir.join(spec.slug()),
            spec,
            definition: Arc::new(definition),
            work_dir: dir.to_path_buf(),
            env: HashMap::new(),
            default_workers: 1,
            timeout: None,
            cancel: CancellationToken::new(),
        })
    }

    fn cases(ids: &[&str]) -> Vec<TestCase> {
        ids.iter()
            .map(|id| TestCase {
                id: id.to_string(),
                serial: false,
            })
            .collect()
    }

    async fn run_partition(
        fakes: &FakeCollaborators,
        kind: PartitionKind,
        ids: &[&str],
        workers: usize,
    ) -> PartitionResult {
        let dir = tempfile::tempdir().unwrap();
        PartitionRunner::new(Arc::new(fakes.clone()))
            .run(context(dir.path()), Arc::new(Environment::default()), kind, cases(ids), workers)
            .await
    }

    fn spec(cases: Vec<TestCaseDef>, serial: &[&str]) -> TestSpec {
        TestSpec {
            cases,
            serial: serial.iter().map(|s| s.to_string()).collect(),
            ..TestSpec::default()
        }
    }

    #[test]
    fn test_catalog_marks_serial_cases() {
        let spec = spec(
            vec![
                TestCaseDef::Id("tests/test_a.py".to_string()),
                TestCaseDef::Detailed {
                    id: "tests/test_b.py".to_string(),
                    serial: true,
                },
            ],
            &["tests/serial/**"],
        );

        let catalog = TestCatalog::build(
            &spec,
            vec![
                "tests/serial/test_visa.py".to_string(),
                "tests/test_a.py".to_string(),
                "tests/test_c.py".to_string(),
            ],
        );

        let ids: Vec<_> = catalog.cases().iter().map(|c| c.id.as_str()).collect();
        assert_eq!(
            ids,
            vec![
                "tests/test_a.py",
                "tests/test_b.py",
                "tests/serial/test_visa.py",
                "tests/test_c.py"
            ]
        );

        let serial: Vec<_> = catalog
            .partition(PartitionKind::SerialOnly)
            .into_iter()
            .map(|c| c.id)
            .collect();
        assert_eq!(serial, vec!["tests/test_b.py", "tests/serial/test_visa.py"]);
        assert_eq!(catalog.partition(PartitionKind::ParallelSafe).len(), 2);
    }

    #[tokio::test]
    async fn test_results_follow_catalog_order() {
        let fakes = FakeCollaborators::new()
            .with_delay_for("slow", Duration::from_millis(120))
            .with_delay_for("medium", Duration::from_millis(60));

        let result = run_partition(&fakes, PartitionKind::ParallelSafe, &["slow", "medium", "fast"], 3).await;

        let finished: Vec<String> = fakes
            .calls()
            .into_iter()
            .filter_map(|c| c.strip_prefix("done:pytest:").map(String::from))
            .collect();
        assert_eq!(finished, vec!["fast", "medium", "slow"]);

        let ids: Vec<&str> = result.cases.iter().map(|c| c.case.as_str()).collect();
        assert_eq!(ids, vec!["slow", "medium", "fast"]);
        assert!(result.passed());
    }

    #[tokio::test]
    async fn test_runner_error_becomes_failed_case() {
        let fakes = FakeCollaborators::new().error_case("b");

        let result = run_partition(&fakes, PartitionKind::ParallelSafe, &["a", "b"], 2).await;

        assert!(!result.passed());
        assert_eq!(result.failed(), 1);
        let failed = &result.cases[1];
        assert_eq!(failed.case, "b");
        assert!(!failed.passed);
        assert!(failed.output.contains("cannot run b"));
        assert_eq!(failed.duration, Duration::ZERO);
    }

    #[tokio::test]
    async fn test_failing_cases_still_emit_coverage() {
        let fakes = FakeCollaborators::new()
            .fail_case("b")
            .with_default_coverage(COVERAGE);

        let result = run_partition(&fakes, PartitionKind::ParallelSafe, &["a", "b"], 2).await;

        assert_eq!(result.failed(), 1);
        assert_eq!(result.fragments.len(), 2);
        assert!(result
            .fragments
            .iter()
            .all(|f| f.job == "pytest" && f.partition == PartitionKind::ParallelSafe));
    }

    #[tokio::test]
    async fn test_zero_workers_runs_one_at_a_time() {
        let fakes = FakeCollaborators::new().with_case_delay(Duration::from_millis(20));

        let result = run_partition(&fakes, PartitionKind::ParallelSafe, &["a", "b", "c"], 0).await;

        assert_eq!(result.workers, 1);
        assert_eq!(result.cases.len(), 3);
        assert_eq!(fakes.peak_concurrency("pytest", PartitionKind::ParallelSafe), 1);
    }

    #[tokio::test]
    async fn test_serial_partition_ignores_worker_count() {
        let fakes = FakeCollaborators::new().with_case_delay(Duration::from_millis(20));

        let result = run_partition(&fakes, PartitionKind::SerialOnly, &["a", "b", "c"], 8).await;

        assert_eq!(result.workers, 1);
        assert_eq!(fakes.peak_concurrency("pytest", PartitionKind::SerialOnly), 1);
    }

    #[test]
    fn test_empty_catalog() {
        let catalog = TestCatalog::build(&TestSpec::default(), vec!["  ".to_string()]);
        assert!(catalog.is_empty());
        assert!(catalog.partition(PartitionKind::ParallelSafe).is_empty());
    }
}
