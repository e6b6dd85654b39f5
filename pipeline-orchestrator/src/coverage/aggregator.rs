// Coverage Aggregator
// Merges partition fragments and forwards the result to the reporting collaborator

use crate::coverage::fragment::{CoverageError, CoverageFragment};
use crate::coverage::report::CoverageReport;
use crate::execution::matrix::{AxisAssignment, JobSpec};
use crate::execution::trigger::TriggerEvent;
use crate::runners::{CollaboratorError, CoverageReporter};

use async_trait::async_trait;
use serde::Serialize;
use std::collections::BTreeSet;
use std::path::PathBuf;

/// A merged report tagged with the axis assignment that produced it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CoverageUpload {
    pub job: String,
    pub tag: AxisAssignment,
    pub flags: BTreeSet<String>,
    pub slug: String,
    pub report: CoverageReport,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SuppressReason {
    /// Merge-group runs duplicate the pull request's coverage
    MergeGroup,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "status", content = "reason")]
pub enum ForwardOutcome {
    Forwarded,
    Suppressed(SuppressReason),
}

pub struct CoverageAggregator;

impl CoverageAggregator {
    /// Merge fragments additively per (file, line) and (file, branch).
    /// Fails on the first malformed fragment.
    pub fn merge(fragments: &[CoverageFragment]) -> Result<CoverageReport, CoverageError> {
        let mut report = CoverageReport::new();
        for fragment in fragments {
            report.absorb(fragment.parse()?);
        }
        Ok(report)
    }

    /// Merge what can be merged. Malformed fragments are skipped and returned.
    pub fn merge_lenient(fragments: &[CoverageFragment]) -> (CoverageReport, Vec<CoverageError>) {
        let mut report = CoverageReport::new();
        let mut errors = Vec::new();

        for fragment in fragments {
            match fragment.parse() {
                Ok(partial) => report.absorb(partial),
                Err(e) => {
                    tracing::warn!(job = %fragment.job, partition = %fragment.partition, error = %e, "skipping coverage fragment");
                    errors.push(e);
                }
            }
        }

        (report, errors)
    }

    /// Send a job's report to the reporting collaborator, unless the run was
    /// triggered by a merge group or has been cancelled.
    pub async fn forward(
        reporter: &dyn CoverageReporter,
        report: CoverageReport,
        spec: &JobSpec,
        event: &TriggerEvent,
        cancelled: bool,
    ) -> Result<ForwardOutcome, CollaboratorError> {
        if event.is_merge_group() {
            tracing::debug!(job = %spec.id(), "coverage suppressed for merge group");
            return Ok(ForwardOutcome::Suppressed(SuppressReason::MergeGroup));
        }
        if cancelled {
            tracing::debug!(job = %spec.id(), "coverage suppressed for cancelled run");
            return Ok(ForwardOutcome::Suppressed(SuppressReason::Cancelled));
        }

        let upload = CoverageUpload {
            job: spec.id(),
            tag: spec.assignment.clone(),
            flags: spec.flags.clone(),
            slug: spec.slug(),
            report,
        };
        reporter.submit(&upload).await?;

        tracing::info!(job = %upload.job, lines = upload.report.lines_found(), "coverage forwarded");
        Ok(ForwardOutcome::Forwarded)
    }
}

/// Writes each upload to `coverage-<slug>.json` and `.lcov` in a directory.
pub struct FileCoverageReporter {
    dir: PathBuf,
}

impl FileCoverageReporter {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn json_path(&self, upload: &CoverageUpload) -> PathBuf {
        self.dir.join(format!("coverage-{}.json", upload.slug))
    }
}

#[async_trait]
impl CoverageReporter for FileCoverageReporter {
    async fn submit(&self, upload: &CoverageUpload) -> Result<(), CollaboratorError> {
        let fail = |e: &dyn std::fmt::Display| CollaboratorError::new("coverage", e.to_string());

        tokio::fs::create_dir_all(&self.dir).await.map_err(|e| fail(&e))?;

        let json = serde_json::to_string_pretty(upload).map_err(|e| fail(&e))?;
        tokio::fs::write(self.json_path(upload), json)
            .await
            .map_err(|e| fail(&e))?;

        let lcov_path = self.dir.join(format!("coverage-{}.lcov", upload.slug));
        tokio::fs::write(lcov_path, upload.report.to_lcov())
            .await
            .map_err(|e| fail(&e))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::matrix::SpecOrigin;
    use crate::execution::trigger::EventKind;
    use crate::runners::fakes::RecordingReporter;
    use crate::testing::partition::PartitionKind;

    fn fragment(partition: PartitionKind, payload: &str) -> CoverageFragment {
        CoverageFragment::new("pytest", partition, payload)
    }

    fn spec() -> JobSpec {
        JobSpec {
            index: 0,
            job: "pytest".to_string(),
            display_name: "pytest".to_string(),
            assignment: AxisAssignment::default(),
            flags: BTreeSet::new(),
            origin: SpecOrigin::Product,
        }
    }

    #[test]
    fn test_merge_adds_hits() {
        let fragments = vec![
            fragment(PartitionKind::ParallelSafe, r#"{"files": {"x.py": {"lines": {"7": 3}}}}"#),
            fragment(PartitionKind::SerialOnly, r#"{"files": {"x.py": {"lines": {"7": 2}}}}"#),
        ];

        let report = CoverageAggregator::merge(&fragments).unwrap();
        assert_eq!(report.line_hits("x.py", 7), Some(5));
    }

    #[test]
    fn test_missing_fragment_keeps_present_locations() {
        let fragments = vec![fragment(
            PartitionKind::ParallelSafe,
            r#"{"files": {"x.py": {"lines": {"1": 1, "2": 0}}}}"#,
        )];

        let report = CoverageAggregator::merge(&fragments).unwrap();
        assert_eq!(report.lines_found(), 2);
        assert_eq!(report.line_hits("x.py", 3), None);
        assert!(CoverageAggregator::merge(&[]).unwrap().is_empty());
    }

    #[test]
    fn test_strict_and_lenient_merge() {
        let fragments = vec![
            fragment(PartitionKind::ParallelSafe, r#"{"files": {"x.py": {"lines": {"1": 1}}}}"#),
            fragment(PartitionKind::SerialOnly, "{broken"),
        ];

        assert!(matches!(
            CoverageAggregator::merge(&fragments),
            Err(CoverageError::FragmentFormat { .. })
        ));

        let (report, errors) = CoverageAggregator::merge_lenient(&fragments);
        assert_eq!(report.line_hits("x.py", 1), Some(1));
        assert_eq!(errors.len(), 1);
    }

    #[tokio::test]
    async fn test_forward_suppression() {
        let reporter = RecordingReporter::default();
        let push = TriggerEvent::new(EventKind::Push, "main", "abc");
        let queue = TriggerEvent::new(EventKind::MergeGroup, "gh-readonly-queue/main", "abc");

        let outcome = CoverageAggregator::forward(&reporter, CoverageReport::new(), &spec(), &queue, false)
            .await
            .unwrap();
        assert_eq!(outcome, ForwardOutcome::Suppressed(SuppressReason::MergeGroup));

        let outcome = CoverageAggregator::forward(&reporter, CoverageReport::new(), &spec(), &push, true)
            .await
            .unwrap();
        assert_eq!(outcome, ForwardOutcome::Suppressed(SuppressReason::Cancelled));
        assert!(reporter.uploads().is_empty());

        let outcome = CoverageAggregator::forward(&reporter, CoverageReport::new(), &spec(), &push, false)
            .await
            .unwrap();
        assert_eq!(outcome, ForwardOutcome::Forwarded);
        assert_eq!(reporter.uploads().len(), 1);
    }

    #[tokio::test]
    async fn test_file_reporter_writes_json_and_lcov() {
        let dir = tempfile::tempdir().unwrap();
        let reporter = FileCoverageReporter::new(dir.path().join("coverage"));

        let mut report = CoverageReport::new();
        report.record_line("x.py", 1, 1);
        let upload = CoverageUpload {
            job: "pytest".to_string(),
            tag: AxisAssignment::default(),
            flags: BTreeSet::new(),
            slug: "000-pytest".to_string(),
            report,
        };

        reporter.submit(&upload).await.unwrap();
        let written = std::fs::read_to_string(reporter.json_path(&upload)).unwrap();
        assert!(written.contains("x.py"));
        assert!(dir.path().join("coverage/coverage-000-pytest.lcov").exists());
    }
}
