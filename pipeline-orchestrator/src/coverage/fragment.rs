// Coverage Fragments
// Raw coverage payloads emitted by individual test partitions

use crate::coverage::report::CoverageReport;
use crate::testing::partition::PartitionKind;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoverageError {
    #[error("coverage fragment from {job} ({partition}) is malformed: {reason}")]
    FragmentFormat {
        job: String,
        partition: PartitionKind,
        reason: String,
    },
}

/// Coverage produced by one partition run. The payload stays opaque until
/// it is merged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CoverageFragment {
    pub job: String,
    pub partition: PartitionKind,
    pub payload: String,
}

impl CoverageFragment {
    pub fn new(job: impl Into<String>, partition: PartitionKind, payload: impl Into<String>) -> Self {
        Self {
            job: job.into(),
            partition,
            payload: payload.into(),
        }
    }

    /// Decode `{"files": {"<path>": {"lines": {...}, "branches": {...}}}}`,
    /// or a coverage.py JSON report (`meta` plus per-file `executed_lines`).
    pub fn parse(&self) -> Result<CoverageReport, CoverageError> {
        let payload: Payload =
            serde_json::from_str(&self.payload).map_err(|e| CoverageError::FragmentFormat {
                job: self.job.clone(),
                partition: self.partition,
                reason: e.to_string(),
            })?;

        Ok(match payload {
            Payload::Native(report) => report,
            Payload::CoveragePy(report) => report.into_report(),
        })
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Payload {
    Native(CoverageReport),
    CoveragePy(CoveragePyReport),
}

/// The subset of coverage.py's `json` report that carries hits. Executed
/// lines and arcs count as one hit, missing ones as zero.
#[derive(Deserialize)]
struct CoveragePyReport {
    #[allow(dead_code)]
    meta: serde::de::IgnoredAny,
    files: BTreeMap<String, CoveragePyFile>,
}

#[derive(Deserialize)]
struct CoveragePyFile {
    executed_lines: Vec<u32>,
    #[serde(default)]
    missing_lines: Vec<u32>,
    #[serde(default)]
    executed_branches: Vec<(i64, i64)>,
    #[serde(default)]
    missing_branches: Vec<(i64, i64)>,
}

impl CoveragePyReport {
    fn into_report(self) -> CoverageReport {
        let mut report = CoverageReport::new();
        for (path, file) in self.files {
            for line in file.missing_lines {
                report.record_line(&path, line, 0);
            }
            for line in file.executed_lines {
                report.record_line(&path, line, 1);
            }
            for (from, to) in file.missing_branches {
                report.record_branch(&path, &format!("{}:{}", from, to), 0);
            }
            for (from, to) in file.executed_branches {
                report.record_branch(&path, &format!("{}:{}", from, to), 1);
            }
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_fragment() {
        let fragment = CoverageFragment::new(
            "pytest[ubuntu-latest,3.10]",
            PartitionKind::ParallelSafe,
            r#"{"files": {"src/x.py": {"lines": {"1": 2, "5": 0}, "branches": {"1:0": 1}}}}"#,
        );

        let report = fragment.parse().unwrap();
        assert_eq!(report.line_hits("src/x.py", 1), Some(2));
        assert_eq!(report.line_hits("src/x.py", 5), Some(0));
        assert_eq!(report.branch_hits("src/x.py", "1:0"), Some(1));
    }

    #[test]
    fn test_parse_coverage_py_report() {
        let fragment = CoverageFragment::new(
            "pytest",
            PartitionKind::ParallelSafe,
            r#"{
                "meta": {"version": "7.4.0", "format": 2, "branch_coverage": true},
                "files": {"src/app.py": {
                    "executed_lines": [1, 2],
                    "missing_lines": [5],
                    "excluded_lines": [],
                    "executed_branches": [[2, 3]],
                    "missing_branches": [[2, -1]],
                    "summary": {"covered_lines": 2}
                }},
                "totals": {"covered_lines": 2}
            }"#,
        );

        let report = fragment.parse().unwrap();
        assert_eq!(report.line_hits("src/app.py", 1), Some(1));
        assert_eq!(report.line_hits("src/app.py", 5), Some(0));
        assert_eq!(report.branch_hits("src/app.py", "2:3"), Some(1));
        assert_eq!(report.branch_hits("src/app.py", "2:-1"), Some(0));
    }

    #[test]
    fn test_foreign_shape_is_rejected() {
        let payloads = [
            r#"{"files": {"src/app.py": {"executed": [1, 2]}}}"#,
            r#"{"files": {}, "totals": {}}"#,
            r#"{"coverage": 0.8}"#,
            r#"{}"#,
        ];
        for payload in payloads {
            let fragment = CoverageFragment::new("pytest", PartitionKind::ParallelSafe, payload);
            assert!(
                matches!(fragment.parse(), Err(CoverageError::FragmentFormat { .. })),
                "accepted {}",
                payload
            );
        }
    }

    #[test]
    fn test_malformed_fragment() {
        let fragment = CoverageFragment::new("pytest", PartitionKind::SerialOnly, "not json");
        let err = fragment.parse().unwrap_err();
        assert!(err.to_string().contains("serial"));
    }
}
