// Coverage Reports
// Per-file line and branch hit counts with JSON and LCOV rendering

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Write as _;

/// Hit counts for one source file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileCoverage {
    #[serde(default)]
    pub lines: BTreeMap<u32, u64>,
    #[serde(default)]
    pub branches: BTreeMap<String, u64>,
}

impl FileCoverage {
    pub fn lines_hit(&self) -> usize {
        self.lines.values().filter(|hits| **hits > 0).count()
    }
}

/// Merged coverage: source file to line and branch hit counts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CoverageReport {
    pub files: BTreeMap<String, FileCoverage>,
}

impl CoverageReport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_line(&mut self, file: &str, line: u32, hits: u64) {
        let count = self
            .files
            .entry(file.to_string())
            .or_default()
            .lines
            .entry(line)
            .or_insert(0);
        *count = count.saturating_add(hits);
    }

    pub fn record_branch(&mut self, file: &str, branch: &str, hits: u64) {
        let count = self
            .files
            .entry(file.to_string())
            .or_default()
            .branches
            .entry(branch.to_string())
            .or_insert(0);
        *count = count.saturating_add(hits);
    }

    /// Add another report's counts into this one. Counts saturate at `u64::MAX`.
    pub fn absorb(&mut self, other: CoverageReport) {
        for (path, file) in other.files {
            let target = self.files.entry(path).or_default();
            for (line, hits) in file.lines {
                let count = target.lines.entry(line).or_insert(0);
                *count = count.saturating_add(hits);
            }
            for (branch, hits) in file.branches {
                let count = target.branches.entry(branch).or_insert(0);
                *count = count.saturating_add(hits);
            }
        }
    }

    pub fn line_hits(&self, file: &str, line: u32) -> Option<u64> {
        self.files.get(file)?.lines.get(&line).copied()
    }

    pub fn branch_hits(&self, file: &str, branch: &str) -> Option<u64> {
        self.files.get(file)?.branches.get(branch).copied()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn lines_found(&self) -> usize {
        self.files.values().map(|f| f.lines.len()).sum()
    }

    pub fn lines_hit(&self) -> usize {
        self.files.values().map(FileCoverage::lines_hit).sum()
    }

    /// Fraction of instrumented lines hit at least once.
    pub fn line_rate(&self) -> f64 {
        match self.lines_found() {
            0 => 0.0,
            found => self.lines_hit() as f64 / found as f64,
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    /// Render as an LCOV tracefile.
    ///
    /// Branch ids have no block structure here, so every branch is written
    /// as block 0 with its position as the branch number.
    pub fn to_lcov(&self) -> String {
        let mut out = String::new();

        for (path, file) in &self.files {
            let _ = writeln!(out, "SF:{}", path);
            for (line, hits) in &file.lines {
                let _ = writeln!(out, "DA:{},{}", line, hits);
            }
            for (index, (branch, hits)) in file.branches.iter().enumerate() {
                let line = branch
                    .split(|c: char| !c.is_ascii_digit())
                    .next()
                    .and_then(|n| n.parse::<u32>().ok())
                    .unwrap_or(0);
                let _ = writeln!(out, "BRDA:{},0,{},{}", line, index, hits);
            }
            if !file.branches.is_empty() {
                let hit = file.branches.values().filter(|h| **h > 0).count();
                let _ = writeln!(out, "BRF:{}", file.branches.len());
                let _ = writeln!(out, "BRH:{}", hit);
            }
            let _ = writeln!(out, "LF:{}", file.lines.len());
            let _ = writeln!(out, "LH:{}", file.lines_hit());
            out.push_str("end_of_record\n");
        }

        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_absorb_is_additive() {
        let mut a = CoverageReport::new();
        a.record_line("src/x.py", 10, 3);
        a.record_branch("src/x.py", "12:0", 1);

        let mut b = CoverageReport::new();
        b.record_line("src/x.py", 10, 2);
        b.record_line("src/y.py", 1, 0);
        b.record_branch("src/x.py", "12:0", 4);

        a.absorb(b);
        assert_eq!(a.line_hits("src/x.py", 10), Some(5));
        assert_eq!(a.branch_hits("src/x.py", "12:0"), Some(5));
        assert_eq!(a.line_hits("src/y.py", 1), Some(0));
    }

    #[test]
    fn test_absorb_saturates_large_counts() {
        let mut a = CoverageReport::new();
        a.record_line("src/x.py", 1, u64::MAX);
        a.record_branch("src/x.py", "1:0", u64::MAX - 1);

        let mut b = CoverageReport::new();
        b.record_line("src/x.py", 1, u64::MAX);
        b.record_branch("src/x.py", "1:0", 5);

        a.absorb(b);
        assert_eq!(a.line_hits("src/x.py", 1), Some(u64::MAX));
        assert_eq!(a.branch_hits("src/x.py", "1:0"), Some(u64::MAX));

        a.record_line("src/x.py", 1, 1);
        assert_eq!(a.line_hits("src/x.py", 1), Some(u64::MAX));
    }

    #[test]
    fn test_line_rate() {
        let mut report = CoverageReport::new();
        assert_eq!(report.line_rate(), 0.0);

        report.record_line("a.py", 1, 1);
        report.record_line("a.py", 2, 0);
        report.record_line("b.py", 1, 7);
        report.record_line("b.py", 2, 0);
        assert_eq!(report.lines_found(), 4);
        assert_eq!(report.lines_hit(), 2);
        assert!((report.line_rate() - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_lcov_rendering() {
        let mut report = CoverageReport::new();
        report.record_line("src/x.py", 3, 2);
        report.record_line("src/x.py", 4, 0);
        report.record_branch("src/x.py", "3:1", 1);

        let lcov = report.to_lcov();
        assert_eq!(
            lcov,
            "SF:src/x.py\nDA:3,2\nDA:4,0\nBRDA:3,0,0,1\nBRF:1\nBRH:1\nLF:2\nLH:1\nend_of_record\n"
        );
    }
}
