// Coverage Module
// Fragment parsing, additive merging and forwarding

pub mod aggregator;
pub mod fragment;
pub mod report;

pub use aggregator::{
    CoverageAggregator, CoverageUpload, FileCoverageReporter, ForwardOutcome, SuppressReason,
};
pub use fragment::{CoverageError, CoverageFragment};
pub use report::{CoverageReport, FileCoverage};
