// Testing Module
// Test-case partitions and run reports

pub mod partition;
pub mod reporter;

// Re-export key types
pub use partition::{CaseResult, PartitionKind, PartitionResult, PartitionRunner, TestCase, TestCatalog};
pub use reporter::{ReportFormat, RunReporter};
