//! Coverage aggregation: LCOV model, path filtering and the aggregator stage.

pub mod aggregator;
pub mod filter;
pub mod lcov;
pub mod summary;

pub use aggregator::{AggregationConfig, CoverageAggregator};
pub use filter::PathFilter;
pub use lcov::{BranchId, CoverageReport, FileCoverage, FunctionCoverage};
pub use summary::{CoverageCounts, CoverageSummary, FileSummary};
