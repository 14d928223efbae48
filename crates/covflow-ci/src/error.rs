//! Error types for the coverage pipeline.

use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while turning profiling artifacts into a report.
#[derive(Error, Debug)]
pub enum AggregationError {
    /// No `*.profraw` files under the search root.
    #[error("no profiling artifacts found under {}", .0.display())]
    NoProfileData(PathBuf),

    /// The binary path handed to the coverage tool does not exist.
    #[error("build binary path does not exist: {}", .0.display())]
    MissingBinary(PathBuf),

    /// The coverage tool exited unsuccessfully.
    #[error("{tool} exited with code {exit_code}: {stderr}")]
    ToolFailed {
        tool: String,
        exit_code: i32,
        stderr: String,
    },

    /// The tool output could not be read as LCOV.
    #[error("malformed LCOV at line {line}: {reason}")]
    Malformed { line: usize, reason: String },

    /// An exclusion pattern is not a valid glob.
    #[error("invalid exclusion glob `{pattern}`: {reason}")]
    InvalidGlob { pattern: String, reason: String },
}

/// Errors that can abort a pipeline run.
///
/// Every stage maps its failure onto exactly one variant; none of them is
/// recovered from inside the pipeline.
#[derive(Error, Debug)]
pub enum PipelineError {
    /// Requested toolchain, component or instrumentation tool unavailable.
    #[error("provisioning failed: {0}")]
    Provisioning(String),

    /// The instrumented build did not compile.
    #[error("build failed: {0}")]
    Build(String),

    /// One or more tests did not pass.
    #[error("tests failed: {0}")]
    TestFailure(String),

    /// Profiling data could not be aggregated.
    #[error("aggregation failed: {0}")]
    Aggregation(#[from] AggregationError),

    /// Transport or authentication failure during upload.
    #[error("publish failed: {0}")]
    Publish(String),

    /// Invalid pipeline configuration.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// A command or the whole run exceeded its time budget.
    #[error("{what} timed out after {timeout_secs} seconds")]
    Timeout { what: String, timeout_secs: u64 },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl PipelineError {
    /// Process exit status the CLI reports for this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            PipelineError::Provisioning(_) => 10,
            PipelineError::Build(_) => 20,
            PipelineError::TestFailure(_) => 30,
            PipelineError::Aggregation(_) => 40,
            PipelineError::Publish(_) => 50,
            PipelineError::Config(_) => 2,
            PipelineError::Timeout { .. } | PipelineError::Io(_) | PipelineError::Json(_) => 1,
        }
    }
}

impl From<reqwest::Error> for PipelineError {
    fn from(err: reqwest::Error) -> Self {
        // reqwest includes the request URL in its message; the token is sent
        // as a header so nothing secret ends up here.
        PipelineError::Publish(err.to_string())
    }
}

/// Result type for pipeline operations.
pub type Result<T> = std::result::Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes_are_stage_specific() {
        let codes = [
            PipelineError::Provisioning("x".into()).exit_code(),
            PipelineError::Build("x".into()).exit_code(),
            PipelineError::TestFailure("x".into()).exit_code(),
            PipelineError::Aggregation(AggregationError::NoProfileData(".".into())).exit_code(),
            PipelineError::Publish("x".into()).exit_code(),
        ];
        for code in codes {
            assert_ne!(code, 0);
        }
        let unique: std::collections::HashSet<_> = codes.iter().collect();
        assert_eq!(unique.len(), codes.len());
    }

    #[test]
    fn test_aggregation_error_message() {
        let err = PipelineError::from(AggregationError::MissingBinary("target/debug".into()));
        assert!(err.to_string().contains("target/debug"));
        assert_eq!(err.exit_code(), 40);
    }
}
