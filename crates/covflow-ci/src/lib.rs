//! covflow CI - Code coverage pipeline for Rust projects
//!
//! Runs one coverage job end to end:
//! - Evaluates the triggering event against branch rules
//! - Provisions a nightly toolchain with `llvm-tools` and `grcov`
//! - Builds and tests with `-Cinstrument-coverage` and branch regions
//! - Aggregates the profiling artifacts into a filtered LCOV report
//! - Publishes the report to a Codecov-compatible service

pub mod build;
pub mod config;
pub mod context;
pub mod coverage;
pub mod credential;
mod error;
pub mod fakes;
pub mod pipeline;
pub mod profile;
pub mod publish;
pub mod runner;
pub mod stage;
pub mod state;
pub mod telemetry;
pub mod toolchain;
pub mod trigger;

pub use build::{BuildTestOrchestrator, InstrumentationConfig};
pub use config::{PipelineConfig, DEFAULT_STAGE_TIMEOUT_SECS};
pub use context::RunContext;
pub use coverage::{
    AggregationConfig, CoverageAggregator, CoverageCounts, CoverageReport, CoverageSummary,
    FileCoverage, PathFilter,
};
pub use credential::PublishCredential;
pub use error::{AggregationError, PipelineError, Result};
pub use pipeline::{CoveragePipeline, PipelineResult, StageFailure, StageRecord};
pub use profile::ProfileData;
pub use publish::{CodecovPublisher, PublishConfig, PublishReceipt, Publisher};
pub use runner::{CommandOutput, CommandRunner, ProcessRunner};
pub use stage::{CommandSpec, Stage};
pub use state::{PipelineState, StepOutcome};
pub use telemetry::{default_level, init_tracing};
pub use toolchain::{ProvisionReport, ToolchainProvisioner, ToolchainSpec};
pub use trigger::{EventKind, RunEvent, TriggerRules};
