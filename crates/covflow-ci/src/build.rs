//! Instrumented build and test execution.

use crate::coverage::aggregator::discard_outputs;
use crate::error::{PipelineError, Result};
use crate::profile::{self, ProfileData};
use crate::runner::{CommandOutput, CommandRunner};
use crate::stage::CommandSpec;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Source-based coverage plus branch regions; the latter needs a nightly rustc.
pub const DEFAULT_RUSTFLAGS: &str = "-Cinstrument-coverage -Zcoverage-options=branch";

/// Environment-driven instrumentation settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InstrumentationConfig {
    /// Value of `RUSTFLAGS` for the instrumented build.
    pub rustflags: String,

    /// Value of `LLVM_PROFILE_FILE`; must contain `%p` and `%m`.
    pub profile_file_pattern: String,

    /// Extra arguments appended to `cargo build`.
    pub build_args: Vec<String>,

    /// Extra arguments appended to `cargo test`.
    pub test_args: Vec<String>,
}

impl Default for InstrumentationConfig {
    fn default() -> Self {
        Self {
            rustflags: DEFAULT_RUSTFLAGS.to_string(),
            profile_file_pattern: "covflow-%p-%m.profraw".to_string(),
            build_args: Vec::new(),
            test_args: Vec::new(),
        }
    }
}

impl InstrumentationConfig {
    pub fn validate(&self) -> std::result::Result<(), String> {
        if !self.rustflags.contains("instrument-coverage") {
            return Err(format!(
                "rustflags `{}` do not enable -Cinstrument-coverage",
                self.rustflags
            ));
        }
        profile::validate_pattern(&self.profile_file_pattern)
    }
}

/// Compiles the project and runs its tests with coverage hooks linked in.
pub struct BuildTestOrchestrator<'a> {
    runner: &'a dyn CommandRunner,
    work_dir: PathBuf,
    channel: Option<String>,
    config: &'a InstrumentationConfig,
    timeout_secs: u64,
}

impl<'a> BuildTestOrchestrator<'a> {
    pub fn new(
        runner: &'a dyn CommandRunner,
        work_dir: impl Into<PathBuf>,
        config: &'a InstrumentationConfig,
        timeout_secs: u64,
    ) -> Self {
        Self {
            runner,
            work_dir: work_dir.into(),
            channel: None,
            config,
            timeout_secs,
        }
    }

    /// Pin every cargo invocation to `channel` via `RUSTUP_TOOLCHAIN`.
    pub fn with_channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = Some(channel.into());
        self
    }

    /// Environment shared by the build and test commands.
    pub fn instrumentation_env(&self) -> BTreeMap<String, String> {
        let mut env = BTreeMap::new();
        env.insert("RUSTFLAGS".to_string(), self.config.rustflags.clone());
        env.insert(
            "LLVM_PROFILE_FILE".to_string(),
            self.config.profile_file_pattern.clone(),
        );
        env.insert("CARGO_INCREMENTAL".to_string(), "0".to_string());
        if let Some(channel) = &self.channel {
            env.insert("RUSTUP_TOOLCHAIN".to_string(), channel.clone());
        }
        env
    }

    /// Clear artifacts an earlier run left in the working directory.
    ///
    /// Removes stale `*.profraw` files and the report at `report_path`, so
    /// that a failed build or test never leaves a report behind.
    pub fn prepare(&self, report_path: &Path) -> Result<()> {
        self.config.validate().map_err(PipelineError::Config)?;

        let removed = profile::remove_stale(&self.work_dir)?;
        if removed > 0 {
            info!(removed, "Removed stale profiling artifacts");
        }
        discard_outputs(&resolve(&self.work_dir, report_path));
        Ok(())
    }

    /// `cargo build` with instrumentation enabled.
    pub async fn build(&self) -> Result<CommandOutput> {
        let output = self
            .cargo("cargo_build", "build", &self.config.build_args)
            .await?;
        if !output.passed() {
            warn!(exit_code = output.exit_code, "Instrumented build failed");
            return Err(PipelineError::Build(format!(
                "cargo build exited with code {}: {}",
                output.exit_code,
                output.stderr_tail(20)
            )));
        }
        Ok(output)
    }

    /// `cargo test` with instrumentation enabled, then collect the profiles.
    pub async fn test(&self) -> Result<ProfileData> {
        let output = self
            .cargo("cargo_test", "test", &self.config.test_args)
            .await?;
        if !output.passed() {
            warn!(exit_code = output.exit_code, "Test suite failed");
            return Err(PipelineError::TestFailure(format!(
                "cargo test exited with code {}: {}",
                output.exit_code,
                output.stderr_tail(20)
            )));
        }

        let data = ProfileData::discover(&self.work_dir)?;
        info!(artifacts = data.len(), "Test suite passed");
        Ok(data)
    }

    async fn cargo(&self, name: &str, subcommand: &str, extra: &[String]) -> Result<CommandOutput> {
        let mut command = vec!["cargo".to_string(), subcommand.to_string()];
        command.extend(extra.iter().cloned());

        let spec = CommandSpec::new(name, command, self.timeout_secs)
            .in_dir(&self.work_dir)
            .with_env(self.instrumentation_env());
        info!(command = %spec.display(), "Running");
        self.runner.run(&spec).await
    }
}

pub(crate) fn resolve(work_dir: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        work_dir.join(path)
    }
}
