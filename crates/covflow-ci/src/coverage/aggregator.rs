//! Profile aggregation via the external coverage tool.

use crate::build::resolve;
use crate::coverage::filter::PathFilter;
use crate::coverage::lcov::CoverageReport;
use crate::error::{AggregationError, PipelineError, Result};
use crate::profile::ProfileData;
use crate::runner::CommandRunner;
use crate::stage::CommandSpec;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// How profiling data is turned into a report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregationConfig {
    /// Directory holding the instrumented binaries.
    pub binary_path: PathBuf,

    /// Root that source paths in the report are relative to.
    pub source_root: PathBuf,

    /// Output format passed to the tool; only `lcov` is supported.
    pub output_format: String,

    /// Collect branch coverage.
    pub branch: bool,

    /// Skip source files that no longer exist.
    pub ignore_not_existing: bool,

    /// Globs of paths left out of the report.
    pub excludes: Vec<String>,

    /// Where the report is written.
    pub report_path: PathBuf,
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            binary_path: PathBuf::from("target/debug"),
            source_root: PathBuf::from("."),
            output_format: "lcov".to_string(),
            branch: true,
            ignore_not_existing: true,
            excludes: vec!["/*".to_string(), "tests/*".to_string()],
            report_path: PathBuf::from("lcov.info"),
        }
    }
}

impl AggregationConfig {
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.output_format != "lcov" {
            return Err(format!(
                "unsupported output format `{}` (expected lcov)",
                self.output_format
            ));
        }
        if self.report_path.as_os_str().is_empty() {
            return Err("report path is empty".to_string());
        }
        Ok(())
    }
}

/// Turns a [`ProfileData`] set into one filtered LCOV report.
pub struct CoverageAggregator<'a> {
    runner: &'a dyn CommandRunner,
    tool: String,
    work_dir: PathBuf,
    channel: Option<String>,
    config: &'a AggregationConfig,
    timeout_secs: u64,
}

impl<'a> CoverageAggregator<'a> {
    pub fn new(
        runner: &'a dyn CommandRunner,
        tool: impl Into<String>,
        work_dir: impl Into<PathBuf>,
        config: &'a AggregationConfig,
        timeout_secs: u64,
    ) -> Self {
        Self {
            runner,
            tool: tool.into(),
            work_dir: work_dir.into(),
            channel: None,
            config,
            timeout_secs,
        }
    }

    /// Run the tool under `channel` so it finds that toolchain's llvm-tools.
    pub fn with_channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = Some(channel.into());
        self
    }

    /// Absolute location of the report file.
    pub fn report_path(&self) -> PathBuf {
        resolve(&self.work_dir, &self.config.report_path)
    }

    /// Tool invocation for `profile`.
    pub fn command(&self, profile: &ProfileData) -> CommandSpec {
        let mut command = vec![
            self.tool.clone(),
            path_arg(profile.search_root()),
            "--binary-path".to_string(),
            path_arg(&self.config.binary_path),
            "-s".to_string(),
            path_arg(&self.config.source_root),
            "-t".to_string(),
            self.config.output_format.clone(),
        ];
        if self.config.branch {
            command.push("--branch".to_string());
        }
        if self.config.ignore_not_existing {
            command.push("--ignore-not-existing".to_string());
        }
        for pattern in &self.config.excludes {
            command.push("--ignore".to_string());
            command.push(pattern.clone());
        }
        command.push("-o".to_string());
        command.push(path_arg(&raw_output_path(&self.config.report_path)));

        CommandSpec::new("aggregate", command, self.timeout_secs)
            .in_dir(&self.work_dir)
            .with_env(
                self.channel
                    .iter()
                    .map(|channel| ("RUSTUP_TOOLCHAIN", channel.clone())),
            )
    }

    /// Aggregate `profile` into a report and write it to the report path.
    ///
    /// The tool writes to a scratch file; the canonical report is staged next
    /// to the report path and renamed into place, so the report path only
    /// ever holds a complete report. The profile set is consumed. On any
    /// failure no report file is left behind.
    pub async fn aggregate(&self, profile: ProfileData) -> Result<CoverageReport> {
        self.config.validate().map_err(PipelineError::Config)?;

        if profile.is_empty() {
            return Err(AggregationError::NoProfileData(profile.search_root().to_path_buf()).into());
        }
        let binaries = resolve(&self.work_dir, &self.config.binary_path);
        if !binaries.exists() {
            return Err(AggregationError::MissingBinary(binaries).into());
        }
        let filter = PathFilter::new(
            &resolve(&self.work_dir, &self.config.source_root),
            &self.config.excludes,
        )?;

        let report_path = self.report_path();
        let result = self.collect(&profile, &filter, &report_path).await;
        match &result {
            Ok(_) => {
                remove_if_present(&raw_output_path(&report_path));
            }
            Err(_) => discard_outputs(&report_path),
        }
        result
    }

    async fn collect(
        &self,
        profile: &ProfileData,
        filter: &PathFilter,
        report_path: &Path,
    ) -> Result<CoverageReport> {
        let spec = self.command(profile);
        info!(
            artifacts = profile.len(),
            command = %spec.display(),
            "Aggregating profiles"
        );
        let output = self.runner.run(&spec).await?;
        if !output.passed() {
            return Err(AggregationError::ToolFailed {
                tool: self.tool.clone(),
                exit_code: output.exit_code,
                stderr: output.stderr_tail(10),
            }
            .into());
        }

        let raw_path = raw_output_path(report_path);
        let raw = match tokio::fs::read_to_string(&raw_path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(AggregationError::ToolFailed {
                    tool: self.tool.clone(),
                    exit_code: output.exit_code,
                    stderr: format!("no report written to {}", raw_path.display()),
                }
                .into());
            }
            Err(e) => return Err(e.into()),
        };

        let mut report = CoverageReport::parse(&raw)?;
        let dropped = report.retain(|path| !filter.is_excluded(path));
        if dropped > 0 {
            debug!(dropped, "Excluded files from report");
        }

        let staged = staged_path(report_path);
        tokio::fs::write(&staged, report.render()).await?;
        tokio::fs::rename(&staged, report_path).await?;
        info!(
            files = report.len(),
            digest = %report.digest(),
            path = %report_path.display(),
            "Coverage report written"
        );
        Ok(report)
    }
}

fn path_arg(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

/// Where the tool writes its unfiltered output for `report_path`.
pub fn raw_output_path(report_path: &Path) -> PathBuf {
    with_suffix(report_path, ".raw")
}

fn staged_path(report_path: &Path) -> PathBuf {
    with_suffix(report_path, ".tmp")
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

/// Remove the report at `report_path` and every scratch file that goes with
/// it. Used when aggregation fails or is cut short.
pub fn discard_outputs(report_path: &Path) {
    for path in [
        report_path.to_path_buf(),
        raw_output_path(report_path),
        staged_path(report_path),
    ] {
        if remove_if_present(&path) {
            warn!(path = %path.display(), "Removed partial coverage output");
        }
    }
}

fn remove_if_present(path: &Path) -> bool {
    match std::fs::remove_file(path) {
        Ok(()) => true,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Could not remove coverage output");
            false
        }
    }
}
