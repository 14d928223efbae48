//! Toolchain provisioning via `rustup` and `cargo install`.
//!
//! Every install is preceded by a query, so provisioning an environment that
//! already satisfies the [`ToolchainSpec`] issues no install commands.

use crate::error::{PipelineError, Result};
use crate::runner::{CommandOutput, CommandRunner};
use crate::stage::CommandSpec;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::PathBuf;
use tracing::{debug, info};

/// Compiler channel, components and coverage tool a run needs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolchainSpec {
    /// Compiler channel, e.g. `nightly` or `nightly-2024-05-01`.
    pub channel: String,

    /// rustup components to install for the channel.
    pub components: BTreeSet<String>,

    /// Binary that converts profiling data into reports.
    pub instrumentation_tool: String,
}

impl Default for ToolchainSpec {
    fn default() -> Self {
        Self {
            channel: "nightly".to_string(),
            components: BTreeSet::from(["llvm-tools-preview".to_string()]),
            instrumentation_tool: "grcov".to_string(),
        }
    }
}

impl ToolchainSpec {
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.channel.trim().is_empty() {
            return Err("toolchain channel is empty".to_string());
        }
        if self.components.iter().any(|c| c.trim().is_empty()) {
            return Err("toolchain component name is empty".to_string());
        }
        if self.instrumentation_tool.trim().is_empty() {
            return Err("instrumentation tool is empty".to_string());
        }
        Ok(())
    }
}

/// What a provisioning call changed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProvisionReport {
    pub installed_toolchain: bool,
    pub installed_components: Vec<String>,
    pub installed_tool: bool,
}

impl ProvisionReport {
    /// Whether anything had to be installed.
    pub fn changed(&self) -> bool {
        self.installed_toolchain || !self.installed_components.is_empty() || self.installed_tool
    }
}

/// Installs and selects the toolchain for a run.
pub struct ToolchainProvisioner<'a> {
    runner: &'a dyn CommandRunner,
    work_dir: PathBuf,
    timeout_secs: u64,
}

impl<'a> ToolchainProvisioner<'a> {
    pub fn new(runner: &'a dyn CommandRunner, work_dir: impl Into<PathBuf>, timeout_secs: u64) -> Self {
        Self {
            runner,
            work_dir: work_dir.into(),
            timeout_secs,
        }
    }

    /// Bring the environment in line with `spec`.
    ///
    /// Fails with [`PipelineError::Provisioning`] if the channel or any
    /// component cannot be installed; nothing is retried.
    pub async fn provision(&self, spec: &ToolchainSpec) -> Result<ProvisionReport> {
        spec.validate().map_err(PipelineError::Config)?;

        let mut report = ProvisionReport::default();

        if !self.has_toolchain(&spec.channel).await? {
            info!(channel = %spec.channel, "Installing toolchain");
            self.install(
                "rustup_toolchain_install",
                vec![
                    "rustup".into(),
                    "toolchain".into(),
                    "install".into(),
                    spec.channel.clone(),
                    "--profile".into(),
                    "minimal".into(),
                ],
                || format!("toolchain {} is not available", spec.channel),
            )
            .await?;
            report.installed_toolchain = true;
        }

        let installed = self.installed_components(&spec.channel).await?;
        for component in &spec.components {
            if component_installed(&installed, component) {
                debug!(component = %component, "Component already installed");
                continue;
            }
            info!(component = %component, channel = %spec.channel, "Adding component");
            self.install(
                "rustup_component_add",
                vec![
                    "rustup".into(),
                    "component".into(),
                    "add".into(),
                    component.clone(),
                    "--toolchain".into(),
                    spec.channel.clone(),
                ],
                || {
                    format!(
                        "component {} is unavailable for channel {}",
                        component, spec.channel
                    )
                },
            )
            .await?;
            report.installed_components.push(component.clone());
        }

        if !self.has_tool(&spec.instrumentation_tool).await? {
            info!(tool = %spec.instrumentation_tool, "Installing instrumentation tool");
            self.install(
                "cargo_install",
                vec![
                    "cargo".into(),
                    "install".into(),
                    "--locked".into(),
                    spec.instrumentation_tool.clone(),
                ],
                || format!("could not install {}", spec.instrumentation_tool),
            )
            .await?;
            report.installed_tool = true;
        }

        info!(
            channel = %spec.channel,
            changed = report.changed(),
            "Toolchain ready"
        );
        Ok(report)
    }

    fn command(&self, name: &str, command: Vec<String>) -> CommandSpec {
        CommandSpec::new(name, command, self.timeout_secs).in_dir(&self.work_dir)
    }

    async fn query(&self, name: &str, command: Vec<String>) -> Result<CommandOutput> {
        let spec = self.command(name, command);
        let output = self.runner.run(&spec).await?;
        if !output.passed() {
            return Err(PipelineError::Provisioning(format!(
                "`{}` exited with code {}: {}",
                spec.display(),
                output.exit_code,
                output.stderr_tail(5)
            )));
        }
        Ok(output)
    }

    async fn install(
        &self,
        name: &str,
        command: Vec<String>,
        describe: impl FnOnce() -> String,
    ) -> Result<()> {
        let output = self.runner.run(&self.command(name, command)).await?;
        if output.passed() {
            Ok(())
        } else {
            Err(PipelineError::Provisioning(format!(
                "{}: {}",
                describe(),
                output.stderr_tail(5)
            )))
        }
    }

    async fn has_toolchain(&self, channel: &str) -> Result<bool> {
        let output = self
            .query(
                "rustup_toolchain_list",
                vec!["rustup".into(), "toolchain".into(), "list".into()],
            )
            .await?;
        Ok(output
            .stdout
            .lines()
            .filter_map(|line| line.split_whitespace().next())
            .any(|name| toolchain_matches(name, channel)))
    }

    async fn installed_components(&self, channel: &str) -> Result<Vec<String>> {
        let output = self
            .query(
                "rustup_component_list",
                vec![
                    "rustup".into(),
                    "component".into(),
                    "list".into(),
                    "--installed".into(),
                    "--toolchain".into(),
                    channel.to_string(),
                ],
            )
            .await?;
        Ok(output
            .stdout
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect())
    }

    async fn has_tool(&self, tool: &str) -> Result<bool> {
        let spec = self.command("tool_version", vec![tool.to_string(), "--version".into()]);
        match self.runner.run(&spec).await {
            Ok(output) => Ok(output.passed()),
            // Spawn failure means the binary is not on PATH.
            Err(PipelineError::Io(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }
}

const ARCH_PREFIXES: &[&str] = &[
    "x86_64", "i686", "i586", "aarch64", "arm", "thumb", "riscv", "wasm32", "powerpc", "s390x",
    "mips", "loongarch64", "sparc",
];

fn is_target_triple(s: &str) -> bool {
    s.contains('-') && ARCH_PREFIXES.iter().any(|arch| s.starts_with(arch))
}

/// `name` optionally followed by `-<target triple>`.
fn names_match(listed: &str, name: &str) -> bool {
    listed == name
        || listed
            .strip_prefix(name)
            .and_then(|rest| rest.strip_prefix('-'))
            .is_some_and(is_target_triple)
}

/// `nightly` matches `nightly-x86_64-unknown-linux-gnu` but not
/// `nightly-2024-05-01-x86_64-unknown-linux-gnu`.
fn toolchain_matches(installed: &str, channel: &str) -> bool {
    names_match(installed, channel)
}

/// rustup renames `*-preview` components once stabilised, so
/// `llvm-tools-preview` is listed as `llvm-tools-x86_64-unknown-linux-gnu`.
fn component_installed(installed: &[String], component: &str) -> bool {
    let base = component.strip_suffix("-preview").unwrap_or(component);
    installed
        .iter()
        .any(|line| names_match(line, component) || names_match(line, base))
}
