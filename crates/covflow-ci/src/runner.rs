//! External command execution.

use crate::error::{PipelineError, Result};
use crate::stage::CommandSpec;
use async_trait::async_trait;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tracing::debug;

/// Result of a command execution.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    /// Command label.
    pub name: String,

    /// Exit code (0 = success).
    pub exit_code: i32,

    /// Captured stdout.
    pub stdout: String,

    /// Captured stderr.
    pub stderr: String,

    /// Duration in milliseconds.
    pub duration_ms: u64,

    /// Whether execution succeeded.
    pub success: bool,
}

impl CommandOutput {
    /// Whether this command passed (exit code 0).
    pub fn passed(&self) -> bool {
        self.success && self.exit_code == 0
    }

    /// Last `max_lines` lines of stderr, for error messages.
    pub fn stderr_tail(&self, max_lines: usize) -> String {
        let lines: Vec<&str> = self.stderr.lines().collect();
        let start = lines.len().saturating_sub(max_lines);
        lines[start..].join("\n")
    }
}

/// Executes commands on behalf of the pipeline stages.
///
/// The process-backed [`ProcessRunner`] is used in production; tests swap in
/// [`crate::fakes::ScriptedRunner`].
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run one command to completion.
    ///
    /// A non-zero exit is reported through [`CommandOutput::passed`], not as an
    /// error; errors mean the command could not be run at all.
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput>;
}

/// Runs commands as child processes.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessRunner;

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput> {
        let start = Instant::now();

        let Some((exe, args)) = spec.command.split_first() else {
            return Err(PipelineError::Config(format!(
                "command {} is empty",
                spec.name
            )));
        };

        debug!(command = %spec.display(), "spawning");

        let mut command = Command::new(exe);
        command
            .args(args)
            .envs(&spec.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &spec.current_dir {
            command.current_dir(dir);
        }

        let child = command.spawn()?;

        let output = if spec.timeout_secs > 0 {
            tokio::time::timeout(
                Duration::from_secs(spec.timeout_secs),
                child.wait_with_output(),
            )
            .await
            .map_err(|_| PipelineError::Timeout {
                what: format!("command `{}`", spec.display()),
                timeout_secs: spec.timeout_secs,
            })??
        } else {
            child.wait_with_output().await?
        };

        let duration_ms = start.elapsed().as_millis() as u64;
        let exit_code = output.status.code().unwrap_or(-1);

        Ok(CommandOutput {
            name: spec.name.clone(),
            exit_code,
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            duration_ms,
            success: output.status.success(),
        })
    }
}
