//! In-memory fakes for the pipeline's seams (testing only)
//!
//! Provides `ScriptedRunner` (a [`CommandRunner`] answering from a script)
//! and `RecordingPublisher` (a [`Publisher`] that keeps what it was given),
//! so the whole pipeline can run without a toolchain or network.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::context::RunContext;
use crate::coverage::CoverageReport;
use crate::credential::PublishCredential;
use crate::error::{PipelineError, Result};
use crate::publish::{PublishReceipt, Publisher};
use crate::runner::{CommandOutput, CommandRunner};
use crate::stage::CommandSpec;

// ---------------------------------------------------------------------------
// ScriptedRunner
// ---------------------------------------------------------------------------

/// Canned response for commands matching a prefix.
#[derive(Debug, Clone)]
pub struct Reply {
    exit_code: i32,
    stdout: String,
    stderr: String,
    files: Vec<(PathBuf, String)>,
    output_file: Option<String>,
}

impl Reply {
    /// Exit 0 with no output.
    pub fn ok() -> Self {
        Self {
            exit_code: 0,
            stdout: String::new(),
            stderr: String::new(),
            files: Vec::new(),
            output_file: None,
        }
    }

    /// Exit with `exit_code` and `stderr`.
    pub fn fail(exit_code: i32, stderr: &str) -> Self {
        Self {
            exit_code,
            stderr: stderr.to_string(),
            ..Self::ok()
        }
    }

    pub fn with_stdout(mut self, stdout: &str) -> Self {
        self.stdout = stdout.to_string();
        self
    }

    /// Write `contents` to `path` (relative to the command's directory).
    pub fn with_file(mut self, path: impl Into<PathBuf>, contents: &str) -> Self {
        self.files.push((path.into(), contents.to_string()));
        self
    }

    /// Write `contents` to the path following `-o`, when the command has one.
    pub fn writes_output(mut self, contents: &str) -> Self {
        self.output_file = Some(contents.to_string());
        self
    }
}

/// A [`CommandRunner`] that answers from a script and records every call.
///
/// Commands with no matching rule succeed with empty output.
#[derive(Debug, Default)]
pub struct ScriptedRunner {
    rules: Vec<(Vec<String>, Reply)>,
    calls: Mutex<Vec<CommandSpec>>,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer commands whose argv starts with `prefix`. First match wins.
    pub fn on(mut self, prefix: &[&str], reply: Reply) -> Self {
        self.rules
            .push((prefix.iter().map(|s| s.to_string()).collect(), reply));
        self
    }

    /// Every command run so far, in order.
    pub fn calls(&self) -> Vec<CommandSpec> {
        self.calls.lock().unwrap().clone()
    }

    /// Number of calls whose argv starts with `prefix`.
    pub fn count(&self, prefix: &[&str]) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.starts_with(prefix))
            .count()
    }

    fn write(base: Option<&Path>, path: &Path, contents: &str) -> Result<()> {
        let target = match base {
            Some(dir) if path.is_relative() => dir.join(path),
            _ => path.to_path_buf(),
        };
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(target, contents)?;
        Ok(())
    }
}

#[async_trait]
impl CommandRunner for ScriptedRunner {
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput> {
        self.calls.lock().unwrap().push(spec.clone());

        let reply = self
            .rules
            .iter()
            .find(|(prefix, _)| {
                let words: Vec<&str> = prefix.iter().map(String::as_str).collect();
                spec.starts_with(&words)
            })
            .map(|(_, reply)| reply.clone())
            .unwrap_or_else(Reply::ok);

        let base = spec.current_dir.as_deref();
        for (path, contents) in &reply.files {
            Self::write(base, path, contents)?;
        }
        let output = spec
            .command
            .iter()
            .position(|arg| arg == "-o")
            .and_then(|i| spec.command.get(i + 1));
        if let (Some(contents), Some(output)) = (&reply.output_file, output) {
            Self::write(base, Path::new(output), contents)?;
        }

        Ok(CommandOutput {
            name: spec.name.clone(),
            exit_code: reply.exit_code,
            stdout: reply.stdout,
            stderr: reply.stderr,
            duration_ms: 0,
            success: reply.exit_code == 0,
        })
    }
}

// ---------------------------------------------------------------------------
// RecordingPublisher
// ---------------------------------------------------------------------------

/// One upload as seen by [`RecordingPublisher`].
#[derive(Debug, Clone)]
pub struct PublishedReport {
    pub report: CoverageReport,
    pub body: String,
    pub context: RunContext,
}

/// A [`Publisher`] that stores uploads in memory.
#[derive(Debug, Default)]
pub struct RecordingPublisher {
    published: Mutex<Vec<PublishedReport>>,
    attempts: Mutex<usize>,
    fail_with: Option<String>,
}

impl RecordingPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// A publisher whose every upload fails with `reason`.
    pub fn failing(reason: &str) -> Self {
        Self {
            fail_with: Some(reason.to_string()),
            ..Self::default()
        }
    }

    /// Successful uploads, in order.
    pub fn published(&self) -> Vec<PublishedReport> {
        self.published.lock().unwrap().clone()
    }

    /// Upload attempts, successful or not.
    pub fn attempts(&self) -> usize {
        *self.attempts.lock().unwrap()
    }
}

#[async_trait]
impl Publisher for RecordingPublisher {
    async fn publish(
        &self,
        report: CoverageReport,
        credential: &PublishCredential,
        context: &RunContext,
    ) -> Result<PublishReceipt> {
        *self.attempts.lock().unwrap() += 1;

        if let Some(reason) = &self.fail_with {
            return Err(PipelineError::Publish(reason.clone()));
        }
        if credential.expose().is_empty() {
            return Err(PipelineError::Publish("empty token".to_string()));
        }

        let body = report.render();
        let receipt = PublishReceipt {
            report_url: Some(format!("memory://{}/{}", context.slug(), context.commit)),
            bytes: body.len(),
        };
        self.published.lock().unwrap().push(PublishedReport {
            report,
            body,
            context: context.clone(),
        });
        Ok(receipt)
    }
}
