//! Pipeline stages and the commands they run.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

/// The five sequential stages of a coverage run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Install the compiler channel, components and coverage tool.
    Provision,

    /// Instrumented `cargo build`.
    Build,

    /// Instrumented `cargo test`, emitting `*.profraw` artifacts.
    Test,

    /// Profiling artifacts to a single LCOV report.
    Aggregate,

    /// Upload the report to the tracking service.
    Publish,
}

impl Stage {
    /// All stages in execution order.
    pub const ORDER: [Stage; 5] = [
        Stage::Provision,
        Stage::Build,
        Stage::Test,
        Stage::Aggregate,
        Stage::Publish,
    ];

    /// Get the stage name as a string.
    pub fn name(&self) -> &'static str {
        match self {
            Stage::Provision => "provision",
            Stage::Build => "build",
            Stage::Test => "test",
            Stage::Aggregate => "aggregate",
            Stage::Publish => "publish",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A single external command issued by a stage.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CommandSpec {
    /// Human-readable label used in logs.
    pub name: String,

    /// Command to execute (first element is executable).
    pub command: Vec<String>,

    /// Extra environment variables for the child process.
    #[serde(default)]
    pub env: BTreeMap<String, String>,

    /// Working directory; inherits the current one when unset.
    #[serde(default)]
    pub current_dir: Option<PathBuf>,

    /// Timeout in seconds (0 = no timeout).
    pub timeout_secs: u64,
}

impl CommandSpec {
    /// Create a command specification.
    pub fn new<I, S>(name: impl Into<String>, command: I, timeout_secs: u64) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            command: command.into_iter().map(Into::into).collect(),
            env: BTreeMap::new(),
            current_dir: None,
            timeout_secs,
        }
    }

    /// Run the command inside `dir`.
    pub fn in_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    /// Add environment variables for the child process.
    pub fn with_env<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.env
            .extend(vars.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    /// Whether argv starts with the given words.
    pub fn starts_with(&self, prefix: &[&str]) -> bool {
        prefix.len() <= self.command.len()
            && self.command.iter().zip(prefix).all(|(a, b)| a == b)
    }

    /// Shell-like rendering for logs.
    pub fn display(&self) -> String {
        self.command.join(" ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_names() {
        assert_eq!(Stage::Provision.name(), "provision");
        assert_eq!(Stage::Build.name(), "build");
        assert_eq!(Stage::Test.name(), "test");
        assert_eq!(Stage::Aggregate.name(), "aggregate");
        assert_eq!(Stage::Publish.name(), "publish");
    }

    #[test]
    fn test_stage_order() {
        assert_eq!(Stage::ORDER.first(), Some(&Stage::Provision));
        assert_eq!(Stage::ORDER.last(), Some(&Stage::Publish));
    }

    #[test]
    fn test_command_spec_builder() {
        let spec = CommandSpec::new("build", ["cargo", "build"], 300)
            .in_dir("/tmp/project")
            .with_env([("RUSTFLAGS", "-Cinstrument-coverage")]);
        assert_eq!(spec.command, vec!["cargo", "build"]);
        assert_eq!(spec.current_dir, Some(PathBuf::from("/tmp/project")));
        assert_eq!(spec.env["RUSTFLAGS"], "-Cinstrument-coverage");
        assert_eq!(spec.display(), "cargo build");
    }

    #[test]
    fn test_command_spec_prefix_match() {
        let spec = CommandSpec::new("x", ["rustup", "component", "add", "llvm-tools"], 0);
        assert!(spec.starts_with(&["rustup", "component"]));
        assert!(!spec.starts_with(&["rustup", "toolchain"]));
        assert!(!spec.starts_with(&["rustup", "component", "add", "llvm-tools", "extra"]));
    }
}
