//! Pipeline configuration.
//!
//! Built-in defaults reproduce the usual nightly + `grcov` + Codecov setup;
//! a JSON file can override any section, and the CLI layers flags on top.

use crate::build::InstrumentationConfig;
use crate::coverage::AggregationConfig;
use crate::error::{PipelineError, Result};
use crate::publish::PublishConfig;
use crate::toolchain::ToolchainSpec;
use crate::trigger::TriggerRules;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Default per-command timeout in seconds (30 minutes).
pub const DEFAULT_STAGE_TIMEOUT_SECS: u64 = 1800;

/// Everything a run needs except the credential.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub trigger: TriggerRules,
    pub toolchain: ToolchainSpec,
    pub instrumentation: InstrumentationConfig,
    pub aggregation: AggregationConfig,
    pub publish: PublishConfig,

    /// Timeout applied to each external command (0 = none).
    pub stage_timeout_secs: u64,

    /// Timeout for the whole run; exceeding it fails the run.
    pub run_timeout_secs: Option<u64>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            trigger: TriggerRules::default(),
            toolchain: ToolchainSpec::default(),
            instrumentation: InstrumentationConfig::default(),
            aggregation: AggregationConfig::default(),
            publish: PublishConfig::default(),
            stage_timeout_secs: DEFAULT_STAGE_TIMEOUT_SECS,
            run_timeout_secs: None,
        }
    }
}

impl PipelineConfig {
    /// Load a JSON configuration file. Missing fields take their defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            PipelineError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        let config: PipelineConfig = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings that would make a run meaningless.
    pub fn validate(&self) -> Result<()> {
        self.trigger.validate().map_err(PipelineError::Config)?;
        self.toolchain.validate().map_err(PipelineError::Config)?;
        self.instrumentation
            .validate()
            .map_err(PipelineError::Config)?;
        self.aggregation.validate().map_err(PipelineError::Config)?;
        if self.publish.base_url.trim().is_empty() {
            return Err(PipelineError::Config("publish base URL is empty".to_string()));
        }
        if self.run_timeout_secs == Some(0) {
            return Err(PipelineError::Config(
                "run timeout must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_defaults_are_valid() {
        let config = PipelineConfig::default();
        config.validate().expect("defaults should validate");
        assert_eq!(config.toolchain.channel, "nightly");
        assert!(config.toolchain.components.contains("llvm-tools-preview"));
        assert_eq!(config.aggregation.excludes, vec!["/*", "tests/*"]);
        assert_eq!(config.publish.token_env, "CODECOV_TOKEN");
    }

    #[test]
    fn test_partial_file_overrides() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("covflow.json");
        std::fs::write(
            &path,
            r#"{
                "toolchain": { "channel": "nightly-2024-05-01" },
                "aggregation": { "excludes": ["tests/*", "benches/*"] },
                "run_timeout_secs": 3600
            }"#,
        )
        .unwrap();

        let config = PipelineConfig::from_file(&path).unwrap();
        assert_eq!(config.toolchain.channel, "nightly-2024-05-01");
        assert_eq!(config.toolchain.instrumentation_tool, "grcov");
        assert_eq!(config.aggregation.excludes, vec!["tests/*", "benches/*"]);
        assert_eq!(config.aggregation.report_path, Path::new("lcov.info"));
        assert_eq!(config.run_timeout_secs, Some(3600));
    }

    #[test]
    fn test_invalid_pattern_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("covflow.json");
        std::fs::write(
            &path,
            r#"{ "instrumentation": { "profile_file_pattern": "cov.profraw" } }"#,
        )
        .unwrap();

        let err = PipelineConfig::from_file(&path).unwrap_err();
        assert!(matches!(err, PipelineError::Config(_)));
    }

    #[test]
    fn test_missing_file() {
        let err = PipelineConfig::from_file(Path::new("/nonexistent/covflow.json")).unwrap_err();
        assert!(matches!(err, PipelineError::Config(_)));
    }
}
