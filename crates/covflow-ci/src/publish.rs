//! Report upload to the coverage-tracking service.

use crate::context::RunContext;
use crate::coverage::CoverageReport;
use crate::credential::PublishCredential;
use crate::error::{PipelineError, Result};
use async_trait::async_trait;
use reqwest::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info};

/// Upload settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PublishConfig {
    /// Base URL of the Codecov-compatible service.
    pub base_url: String,

    /// Environment variable holding the upload token.
    pub token_env: String,

    /// Flags attached to the upload (e.g. `unittests`).
    pub flags: Vec<String>,

    /// Optional upload name.
    pub name: Option<String>,

    /// Per-request timeout in seconds.
    pub timeout_secs: u64,
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            base_url: "https://codecov.io".to_string(),
            token_env: "CODECOV_TOKEN".to_string(),
            flags: Vec::new(),
            name: None,
            timeout_secs: 60,
        }
    }
}

/// Outcome of a successful upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishReceipt {
    /// Dashboard URL for the uploaded report, when the service returns one.
    pub report_url: Option<String>,

    /// Size of the uploaded body.
    pub bytes: usize,
}

/// Sends a finished report to a coverage-tracking service.
///
/// The report is taken by value: once handed over it cannot be published
/// again, and a failed upload is not retried with it.
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(
        &self,
        report: CoverageReport,
        credential: &PublishCredential,
        context: &RunContext,
    ) -> Result<PublishReceipt>;
}

/// Uploads through the Codecov v4 protocol.
///
/// `POST {base}/upload/v4?commit=…` answers with two lines, the dashboard
/// URL and a pre-signed storage URL; the report body is then `PUT` to the
/// storage URL.
pub struct CodecovPublisher {
    client: reqwest::Client,
    config: PublishConfig,
}

impl CodecovPublisher {
    pub fn new(config: PublishConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("covflow/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self { client, config })
    }

    /// The upload request URL for `context`. The token is never part of it.
    pub fn upload_url(&self, context: &RunContext) -> Result<Url> {
        let endpoint = format!("{}/upload/v4", self.config.base_url.trim_end_matches('/'));

        let mut params: Vec<(&str, String)> = vec![
            ("package", concat!("covflow-", env!("CARGO_PKG_VERSION")).to_string()),
            ("commit", context.commit.clone()),
            ("build", context.run_id.clone()),
            ("service", context.service.clone()),
        ];
        if let Some(branch) = &context.branch {
            params.push(("branch", branch.clone()));
        }
        if let Some(slug) = &context.repository {
            params.push(("slug", slug.clone()));
        }
        if let Some(pr) = context.pull_request {
            params.push(("pr", pr.to_string()));
        }
        if !self.config.flags.is_empty() {
            params.push(("flags", self.config.flags.join(",")));
        }
        if let Some(name) = &self.config.name {
            params.push(("name", name.clone()));
        }

        Url::parse_with_params(&endpoint, &params)
            .map_err(|e| PipelineError::Config(format!("invalid upload URL {endpoint}: {e}")))
    }
}

#[async_trait]
impl Publisher for CodecovPublisher {
    async fn publish(
        &self,
        report: CoverageReport,
        credential: &PublishCredential,
        context: &RunContext,
    ) -> Result<PublishReceipt> {
        let body = report.render();
        drop(report);

        let url = self.upload_url(context)?;
        debug!(endpoint = %url.path(), commit = %context.commit, "Requesting upload slot");

        let response = self
            .client
            .post(url)
            .header(AUTHORIZATION, format!("token {}", credential.expose()))
            .header(ACCEPT, "text/plain")
            .send()
            .await?;
        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            return Err(PipelineError::Publish(format!(
                "upload request rejected with {status}: {}",
                truncate(&text, 200)
            )));
        }
        let (report_url, storage_url) = parse_upload_response(&text)?;

        let bytes = body.len();
        let response = self
            .client
            .put(storage_url)
            .header(CONTENT_TYPE, "text/plain")
            .body(body)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(PipelineError::Publish(format!(
                "report upload rejected with {status}"
            )));
        }

        info!(
            commit = %context.commit,
            bytes,
            report_url = report_url.as_deref().unwrap_or("-"),
            "Coverage report published"
        );
        Ok(PublishReceipt { report_url, bytes })
    }
}

/// Split a v4 upload response into (dashboard URL, storage URL).
fn parse_upload_response(text: &str) -> Result<(Option<String>, Url)> {
    let lines: Vec<&str> = text
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect();
    let (report_url, storage) = match lines.as_slice() {
        [report, storage, ..] => (Some(report.to_string()), *storage),
        _ => {
            return Err(PipelineError::Publish(format!(
                "unexpected upload response: {}",
                truncate(text, 200)
            )))
        }
    };
    let storage_url = Url::parse(storage)
        .map_err(|e| PipelineError::Publish(format!("invalid storage URL in response: {e}")))?;
    Ok((report_url, storage_url))
}

fn truncate(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}
