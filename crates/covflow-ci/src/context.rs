//! Identifying context of a run: repository, commit, branch and run id.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::process::Command;
use uuid::Uuid;

/// Where a report came from, attached to every upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunContext {
    /// `owner/name` slug.
    pub repository: Option<String>,

    /// Full commit SHA.
    pub commit: String,

    /// Branch the commit belongs to (the head branch for pull requests).
    pub branch: Option<String>,

    /// CI run identifier.
    pub run_id: String,

    /// Pull request number, when the run was triggered by one.
    pub pull_request: Option<u64>,

    /// CI service name reported to the tracker.
    pub service: String,
}

impl RunContext {
    /// Context for a run with an explicit commit; other fields empty.
    pub fn new(commit: impl Into<String>) -> Self {
        Self {
            repository: None,
            commit: commit.into(),
            branch: None,
            run_id: Uuid::new_v4().to_string(),
            pull_request: None,
            service: "custom".to_string(),
        }
    }

    pub fn with_repository(mut self, slug: impl Into<String>) -> Self {
        self.repository = Some(slug.into());
        self
    }

    pub fn with_branch(mut self, branch: impl Into<String>) -> Self {
        self.branch = Some(branch.into());
        self
    }

    pub fn with_run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = run_id.into();
        self
    }

    /// Build from GitHub Actions variables looked up through `var`.
    ///
    /// Returns `None` outside GitHub Actions (no `GITHUB_SHA`).
    pub fn from_github<F>(var: F) -> Option<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let commit = var("GITHUB_SHA")?;
        let git_ref = var("GITHUB_REF").unwrap_or_default();
        let pull_request = pull_request_number(&git_ref);

        let branch = var("GITHUB_HEAD_REF")
            .filter(|b| !b.is_empty())
            .or_else(|| var("GITHUB_REF_NAME").filter(|_| pull_request.is_none()))
            .or_else(|| git_ref.strip_prefix("refs/heads/").map(str::to_string));

        Some(Self {
            repository: var("GITHUB_REPOSITORY"),
            commit,
            branch,
            run_id: var("GITHUB_RUN_ID").unwrap_or_else(|| Uuid::new_v4().to_string()),
            pull_request,
            service: "github-actions".to_string(),
        })
    }

    /// Detect the context from the process environment, falling back to
    /// `git` in `work_dir` and a generated run id.
    pub fn detect(work_dir: &Path) -> Self {
        if let Some(ctx) = Self::from_github(|name| std::env::var(name).ok()) {
            return ctx;
        }

        let commit = git(work_dir, &["rev-parse", "HEAD"]).unwrap_or_else(|| "unknown".to_string());
        let mut ctx = RunContext::new(commit);
        ctx.branch = git(work_dir, &["rev-parse", "--abbrev-ref", "HEAD"]).filter(|b| b != "HEAD");
        ctx
    }

    /// Repository slug or `unknown`.
    pub fn slug(&self) -> &str {
        self.repository.as_deref().unwrap_or("unknown")
    }
}

/// `refs/pull/42/merge` → 42.
pub fn pull_request_number(git_ref: &str) -> Option<u64> {
    git_ref
        .strip_prefix("refs/pull/")?
        .split('/')
        .next()?
        .parse()
        .ok()
}

fn git(work_dir: &Path, args: &[&str]) -> Option<String> {
    let output = Command::new("git")
        .args(args)
        .current_dir(work_dir)
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let value = String::from_utf8(output.stdout).ok()?.trim().to_string();
    (!value.is_empty()).then_some(value)
}
