//! Trigger evaluation: decides whether an incoming event starts a run.

use globset::Glob;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of event reported by the CI platform.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Push,
    PullRequest,
    /// Any other event name (`schedule`, `workflow_dispatch`, ...).
    Other(String),
}

impl EventKind {
    /// Parse a CI platform event name such as `push` or `pull_request`.
    pub fn parse(name: &str) -> Self {
        match name.trim() {
            "push" => EventKind::Push,
            "pull_request" => EventKind::PullRequest,
            other => EventKind::Other(other.to_string()),
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventKind::Push => f.write_str("push"),
            EventKind::PullRequest => f.write_str("pull_request"),
            EventKind::Other(name) => f.write_str(name),
        }
    }
}

/// An event that may start a pipeline run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunEvent {
    pub kind: EventKind,

    /// Branch name or full git ref (`refs/heads/main`, `refs/pull/7/merge`).
    pub git_ref: String,
}

impl RunEvent {
    pub fn new(kind: EventKind, git_ref: impl Into<String>) -> Self {
        Self {
            kind,
            git_ref: git_ref.into(),
        }
    }

    /// Shorthand for a push to `branch`.
    pub fn push(branch: impl Into<String>) -> Self {
        Self::new(EventKind::Push, branch)
    }

    /// Shorthand for a pull request event on `git_ref`.
    pub fn pull_request(git_ref: impl Into<String>) -> Self {
        Self::new(EventKind::PullRequest, git_ref)
    }
}

/// What a ref points at once the `refs/...` prefix is interpreted.
#[derive(Debug, Clone, PartialEq, Eq)]
enum RefTarget<'a> {
    Branch(&'a str),
    Tag(&'a str),
    PullRequest(&'a str),
}

fn classify_ref(git_ref: &str) -> RefTarget<'_> {
    if let Some(branch) = git_ref.strip_prefix("refs/heads/") {
        RefTarget::Branch(branch)
    } else if let Some(tag) = git_ref.strip_prefix("refs/tags/") {
        RefTarget::Tag(tag)
    } else if let Some(pr) = git_ref.strip_prefix("refs/pull/") {
        RefTarget::PullRequest(pr)
    } else {
        RefTarget::Branch(git_ref)
    }
}

/// Branch filters for each event kind.
///
/// Patterns are globs where `*` also matches `/`, so the default `*`
/// accepts every branch name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TriggerRules {
    /// Branch patterns that start a run on push.
    pub push_branches: Vec<String>,

    /// Ref patterns that start a run on pull request.
    pub pull_request_refs: Vec<String>,
}

impl Default for TriggerRules {
    fn default() -> Self {
        Self {
            push_branches: vec!["*".to_string()],
            pull_request_refs: vec!["*".to_string()],
        }
    }
}

impl TriggerRules {
    /// Decide whether `event` starts a run.
    ///
    /// Pure: an event no rule matches yields `false`, never an error. Tag
    /// pushes are not branch pushes and never match the push rule.
    pub fn should_run(&self, event: &RunEvent) -> bool {
        match event.kind {
            EventKind::Push => match classify_ref(&event.git_ref) {
                RefTarget::Branch(branch) => matches_any(&self.push_branches, branch),
                RefTarget::Tag(_) | RefTarget::PullRequest(_) => false,
            },
            EventKind::PullRequest => {
                let target = match classify_ref(&event.git_ref) {
                    RefTarget::Branch(name) | RefTarget::Tag(name) => name,
                    RefTarget::PullRequest(_) => event.git_ref.as_str(),
                };
                matches_any(&self.pull_request_refs, target)
            }
            EventKind::Other(_) => false,
        }
    }

    /// Check that every pattern compiles.
    pub fn validate(&self) -> Result<(), String> {
        for pattern in self.push_branches.iter().chain(&self.pull_request_refs) {
            Glob::new(pattern).map_err(|e| format!("invalid trigger pattern `{pattern}`: {e}"))?;
        }
        Ok(())
    }
}

fn matches_any(patterns: &[String], candidate: &str) -> bool {
    patterns.iter().any(|pattern| {
        Glob::new(pattern)
            .map(|glob| glob.compile_matcher().is_match(candidate))
            .unwrap_or(false)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const BRANCHES: &[&str] = &[
        "main",
        "develop",
        "feature/coverage",
        "release/v1.2/hotfix",
        "refs/heads/main",
        "refs/heads/feature/deeply/nested",
        "x",
        "with spaces",
        "",
    ];

    #[test]
    fn test_push_runs_on_any_branch() {
        let rules = TriggerRules::default();
        for branch in BRANCHES {
            assert!(
                rules.should_run(&RunEvent::push(*branch)),
                "push to {branch:?} should run"
            );
        }
    }

    #[test]
    fn test_pull_request_runs_on_any_ref() {
        let rules = TriggerRules::default();
        for git_ref in BRANCHES.iter().chain(&["refs/pull/42/merge"]) {
            assert!(
                rules.should_run(&RunEvent::pull_request(*git_ref)),
                "pull request on {git_ref:?} should run"
            );
        }
    }

    #[test]
    fn test_other_events_do_not_run() {
        let rules = TriggerRules::default();
        let event = RunEvent::new(EventKind::parse("schedule"), "main");
        assert!(!rules.should_run(&event));
    }

    #[test]
    fn test_tag_push_does_not_run() {
        let rules = TriggerRules::default();
        assert!(!rules.should_run(&RunEvent::push("refs/tags/v1.0.0")));
    }

    #[test]
    fn test_restricted_push_rules() {
        let rules = TriggerRules {
            push_branches: vec!["main".to_string(), "release/*".to_string()],
            ..TriggerRules::default()
        };
        assert!(rules.should_run(&RunEvent::push("refs/heads/main")));
        assert!(rules.should_run(&RunEvent::push("release/1.0")));
        assert!(!rules.should_run(&RunEvent::push("feature/x")));
    }

    #[test]
    fn test_empty_rules_never_run() {
        let rules = TriggerRules {
            push_branches: vec![],
            pull_request_refs: vec![],
        };
        assert!(!rules.should_run(&RunEvent::push("main")));
        assert!(!rules.should_run(&RunEvent::pull_request("main")));
    }

    #[test]
    fn test_event_kind_parse() {
        assert_eq!(EventKind::parse("push"), EventKind::Push);
        assert_eq!(EventKind::parse("pull_request"), EventKind::PullRequest);
        assert_eq!(
            EventKind::parse("workflow_dispatch"),
            EventKind::Other("workflow_dispatch".to_string())
        );
        assert_eq!(EventKind::PullRequest.to_string(), "pull_request");
    }

    #[test]
    fn test_validate_rejects_bad_glob() {
        let rules = TriggerRules {
            push_branches: vec!["feature/[".to_string()],
            ..TriggerRules::default()
        };
        assert!(rules.validate().is_err());
        assert!(TriggerRules::default().validate().is_ok());
    }
}
