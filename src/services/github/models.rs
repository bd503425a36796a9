//! Wire models for the subset of the GitHub REST API the daemon consumes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A label attached to an issue or pull request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Label {
    pub name: String,
}

/// The author of an issue or comment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub login: String,
}

/// An issue as returned by the issues listing endpoint.
///
/// The listing endpoint also returns pull requests; those entries carry a
/// `pull_request` key and are filtered out by [`Issue::is_pull_request`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Issue {
    pub number: u64,
    pub title: String,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub labels: Vec<Label>,
    pub state: String,
    pub user: Option<User>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pull_request: Option<serde_json::Value>,
}

impl Issue {
    /// Whether this listing entry is actually a pull request.
    pub fn is_pull_request(&self) -> bool {
        self.pull_request.is_some()
    }

    /// Label names as plain strings.
    pub fn label_names(&self) -> Vec<String> {
        self.labels.iter().map(|l| l.name.clone()).collect()
    }
}

/// A comment on an issue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Comment {
    pub id: u64,
    #[serde(default)]
    pub body: Option<String>,
    pub user: Option<User>,
    pub created_at: Option<DateTime<Utc>>,
}

/// An open pull request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PullRequest {
    pub number: u64,
    pub title: String,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub draft: bool,
    #[serde(default)]
    pub labels: Vec<Label>,
    pub head: Option<GitRef>,
    pub base: Option<GitRef>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Head or base reference of a pull request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GitRef {
    #[serde(rename = "ref")]
    pub ref_name: String,
}

/// One changed file in a pull request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrFile {
    pub filename: String,
    pub status: String,
    #[serde(default)]
    pub additions: u64,
    #[serde(default)]
    pub deletions: u64,
}

/// One commit in a pull request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrCommit {
    pub sha: String,
    pub commit: CommitDetail,
}

/// Commit metadata nested inside a pull-request commit entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommitDetail {
    pub message: String,
}

/// Remaining core-API budget as reported by the rate-limit endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RateBudget {
    pub limit: u32,
    pub remaining: u32,
    /// Unix epoch seconds at which the budget resets
    pub reset: i64,
}

impl RateBudget {
    /// Reset instant as a timestamp.
    pub fn reset_at(&self) -> DateTime<Utc> {
        chrono::TimeZone::timestamp_opt(&Utc, self.reset, 0)
            .single()
            .unwrap_or_else(Utc::now)
    }
}

/// Review verdict posted on a pull request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReviewEvent {
    Approve,
    RequestChanges,
    Comment,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_issue_listing_distinguishes_prs() {
        let raw = serde_json::json!({
            "number": 7,
            "title": "a pr in disguise",
            "state": "open",
            "labels": [],
            "user": {"login": "octocat"},
            "pull_request": {"url": "https://example.invalid/pulls/7"}
        });
        let issue: Issue = serde_json::from_value(raw).unwrap();
        assert!(issue.is_pull_request());
    }

    #[test]
    fn test_review_event_serializes_screaming() {
        assert_eq!(
            serde_json::to_string(&ReviewEvent::RequestChanges).unwrap(),
            "\"REQUEST_CHANGES\""
        );
    }

    #[test]
    fn test_label_names() {
        let issue = Issue {
            number: 1,
            title: "t".into(),
            body: None,
            labels: vec![Label { name: "task:bug".into() }, Label { name: "urgent".into() }],
            state: "open".into(),
            user: None,
            created_at: None,
            updated_at: None,
            pull_request: None,
        };
        assert_eq!(issue.label_names(), vec!["task:bug", "urgent"]);
    }
}
