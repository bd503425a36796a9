//! GitHub REST API client.
//!
//! The [`GitHubClient`] trait is the seam between the core and the
//! upstream tracker: the scheduler and result handler hold an
//! `Arc<dyn GitHubClient>`, production wires in [`RestGitHubClient`], and
//! tests substitute a mock. All calls are best-effort with retry handled
//! by the callers; nothing here assumes linearizability across calls.

pub mod models;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION, USER_AGENT};
use reqwest::{Client, Method, StatusCode};
use serde::de::DeserializeOwned;

use crate::error::RepoPilotError;
use crate::Result;
pub use models::{
    Comment, Issue, Label, PrCommit, PrFile, PullRequest, RateBudget, ReviewEvent, User,
};

/// Operations the core consumes from the upstream tracker.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait GitHubClient: Send + Sync {
    /// List open issues, optionally filtered server-side by labels.
    ///
    /// Pull-request entries returned by the issues endpoint are already
    /// filtered out.
    async fn list_open_issues(
        &self,
        owner: &str,
        repo: &str,
        labels: &[String],
    ) -> Result<Vec<Issue>>;

    /// List comments on an issue created at or after `since`.
    async fn list_issue_comments_since(
        &self,
        owner: &str,
        repo: &str,
        issue_number: u64,
        since: DateTime<Utc>,
    ) -> Result<Vec<Comment>>;

    /// List open pull requests.
    async fn list_open_pull_requests(&self, owner: &str, repo: &str) -> Result<Vec<PullRequest>>;

    /// Fetch a single issue.
    async fn get_issue(&self, owner: &str, repo: &str, issue_number: u64) -> Result<Issue>;

    /// Fetch a single pull request.
    async fn get_pull_request(&self, owner: &str, repo: &str, number: u64)
        -> Result<PullRequest>;

    /// List the changed files of a pull request.
    async fn get_pull_request_files(
        &self,
        owner: &str,
        repo: &str,
        number: u64,
    ) -> Result<Vec<PrFile>>;

    /// List the commits of a pull request.
    async fn get_pull_request_commits(
        &self,
        owner: &str,
        repo: &str,
        number: u64,
    ) -> Result<Vec<PrCommit>>;

    /// Add labels to an issue.
    async fn add_labels(
        &self,
        owner: &str,
        repo: &str,
        issue_number: u64,
        labels: &[String],
    ) -> Result<()>;

    /// Remove one label from an issue. Missing labels are not an error.
    async fn remove_label(
        &self,
        owner: &str,
        repo: &str,
        issue_number: u64,
        label: &str,
    ) -> Result<()>;

    /// Create a comment on an issue.
    async fn create_comment(
        &self,
        owner: &str,
        repo: &str,
        issue_number: u64,
        body: &str,
    ) -> Result<()>;

    /// Create a pull-request review with the given event and body.
    async fn create_review(
        &self,
        owner: &str,
        repo: &str,
        number: u64,
        event: ReviewEvent,
        body: &str,
    ) -> Result<()>;

    /// Probe the remaining core-API budget.
    async fn rate_limit(&self) -> Result<RateBudget>;
}

/// Production client talking to the GitHub REST API over HTTPS.
#[derive(Debug, Clone)]
pub struct RestGitHubClient {
    client: Client,
    base_url: String,
}

impl RestGitHubClient {
    /// Build a client for the given base URL and optional token.
    pub fn new(base_url: &str, token: Option<&str>) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(USER_AGENT, HeaderValue::from_static("repopilot"));
        headers.insert(
            ACCEPT,
            HeaderValue::from_static("application/vnd.github+json"),
        );
        if let Some(token) = token {
            let value = HeaderValue::from_str(&format!("Bearer {}", token))
                .map_err(|_| RepoPilotError::config("github.token contains invalid characters"))?;
            headers.insert(AUTHORIZATION, value);
        }
        let client = Client::builder()
            .default_headers(headers)
            .timeout(std::time::Duration::from_secs(30))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn request<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> Result<T> {
        let url = format!("{}{}", self.base_url, path);
        let mut request = self.client.request(method, &url);
        if let Some(body) = body {
            request = request.json(&body);
        }
        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(RepoPilotError::GitHubApi {
                message: format!("{} {}: {}", status.as_u16(), path, truncate(&message, 300)),
                status: Some(status.as_u16()),
            });
        }
        if status == StatusCode::NO_CONTENT {
            // Endpoints returning 204 have no body to deserialize
            return serde_json::from_value(serde_json::Value::Null).map_err(Into::into);
        }
        Ok(response.json::<T>().await?)
    }

    async fn request_unit(
        &self,
        method: Method,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> Result<()> {
        let url = format!("{}{}", self.base_url, path);
        let mut request = self.client.request(method, &url);
        if let Some(body) = body {
            request = request.json(&body);
        }
        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(RepoPilotError::GitHubApi {
                message: format!("{} {}: {}", status.as_u16(), path, truncate(&message, 300)),
                status: Some(status.as_u16()),
            });
        }
        Ok(())
    }
}

fn truncate(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

#[async_trait]
impl GitHubClient for RestGitHubClient {
    async fn list_open_issues(
        &self,
        owner: &str,
        repo: &str,
        labels: &[String],
    ) -> Result<Vec<Issue>> {
        let mut path = format!("/repos/{}/{}/issues?state=open&per_page=100", owner, repo);
        if !labels.is_empty() {
            path.push_str(&format!("&labels={}", labels.join(",")));
        }
        let issues: Vec<Issue> = self.request(Method::GET, &path, None).await?;
        Ok(issues.into_iter().filter(|i| !i.is_pull_request()).collect())
    }

    async fn list_issue_comments_since(
        &self,
        owner: &str,
        repo: &str,
        issue_number: u64,
        since: DateTime<Utc>,
    ) -> Result<Vec<Comment>> {
        let path = format!(
            "/repos/{}/{}/issues/{}/comments?since={}&per_page=100",
            owner,
            repo,
            issue_number,
            since.to_rfc3339()
        );
        self.request(Method::GET, &path, None).await
    }

    async fn list_open_pull_requests(&self, owner: &str, repo: &str) -> Result<Vec<PullRequest>> {
        let path = format!("/repos/{}/{}/pulls?state=open&per_page=100", owner, repo);
        self.request(Method::GET, &path, None).await
    }

    async fn get_issue(&self, owner: &str, repo: &str, issue_number: u64) -> Result<Issue> {
        let path = format!("/repos/{}/{}/issues/{}", owner, repo, issue_number);
        self.request(Method::GET, &path, None).await
    }

    async fn get_pull_request(
        &self,
        owner: &str,
        repo: &str,
        number: u64,
    ) -> Result<PullRequest> {
        let path = format!("/repos/{}/{}/pulls/{}", owner, repo, number);
        self.request(Method::GET, &path, None).await
    }

    async fn get_pull_request_files(
        &self,
        owner: &str,
        repo: &str,
        number: u64,
    ) -> Result<Vec<PrFile>> {
        let path = format!("/repos/{}/{}/pulls/{}/files?per_page=100", owner, repo, number);
        self.request(Method::GET, &path, None).await
    }

    async fn get_pull_request_commits(
        &self,
        owner: &str,
        repo: &str,
        number: u64,
    ) -> Result<Vec<PrCommit>> {
        let path = format!(
            "/repos/{}/{}/pulls/{}/commits?per_page=100",
            owner, repo, number
        );
        self.request(Method::GET, &path, None).await
    }

    async fn add_labels(
        &self,
        owner: &str,
        repo: &str,
        issue_number: u64,
        labels: &[String],
    ) -> Result<()> {
        let path = format!("/repos/{}/{}/issues/{}/labels", owner, repo, issue_number);
        self.request_unit(
            Method::POST,
            &path,
            Some(serde_json::json!({ "labels": labels })),
        )
        .await
    }

    async fn remove_label(
        &self,
        owner: &str,
        repo: &str,
        issue_number: u64,
        label: &str,
    ) -> Result<()> {
        let path = format!(
            "/repos/{}/{}/issues/{}/labels/{}",
            owner, repo, issue_number, label
        );
        match self.request_unit(Method::DELETE, &path, None).await {
            Ok(()) => Ok(()),
            // Removing an absent label is not an error worth surfacing
            Err(RepoPilotError::GitHubApi {
                status: Some(404), ..
            }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn create_comment(
        &self,
        owner: &str,
        repo: &str,
        issue_number: u64,
        body: &str,
    ) -> Result<()> {
        let path = format!("/repos/{}/{}/issues/{}/comments", owner, repo, issue_number);
        self.request_unit(Method::POST, &path, Some(serde_json::json!({ "body": body })))
            .await
    }

    async fn create_review(
        &self,
        owner: &str,
        repo: &str,
        number: u64,
        event: ReviewEvent,
        body: &str,
    ) -> Result<()> {
        let path = format!("/repos/{}/{}/pulls/{}/reviews", owner, repo, number);
        self.request_unit(
            Method::POST,
            &path,
            Some(serde_json::json!({ "event": event, "body": body })),
        )
        .await
    }

    async fn rate_limit(&self) -> Result<RateBudget> {
        #[derive(serde::Deserialize)]
        struct Resources {
            core: RateBudget,
        }
        #[derive(serde::Deserialize)]
        struct Envelope {
            resources: Resources,
        }
        let envelope: Envelope = self.request(Method::GET, "/rate_limit", None).await?;
        Ok(envelope.resources.core)
    }
}

// HTTP-level tests against a wiremock server
#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_json, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn client_for(server: &MockServer) -> RestGitHubClient {
        RestGitHubClient::new(&server.uri(), Some("test-token")).unwrap()
    }

    #[tokio::test]
    async fn test_list_open_issues_filters_pull_requests() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/repos/octo/demo/issues"))
            .and(query_param("labels", "task:bug"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
                {"number": 1, "title": "real issue", "state": "open", "labels": []},
                {"number": 2, "title": "pr", "state": "open", "labels": [],
                 "pull_request": {"url": "x"}}
            ])))
            .mount(&server)
            .await;

        let client = client_for(&server).await;
        let issues = client
            .list_open_issues("octo", "demo", &["task:bug".to_string()])
            .await
            .unwrap();
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].number, 1);
    }

    #[tokio::test]
    async fn test_error_status_maps_to_github_api_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/repos/octo/demo/issues/5"))
            .respond_with(ResponseTemplate::new(403).set_body_string("rate limited"))
            .mount(&server)
            .await;

        let client = client_for(&server).await;
        let err = client.get_issue("octo", "demo", 5).await.unwrap_err();
        match err {
            RepoPilotError::GitHubApi { status, message } => {
                assert_eq!(status, Some(403));
                assert!(message.contains("rate limited"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_create_review_posts_event() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/repos/octo/demo/pulls/3/reviews"))
            .and(body_json(serde_json::json!({
                "event": "COMMENT",
                "body": "looks plausible"
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"id": 1})))
            .mount(&server)
            .await;

        let client = client_for(&server).await;
        client
            .create_review("octo", "demo", 3, ReviewEvent::Comment, "looks plausible")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_remove_absent_label_is_ok() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/repos/octo/demo/issues/9/labels/processing"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let client = client_for(&server).await;
        client
            .remove_label("octo", "demo", 9, "processing")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_rate_limit_probe() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/rate_limit"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "resources": {"core": {"limit": 5000, "remaining": 4321, "reset": 1700000000}}
            })))
            .mount(&server)
            .await;

        let client = client_for(&server).await;
        let budget = client.rate_limit().await.unwrap();
        assert_eq!(budget.remaining, 4_321);
        assert_eq!(budget.reset_at().timestamp(), 1_700_000_000);
    }
}
