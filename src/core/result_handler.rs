//! Validates, persists, and fans out task outcomes.
//!
//! Every terminal task outcome flows through here exactly once: the
//! envelope is validated (malformed records are archived, the pipeline
//! continues), persisted under `results/`, counted, and reported upstream
//! as at most one comment or review. Follow-up actions declared in the
//! result are dispatched against a bounded set of typed operations.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use crate::config::{ProjectConfig, RateLimitConfig};
use crate::core::queue::TaskQueue;
use crate::core::state::StateStore;
use crate::core::task::{CustomPayload, FollowUpAction, Task, TaskKind, TaskOutcome};
use crate::error::RepoPilotError;
use crate::services::github::{GitHubClient, ReviewEvent};
use crate::Result;

/// Outputs beyond this size are rejected as malformed.
const MAX_OUTPUT_BYTES: usize = 10 * 1024 * 1024;
/// Outputs beyond this size are moved to a side file.
const OVERFLOW_BYTES: usize = 1024 * 1024;
/// Upstream posts are retried this many times before giving up.
const UPSTREAM_ATTEMPTS: u32 = 3;

/// Persisted result record written under `results/`.
#[derive(Debug, Serialize, Deserialize)]
struct ResultRecord {
    task_id: String,
    project_id: String,
    issue_number: u64,
    kind: String,
    success: bool,
    exit_code: i32,
    stdout: String,
    stderr: String,
    attempts: u32,
    completed_at: chrono::DateTime<Utc>,
}

/// Optional structured analysis the AI tool may emit on stdout.
#[derive(Debug, Default, Deserialize)]
struct StdoutAnalysis {
    #[serde(default)]
    approve: bool,
    #[serde(default)]
    must_fix: Vec<String>,
    #[serde(default)]
    follow_up_actions: Vec<FollowUpAction>,
}

fn parse_analysis(stdout: &str) -> StdoutAnalysis {
    serde_json::from_str(stdout.trim()).unwrap_or_default()
}

/// Per-project, per-kind outcome counters.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ResultCounters {
    pub per_project: HashMap<String, HashMap<String, u64>>,
}

/// Retires tasks: persistence, counters, upstream reporting, follow-ups.
pub struct ResultHandler {
    github: Arc<dyn GitHubClient>,
    queue: Arc<TaskQueue>,
    store: Arc<StateStore>,
    repos: Mutex<HashMap<String, (String, String)>>,
    counters: Mutex<ResultCounters>,
    retry: RateLimitConfig,
}

impl ResultHandler {
    /// Build a handler over the shared collaborators.
    pub fn new(
        github: Arc<dyn GitHubClient>,
        queue: Arc<TaskQueue>,
        store: Arc<StateStore>,
        retry: RateLimitConfig,
    ) -> Self {
        Self {
            github,
            queue,
            store,
            repos: Mutex::new(HashMap::new()),
            counters: Mutex::new(ResultCounters::default()),
            retry,
        }
    }

    /// Teach the handler where a project lives upstream.
    pub fn register_project(&self, project: &ProjectConfig) {
        self.repos.lock().unwrap().insert(
            project.id.clone(),
            (project.owner.clone(), project.repo.clone()),
        );
    }

    /// Snapshot of the outcome counters.
    pub fn counters(&self) -> ResultCounters {
        self.counters.lock().unwrap().clone()
    }

    /// Process one terminal outcome.
    ///
    /// Validation failures archive the record and return an error; every
    /// other upstream hiccup is logged and swallowed so the task itself
    /// is never re-failed by reporting problems.
    pub async fn handle(&self, task: &Task, outcome: &TaskOutcome) -> Result<()> {
        if let Err(e) = self.validate(outcome) {
            self.archive(task, outcome)?;
            return Err(e);
        }

        self.persist(task, outcome)?;
        self.count(task, outcome);
        self.report_upstream(task, outcome).await;
        self.dispatch_follow_ups(task, outcome).await;
        self.store.mark_issue_processed(task.issue_ref()).await?;
        Ok(())
    }

    fn validate(&self, outcome: &TaskOutcome) -> Result<()> {
        if outcome.stdout.len() + outcome.stderr.len() > MAX_OUTPUT_BYTES {
            return Err(RepoPilotError::validation(format!(
                "output exceeds {} bytes",
                MAX_OUTPUT_BYTES
            )));
        }
        if outcome.success && outcome.exit_code != 0 {
            return Err(RepoPilotError::validation(format!(
                "success envelope with exit code {}",
                outcome.exit_code
            )));
        }
        Ok(())
    }

    fn record_for(&self, task: &Task, outcome: &TaskOutcome) -> ResultRecord {
        ResultRecord {
            task_id: task.id.clone(),
            project_id: task.project_id.clone(),
            issue_number: task.issue_number,
            kind: task.kind.name().to_string(),
            success: outcome.success,
            exit_code: outcome.exit_code,
            stdout: outcome.stdout.clone(),
            stderr: outcome.stderr.clone(),
            attempts: task.attempts,
            completed_at: outcome.completed_at,
        }
    }

    fn persist(&self, task: &Task, outcome: &TaskOutcome) -> Result<()> {
        let bucket = if outcome.success { "success" } else { "error" };
        let dir = self.store.results_dir().join(bucket);
        let mut record = self.record_for(task, outcome);

        if record.stdout.len() > OVERFLOW_BYTES {
            let side_path = dir.join(format!("{}.out", task.id));
            StateStore::atomic_write(&side_path, record.stdout.as_bytes())?;
            record.stdout = format!("<{} bytes moved to {}.out>", record.stdout.len(), task.id);
        }

        let path = dir.join(format!("{}.json", task.id));
        StateStore::atomic_write(&path, &serde_json::to_vec_pretty(&record)?)?;
        Ok(())
    }

    fn archive(&self, task: &Task, outcome: &TaskOutcome) -> Result<()> {
        let mut record = self.record_for(task, outcome);
        record.stdout.truncate(OVERFLOW_BYTES);
        record.stderr.truncate(OVERFLOW_BYTES);
        let path = self
            .store
            .results_dir()
            .join("archive")
            .join(format!("{}.json", task.id));
        StateStore::atomic_write(&path, &serde_json::to_vec_pretty(&record)?)?;
        log::warn!("archived malformed result for task {}", task.id);
        Ok(())
    }

    fn count(&self, task: &Task, outcome: &TaskOutcome) {
        let mut counters = self.counters.lock().unwrap();
        let per_kind = counters
            .per_project
            .entry(task.project_id.clone())
            .or_default();
        let key = format!(
            "{}:{}",
            task.kind.name(),
            if outcome.success { "success" } else { "error" }
        );
        *per_kind.entry(key).or_insert(0) += 1;
    }

    fn repo_for(&self, project_id: &str) -> Option<(String, String)> {
        self.repos.lock().unwrap().get(project_id).cloned()
    }

    async fn report_upstream(&self, task: &Task, outcome: &TaskOutcome) {
        let Some((owner, repo)) = self.repo_for(&task.project_id) else {
            log::warn!("no upstream repo known for project {}", task.project_id);
            return;
        };

        match &task.kind {
            TaskKind::Issue(_) | TaskKind::Comment(_) | TaskKind::Custom(_) => {
                let body = comment_body(task, outcome);
                self.with_retry("create comment", || {
                    self.github
                        .create_comment(&owner, &repo, task.issue_number, &body)
                })
                .await;
                self.toggle_labels(&owner, &repo, task, outcome.success).await;
            }
            TaskKind::PrReview(_) => {
                let analysis = parse_analysis(&outcome.stdout);
                let event = review_event(outcome, &analysis);
                let body = review_body(outcome, &analysis);
                self.with_retry("create review", || {
                    self.github
                        .create_review(&owner, &repo, task.issue_number, event, &body)
                })
                .await;
            }
        }
    }

    async fn toggle_labels(&self, owner: &str, repo: &str, task: &Task, success: bool) {
        self.with_retry("remove processing label", || {
            self.github
                .remove_label(owner, repo, task.issue_number, "processing")
        })
        .await;
        if success {
            let completed = vec!["completed".to_string()];
            self.with_retry("add completed label", || {
                self.github
                    .add_labels(owner, repo, task.issue_number, &completed)
            })
            .await;
        }
    }

    async fn dispatch_follow_ups(&self, task: &Task, outcome: &TaskOutcome) {
        let mut actions = outcome.follow_up_actions.clone();
        actions.extend(parse_analysis(&outcome.stdout).follow_up_actions);

        for action in actions {
            match action.action.as_str() {
                "create-task" => {
                    let name = action.data["name"].as_str().unwrap_or("follow-up").to_string();
                    let issue_number = action.data["issue_number"]
                        .as_u64()
                        .unwrap_or(task.issue_number);
                    let follow_up = Task::new(
                        &task.project_id,
                        issue_number,
                        TaskKind::Custom(CustomPayload {
                            name,
                            data: action.data.clone(),
                        }),
                        task.base_priority,
                    );
                    match self.queue.enqueue(follow_up) {
                        Ok(id) => log::info!("follow-up task {} enqueued", id),
                        Err(e) => log::warn!("follow-up task rejected: {}", e),
                    }
                }
                "update-issue" => {
                    let Some((owner, repo)) = self.repo_for(&task.project_id) else {
                        continue;
                    };
                    let labels: Vec<String> = action.data["add_labels"]
                        .as_array()
                        .map(|a| {
                            a.iter()
                                .filter_map(|v| v.as_str().map(str::to_string))
                                .collect()
                        })
                        .unwrap_or_default();
                    if !labels.is_empty() {
                        self.with_retry("follow-up labels", || {
                            self.github
                                .add_labels(&owner, &repo, task.issue_number, &labels)
                        })
                        .await;
                    }
                }
                "notify" => {
                    // Notification dispatchers live outside the core
                    log::info!(
                        "notify requested for task {}: {}",
                        task.id,
                        action.data["message"].as_str().unwrap_or("")
                    );
                }
                other => {
                    log::warn!("unknown follow-up action '{}' ignored", other);
                }
            }
        }
    }

    async fn with_retry<F, Fut>(&self, what: &str, op: F)
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<()>>,
    {
        let mut delay = std::time::Duration::from_millis(self.retry.initial_backoff_ms);
        for attempt in 1..=UPSTREAM_ATTEMPTS {
            match op().await {
                Ok(()) => return,
                Err(e) if attempt < UPSTREAM_ATTEMPTS => {
                    log::warn!("{} failed (attempt {}): {}", what, attempt, e);
                    tokio::time::sleep(delay).await;
                    delay = std::cmp::min(
                        delay.mul_f64(self.retry.multiplier),
                        std::time::Duration::from_millis(self.retry.max_backoff_ms),
                    );
                }
                Err(e) => {
                    // Terminal upstream failure never re-fails the task
                    log::error!("{} failed after {} attempts: {}", what, UPSTREAM_ATTEMPTS, e);
                }
            }
        }
    }
}

fn excerpt(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

fn comment_body(task: &Task, outcome: &TaskOutcome) -> String {
    if outcome.success {
        format!(
            "## Task completed\n\n{}\n\n---\n_{} · attempt {}_",
            excerpt(&outcome.stdout, 60_000),
            task.id,
            task.attempts
        )
    } else {
        let error = task
            .error
            .clone()
            .unwrap_or_else(|| format!("exit code {}", outcome.exit_code));
        format!(
            "## Task failed\n\n```\n{}\n```\n\n---\n_{} · attempt {}_",
            excerpt(&error, 10_000),
            task.id,
            task.attempts
        )
    }
}

fn review_event(outcome: &TaskOutcome, analysis: &StdoutAnalysis) -> ReviewEvent {
    if !analysis.must_fix.is_empty() {
        ReviewEvent::RequestChanges
    } else if outcome.success && analysis.approve {
        ReviewEvent::Approve
    } else {
        ReviewEvent::Comment
    }
}

fn review_body(outcome: &TaskOutcome, analysis: &StdoutAnalysis) -> String {
    let mut body = String::new();
    if analysis.must_fix.is_empty() {
        body.push_str(excerpt(&outcome.stdout, 60_000));
    } else {
        body.push_str("Required changes:\n");
        for item in &analysis.must_fix {
            body.push_str(&format!("- {}\n", item));
        }
    }
    if body.trim().is_empty() {
        body = "Review completed with no further remarks.".to_string();
    }
    body
}
