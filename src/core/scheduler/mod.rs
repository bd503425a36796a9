//! Per-project polling and task discovery.
//!
//! Each enabled project gets its own poller task that periodically lists
//! open issues (and optionally recent comments and open pull requests),
//! filters them through the project's label rules, derives priority and
//! deadline, and enqueues the survivors. Discovery errors back off
//! exponentially per project and reset on the next successful poll.

pub mod discovery;

use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;

use crate::config::{DefaultsConfig, ProjectConfig, RateLimitConfig, SchedulingConfig};
use crate::core::queue::{EnqueueError, TaskQueue};
use crate::core::rate_limit::RateLimiter;
use crate::core::state::StateStore;
use crate::core::task::{
    CommentPayload, IssuePayload, IssueRef, PrPayload, Task, TaskKind,
};
use crate::services::github::{GitHubClient, Issue, PullRequest};
use crate::Result;
use discovery::KindTag;

/// Shared dependencies handed to every poller.
pub struct SchedulerContext {
    pub github: Arc<dyn GitHubClient>,
    pub queue: Arc<TaskQueue>,
    pub store: Arc<StateStore>,
    pub limiter: Arc<RateLimiter>,
    pub defaults: DefaultsConfig,
    pub bounds: SchedulingConfig,
    pub rate: RateLimitConfig,
    /// Minimum GitHub budget a poll requires before touching the API
    pub min_remaining_calls: u32,
}

/// One project's polling loop state.
pub struct ProjectPoller {
    project: ProjectConfig,
    ctx: Arc<SchedulerContext>,
    error_count: u32,
}

impl ProjectPoller {
    /// Build a poller for one project.
    pub fn new(project: ProjectConfig, ctx: Arc<SchedulerContext>) -> Self {
        Self {
            project,
            ctx,
            error_count: 0,
        }
    }

    /// The project's polling interval clamped to the global bounds.
    fn interval(&self) -> Duration {
        self.project.polling_interval(&self.ctx.defaults, &self.ctx.bounds)
    }

    /// Delay before the next tick, honoring error backoff.
    fn next_delay(&self) -> Duration {
        if self.error_count == 0 {
            return self.interval();
        }
        let base = self.ctx.bounds.min_polling_interval_ms as f64;
        let backed_off = base * self.ctx.rate.multiplier.powi(self.error_count as i32);
        Duration::from_millis(backed_off.min(self.ctx.rate.max_backoff_ms as f64) as u64)
    }

    /// One discovery pass. Returns how many tasks were enqueued.
    pub async fn tick(&mut self) -> Result<usize> {
        let required = self.ctx.min_remaining_calls.max(1);
        let check = self.ctx.limiter.check(required);
        if check.limited {
            log::debug!(
                "[{}] poll skipped, {:?} limited for {:.0}s",
                self.project.id,
                check.which,
                check.wait.as_secs_f64()
            );
            return Ok(0);
        }

        if self.ctx.limiter.needs_github_refresh() {
            match self.ctx.github.rate_limit().await {
                Ok(budget) => {
                    self.ctx
                        .limiter
                        .record_github_budget(budget.remaining, budget.reset_at());
                    if self.ctx.limiter.check(required).limited {
                        log::info!("[{}] poll skipped, budget exhausted", self.project.id);
                        return Ok(0);
                    }
                }
                Err(e) => log::warn!("[{}] budget probe failed: {}", self.project.id, e),
            }
        }

        let mut enqueued = 0;
        let issues = self
            .ctx
            .github
            .list_open_issues(&self.project.owner, &self.project.repo, &self.project.labels)
            .await?;
        self.ctx.limiter.consume_github_calls(1);

        let eligible: Vec<Issue> = issues
            .into_iter()
            .filter(|issue| discovery::labels_admit(&self.project, &issue.label_names()))
            .collect();

        for issue in &eligible {
            if self.enqueue_issue(issue) {
                enqueued += 1;
            }
        }

        if self.project.process_comments {
            enqueued += self.poll_comments(&eligible).await?;
        }
        if self.project.process_pull_requests {
            enqueued += self.poll_pull_requests().await?;
        }

        Ok(enqueued)
    }

    fn enqueue_issue(&self, issue: &Issue) -> bool {
        let issue_ref = IssueRef::new(self.project.id.clone(), issue.number);
        if self.ctx.store.is_issue_processed(&issue_ref) {
            return false;
        }
        if self.ctx.queue.contains_issue(&issue_ref) {
            return false;
        }

        let now = Utc::now();
        let labels = issue.label_names();
        let body = issue.body.clone().unwrap_or_default();
        let author = issue.user.as_ref().map(|u| u.login.clone());
        let kind = match discovery::kind_from_labels(&labels) {
            KindTag::Issue => TaskKind::Issue(IssuePayload {
                number: issue.number,
                title: issue.title.clone(),
                body: body.clone(),
                labels: labels.clone(),
                author,
                created_at: issue.created_at,
            }),
            KindTag::Comment => TaskKind::Comment(CommentPayload {
                issue_number: issue.number,
                // The issue body itself is the conversation opener
                comment_id: 0,
                body: body.clone(),
                author,
                created_at: issue.created_at,
            }),
            KindTag::PrReview => TaskKind::PrReview(PrPayload {
                number: issue.number,
                title: issue.title.clone(),
                body: body.clone(),
                head_ref: None,
                base_ref: None,
                updated_at: issue.updated_at,
            }),
        };

        let mut task = Task::new(
            &self.project.id,
            issue.number,
            kind,
            discovery::base_priority(&labels, issue.created_at, now),
        );
        task.deadline = discovery::extract_deadline(&body).or_else(|| {
            self.project
                .scheduling
                .as_ref()
                .and_then(|s| s.deadline_days)
                .map(|days| now + chrono::Duration::days(days as i64))
        });
        self.submit(task)
    }

    async fn poll_comments(&self, issues: &[Issue]) -> Result<usize> {
        let since = Utc::now()
            - chrono::Duration::from_std(self.interval() * 2)
                .unwrap_or_else(|_| chrono::Duration::hours(1));
        let mut enqueued = 0;
        for issue in issues {
            let issue_ref = IssueRef::new(self.project.id.clone(), issue.number);
            if self.ctx.queue.contains_issue(&issue_ref) {
                continue;
            }
            let comments = self
                .ctx
                .github
                .list_issue_comments_since(
                    &self.project.owner,
                    &self.project.repo,
                    issue.number,
                    since,
                )
                .await?;
            self.ctx.limiter.consume_github_calls(1);

            for comment in comments {
                let body = comment.body.clone().unwrap_or_default();
                if !discovery::is_actionable_comment(&body, None) {
                    continue;
                }
                let now = Utc::now();
                let mut task = Task::new(
                    &self.project.id,
                    issue.number,
                    TaskKind::Comment(CommentPayload {
                        issue_number: issue.number,
                        comment_id: comment.id,
                        body,
                        author: comment.user.as_ref().map(|u| u.login.clone()),
                        created_at: comment.created_at,
                    }),
                    discovery::base_priority(&issue.label_names(), issue.created_at, now),
                );
                task.deadline = None;
                if self.submit(task) {
                    enqueued += 1;
                    // One active task per issue; later comments wait
                    break;
                }
            }
        }
        Ok(enqueued)
    }

    async fn poll_pull_requests(&self) -> Result<usize> {
        let prs = self
            .ctx
            .github
            .list_open_pull_requests(&self.project.owner, &self.project.repo)
            .await?;
        self.ctx.limiter.consume_github_calls(1);

        let now = Utc::now();
        let mut enqueued = 0;
        for pr in prs {
            if pr.draft || !discovery::pr_is_fresh(pr.updated_at, now) {
                continue;
            }
            let labels: Vec<String> = pr.labels.iter().map(|l| l.name.clone()).collect();
            if labels
                .iter()
                .any(|l| self.project.exclude_labels.contains(l))
            {
                continue;
            }
            let issue_ref = IssueRef::new(self.project.id.clone(), pr.number);
            if self.ctx.store.is_issue_processed(&issue_ref)
                || self.ctx.queue.contains_issue(&issue_ref)
            {
                continue;
            }
            let task = Task::new(
                &self.project.id,
                pr.number,
                TaskKind::PrReview(pr_payload(&pr)),
                discovery::base_priority(&labels, None, now),
            );
            if self.submit(task) {
                enqueued += 1;
            }
        }
        Ok(enqueued)
    }

    fn submit(&self, task: Task) -> bool {
        match self.ctx.queue.enqueue(task) {
            Ok(id) => {
                log::info!("[{}] enqueued {}", self.project.id, id);
                true
            }
            Err(EnqueueError::Duplicate { .. }) => false,
            Err(e) => {
                log::warn!("[{}] enqueue rejected: {}", self.project.id, e);
                false
            }
        }
    }

    /// Run the polling loop until shutdown.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        log::info!(
            "[{}] poller started, interval {:.0}s",
            self.project.id,
            self.interval().as_secs_f64()
        );
        loop {
            match self.tick().await {
                Ok(enqueued) => {
                    self.error_count = 0;
                    if enqueued > 0 {
                        log::info!("[{}] discovered {} task(s)", self.project.id, enqueued);
                    }
                }
                Err(e) => {
                    self.error_count += 1;
                    log::warn!(
                        "[{}] poll failed ({} consecutive): {}",
                        self.project.id,
                        self.error_count,
                        e
                    );
                }
            }
            let delay = self.next_delay();
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        log::info!("[{}] poller stopped", self.project.id);
    }
}

fn pr_payload(pr: &PullRequest) -> PrPayload {
    PrPayload {
        number: pr.number,
        title: pr.title.clone(),
        body: pr.body.clone().unwrap_or_default(),
        head_ref: pr.head.as_ref().map(|r| r.ref_name.clone()),
        base_ref: pr.base.as_ref().map(|r| r.ref_name.clone()),
        updated_at: pr.updated_at,
    }
}

/// Owns the poller tasks for every registered project.
pub struct Scheduler {
    ctx: Arc<SchedulerContext>,
    pollers: Mutex<HashMap<String, tokio::task::JoinHandle<()>>>,
    shutdown_tx: watch::Sender<bool>,
}

impl Scheduler {
    /// Create a scheduler around the shared context.
    pub fn new(ctx: Arc<SchedulerContext>) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            ctx,
            pollers: Mutex::new(HashMap::new()),
            shutdown_tx,
        }
    }

    /// Start polling a project. Disabled projects are registered with the
    /// queue for bookkeeping but get no poller.
    pub fn register_project(&self, project: ProjectConfig) {
        self.ctx.queue.register_project(&project);
        if !project.enabled {
            log::info!("[{}] registered (disabled, not polling)", project.id);
            return;
        }
        let id = project.id.clone();
        let poller = ProjectPoller::new(project, Arc::clone(&self.ctx));
        let shutdown_rx = self.shutdown_tx.subscribe();
        let handle = tokio::spawn(poller.run(shutdown_rx));
        let mut pollers = self.pollers.lock().unwrap();
        if let Some(previous) = pollers.insert(id, handle) {
            previous.abort();
        }
    }

    /// Stop polling a project immediately; in-flight tasks continue.
    pub fn unregister_project(&self, project_id: &str) {
        if let Some(handle) = self.pollers.lock().unwrap().remove(project_id) {
            handle.abort();
        }
    }

    /// Ids of projects currently being polled.
    pub fn active_projects(&self) -> Vec<String> {
        self.pollers.lock().unwrap().keys().cloned().collect()
    }

    /// Stop every poller.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        for (_, handle) in self.pollers.lock().unwrap().drain() {
            handle.abort();
        }
    }
}
