//! Worker pool: concurrent slots that execute tasks in child processes.
//!
//! Each slot loops: pull a task from the queue, set up the project
//! context, take the per-issue lock, spawn the AI tool on its own stdio,
//! wait bounded by the effective timeout, then retire the task through
//! the result handler. Scratch files (`task-<id>.pid`, `.status`,
//! `.result`) record enough for the recovery sweep to pick up after a
//! crash.

pub mod recovery;

use chrono::Utc;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use uuid::Uuid;

use crate::config::{DefaultsConfig, ProjectConfig};
use crate::core::queue::TaskQueue;
use crate::core::rate_limit::{ApiKind, RateLimiter};
use crate::core::result_handler::ResultHandler;
use crate::core::state::{holder_for, IssueLockManager, StateStore};
use crate::core::task::{RunningTaskRecord, Task, TaskKind, TaskOutcome, TaskStatus};
use crate::services::ai::{is_rate_limit_signature, AiRequest, AiToolRunner, RunningTool};
use crate::Result;

/// Grace between the polite termination signal and the force kill.
const KILL_GRACE: Duration = Duration::from_secs(5);
/// How long an idle worker sleeps before polling the queue again.
const IDLE_POLL: Duration = Duration::from_millis(250);
/// Cooldown assumed when the AI tool rate-limits without naming a reset.
const DEFAULT_AI_COOLDOWN_SECS: i64 = 300;

/// Dependencies shared by every worker slot.
pub struct WorkerContext {
    pub queue: Arc<TaskQueue>,
    pub store: Arc<StateStore>,
    pub locks: Arc<IssueLockManager>,
    pub limiter: Arc<RateLimiter>,
    pub runner: AiToolRunner,
    pub results: Arc<ResultHandler>,
    pub defaults: DefaultsConfig,
    pub max_retries: u32,
    projects: Mutex<HashMap<String, ProjectConfig>>,
}

impl WorkerContext {
    /// Assemble the shared context.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        queue: Arc<TaskQueue>,
        store: Arc<StateStore>,
        locks: Arc<IssueLockManager>,
        limiter: Arc<RateLimiter>,
        runner: AiToolRunner,
        results: Arc<ResultHandler>,
        defaults: DefaultsConfig,
        max_retries: u32,
    ) -> Self {
        Self {
            queue,
            store,
            locks,
            limiter,
            runner,
            results,
            defaults,
            max_retries,
            projects: Mutex::new(HashMap::new()),
        }
    }

    /// Teach the workers a project's execution context.
    pub fn register_project(&self, project: &ProjectConfig) {
        self.projects
            .lock()
            .unwrap()
            .insert(project.id.clone(), project.clone());
    }

    fn project(&self, id: &str) -> Option<ProjectConfig> {
        self.projects.lock().unwrap().get(id).cloned()
    }

    pub(crate) fn scratch_path(&self, task_id: &str, suffix: &str) -> PathBuf {
        self.store
            .scratch_dir()
            .join(format!("task-{}.{}", task_id, suffix))
    }
}

/// One worker slot.
pub struct Worker {
    id: String,
    ctx: Arc<WorkerContext>,
}

impl Worker {
    /// Create a slot with a fresh identity.
    pub fn new(ctx: Arc<WorkerContext>) -> Self {
        Self {
            id: format!("worker-{}", Uuid::new_v4()),
            ctx,
        }
    }

    /// Slot identity.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Pull-execute loop until shutdown.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        log::info!("{} started", self.id);
        loop {
            if *shutdown.borrow() {
                break;
            }
            match self.ctx.queue.next_task(None) {
                Some(task) => self.process(task).await,
                None => {
                    tokio::select! {
                        _ = tokio::time::sleep(IDLE_POLL) => {}
                        _ = shutdown.changed() => {}
                    }
                }
            }
        }
        log::info!("{} stopped", self.id);
    }

    /// Handle one dispatched task end to end. Never panics the slot;
    /// every failure ends in a recorded task state.
    pub async fn process(&self, mut task: Task) {
        let now = Utc::now();
        if task.deadline_expired(now) {
            // Deadline expiry is terminal, never retried
            if let Err(e) = task.transition(TaskStatus::Cancelled, "deadline expired") {
                log::error!("{}: {}", self.id, e);
            }
            self.ctx.queue.finish(&task.id, false, 0.0);
            log::warn!("task {} cancelled: deadline expired", task.id);
            return;
        }

        let check = self.ctx.limiter.check(0);
        if check.limited && check.which == Some(ApiKind::AiTool) {
            if let Err(e) = task.transition(TaskStatus::Queued, "ai tool cooling down") {
                log::error!("{}: {}", self.id, e);
            }
            self.ctx.queue.requeue(task);
            tokio::time::sleep(check.wait.min(Duration::from_secs(5))).await;
            return;
        }

        let issue = task.issue_ref();
        match self.ctx.locks.acquire(&issue, holder_for(&self.id, &task.id)) {
            Ok(true) => {}
            Ok(false) => {
                log::debug!("{}: issue lock held for {}, giving task back", self.id, issue);
                if let Err(e) = task.transition(TaskStatus::Queued, "issue lock held") {
                    log::error!("{}: {}", self.id, e);
                }
                self.ctx.queue.requeue(task);
                tokio::time::sleep(IDLE_POLL).await;
                return;
            }
            Err(e) => {
                log::error!("{}: lock acquisition failed: {}", self.id, e);
                self.ctx.queue.requeue(task);
                return;
            }
        }

        let outcome = self.execute(&mut task).await;
        if let Err(e) = self.ctx.locks.release(&issue, std::process::id()) {
            log::warn!("{}: lock release failed: {}", self.id, e);
        }
        match outcome {
            Ok(outcome) => self.dispose(task, outcome).await,
            Err(e) => {
                // Spawn-level failure: treat like a failed execution
                log::error!("{}: execution error for {}: {}", self.id, task.id, e);
                let synthetic = TaskOutcome {
                    exit_code: -1,
                    stdout: String::new(),
                    stderr: e.to_string(),
                    success: false,
                    completed_at: Utc::now(),
                    rate_limited: false,
                    reset_time: None,
                    follow_up_actions: vec![],
                };
                self.dispose(task, synthetic).await;
            }
        }
    }

    async fn execute(&self, task: &mut Task) -> Result<TaskOutcome> {
        task.attempts += 1;
        task.transition(TaskStatus::Running, format!("attempt {}", task.attempts))?;

        let project = self.ctx.project(&task.project_id);
        let timeout = project
            .as_ref()
            .map(|p| p.task_timeout(&self.ctx.defaults))
            .unwrap_or_else(|| self.ctx.defaults.task_timeout());

        let mut env: HashMap<String, String> = project
            .as_ref()
            .map(|p| p.env.clone())
            .unwrap_or_default();
        env.insert("REPOPILOT_PROJECT".into(), task.project_id.clone());
        env.insert("REPOPILOT_ISSUE".into(), task.issue_number.to_string());
        env.insert("REPOPILOT_TASK_ID".into(), task.id.clone());
        let working_dir = project.as_ref().and_then(|p| p.working_dir.clone());

        let prompt = build_prompt(task);
        let mut tool = self
            .ctx
            .runner
            .spawn(AiRequest {
                prompt: &prompt,
                working_dir: working_dir.as_deref(),
                env: &env,
            })
            .await?;

        let pid = tool.pid().unwrap_or(0);
        StateStore::atomic_write(
            &self.ctx.scratch_path(&task.id, "pid"),
            pid.to_string().as_bytes(),
        )?;
        StateStore::atomic_write(&self.ctx.scratch_path(&task.id, "status"), b"running")?;
        self.ctx
            .store
            .add_running_task(RunningTaskRecord {
                task_id: task.id.clone(),
                project_id: task.project_id.clone(),
                issue_number: task.issue_number,
                child_pid: pid,
                child_started_at: Utc::now(),
                worker_id: self.id.clone(),
            })
            .await?;

        let stall_timeout = project
            .as_ref()
            .map(|p| p.stall_timeout(&self.ctx.defaults))
            .unwrap_or_else(|| self.ctx.defaults.stall_timeout());

        let outcome = match self.wait_bounded(task, &mut tool, timeout, stall_timeout).await {
            Some(Ok(_)) => {
                let output = tool.into_output().await?;
                let rate_limited = output.exit_code != 0 && is_rate_limit_signature(&output.stderr);
                TaskOutcome {
                    exit_code: output.exit_code,
                    success: output.exit_code == 0,
                    rate_limited,
                    reset_time: rate_limited
                        .then(|| RateLimiter::parse_remote_error(&output.stderr))
                        .flatten(),
                    stdout: output.stdout,
                    stderr: output.stderr,
                    completed_at: Utc::now(),
                    follow_up_actions: vec![],
                }
            }
            Some(Err(e)) => {
                self.finish_scratch(task, "failed")?;
                self.ctx.store.remove_running_task(&task.id).await?;
                return Err(e);
            }
            None => {
                // Timeout: polite signal, force kill after the grace
                log::warn!(
                    "task {} exceeded {:.0}s timeout, terminating child {}",
                    task.id,
                    timeout.as_secs_f64(),
                    pid
                );
                tool.terminate(KILL_GRACE).await;
                TaskOutcome {
                    exit_code: -1,
                    stdout: String::new(),
                    stderr: format!("execution timed out after {:.0}s", timeout.as_secs_f64()),
                    success: false,
                    completed_at: Utc::now(),
                    rate_limited: false,
                    reset_time: None,
                    follow_up_actions: vec![],
                }
            }
        };

        StateStore::atomic_write(
            &self.ctx.scratch_path(&task.id, "result"),
            &serde_json::to_vec_pretty(&outcome)?,
        )?;
        self.finish_scratch(task, if outcome.success { "completed" } else { "failed" })?;
        self.ctx.store.remove_running_task(&task.id).await?;
        Ok(outcome)
    }

    /// Wait for the child within the task timeout, passing through the
    /// stalled state when no status update arrives inside the stall
    /// window. A child that exits during the remainder of the timeout
    /// recovers back to running; `None` means the full timeout elapsed.
    async fn wait_bounded(
        &self,
        task: &mut Task,
        tool: &mut RunningTool,
        timeout: Duration,
        stall_timeout: Duration,
    ) -> Option<Result<i32>> {
        match tokio::time::timeout(timeout.min(stall_timeout), tool.wait_exit()).await {
            Ok(result) => Some(result),
            Err(_) if stall_timeout < timeout => {
                if let Err(e) = task.transition(
                    TaskStatus::Stalled,
                    format!("no status update for {:.0}s", stall_timeout.as_secs_f64()),
                ) {
                    log::error!("{}: {}", self.id, e);
                }
                if let Err(e) = self.finish_scratch(task, "stalled") {
                    log::warn!("{}: {}", self.id, e);
                }
                log::warn!(
                    "task {} stalled: no status update for {:.0}s",
                    task.id,
                    stall_timeout.as_secs_f64()
                );
                match tokio::time::timeout(timeout.saturating_sub(stall_timeout), tool.wait_exit())
                    .await
                {
                    Ok(result) => {
                        if let Err(e) =
                            task.transition(TaskStatus::Running, "status update arrived")
                        {
                            log::error!("{}: {}", self.id, e);
                        }
                        if let Err(e) = self.finish_scratch(task, "running") {
                            log::warn!("{}: {}", self.id, e);
                        }
                        log::info!("task {} recovered from stall", task.id);
                        Some(result)
                    }
                    Err(_) => None,
                }
            }
            Err(_) => None,
        }
    }

    fn finish_scratch(&self, task: &Task, status: &str) -> Result<()> {
        StateStore::atomic_write(
            &self.ctx.scratch_path(&task.id, "status"),
            status.as_bytes(),
        )
    }

    async fn dispose(&self, mut task: Task, outcome: TaskOutcome) {
        let exec_secs = task
            .started_at
            .map(|s| (outcome.completed_at - s).num_milliseconds() as f64 / 1_000.0)
            .unwrap_or(0.0);

        if outcome.rate_limited {
            let until = outcome
                .reset_time
                .unwrap_or_else(|| Utc::now() + chrono::Duration::seconds(DEFAULT_AI_COOLDOWN_SECS));
            self.ctx.limiter.note_ai_cooldown(until);
            // A rate-limited run is not a real attempt
            task.attempts = task.attempts.saturating_sub(1);
            if let Err(e) = task.transition(TaskStatus::Retrying, "ai tool rate limited") {
                log::error!("{}: {}", self.id, e);
            }
            log::info!("task {} re-enqueued until cooldown {}", task.id, until);
            self.ctx.queue.requeue(task);
            return;
        }

        if outcome.success {
            if let Err(e) = task.transition(TaskStatus::Completed, "exit 0") {
                log::error!("{}: {}", self.id, e);
            }
            task.result = Some(outcome.clone());
            self.ctx.queue.finish(&task.id, true, exec_secs);
            self.ctx.limiter.reset_backoff(&task.id);
            if let Err(e) = self.ctx.results.handle(&task, &outcome).await {
                log::error!("result handling for {} failed: {}", task.id, e);
            }
            self.cleanup_scratch(&task.id);
            return;
        }

        let reason = if outcome.stderr.contains("timed out") {
            outcome.stderr.clone()
        } else {
            format!("child exited with code {}", outcome.exit_code)
        };
        task.error = Some(if outcome.stderr.is_empty() {
            reason.clone()
        } else {
            outcome.stderr.clone()
        });
        if let Err(e) = task.transition(TaskStatus::Failed, reason) {
            log::error!("{}: {}", self.id, e);
        }

        if task.attempts < self.ctx.max_retries {
            let decision = self.ctx.limiter.backoff_for(&task.id);
            if let Err(e) = task.transition(
                TaskStatus::Retrying,
                format!("attempt {} of {}", task.attempts, self.ctx.max_retries),
            ) {
                log::error!("{}: {}", self.id, e);
            }
            log::info!(
                "task {} will retry in {:.1}s (attempt {}/{})",
                task.id,
                decision.delay.as_secs_f64(),
                task.attempts,
                self.ctx.max_retries
            );
            let ctx = Arc::clone(&self.ctx);
            tokio::spawn(async move {
                tokio::time::sleep(decision.delay).await;
                ctx.queue.requeue(task);
            });
        } else {
            log::warn!(
                "task {} failed terminally after {} attempts",
                task.id,
                task.attempts
            );
            self.ctx.queue.finish(&task.id, false, exec_secs);
            if let Err(e) = self.ctx.results.handle(&task, &outcome).await {
                log::error!("result handling for {} failed: {}", task.id, e);
            }
            self.cleanup_scratch(&task.id);
        }
    }

    fn cleanup_scratch(&self, task_id: &str) {
        for suffix in ["pid", "status", "result"] {
            let _ = std::fs::remove_file(self.ctx.scratch_path(task_id, suffix));
        }
    }
}

/// Build the prompt handed to the AI tool for one task.
fn build_prompt(task: &Task) -> String {
    match &task.kind {
        TaskKind::Issue(payload) => format!(
            "Work on issue #{}: {}\n\n{}",
            payload.number, payload.title, payload.body
        ),
        TaskKind::Comment(payload) => format!(
            "Respond to the conversation on issue #{}.\n\nLatest comment:\n{}",
            payload.issue_number, payload.body
        ),
        TaskKind::PrReview(payload) => format!(
            "Review pull request #{}: {}\n\n{}\n\nRespond with a JSON object containing \
             `approve` (boolean) and `must_fix` (list of strings) plus your review text.",
            payload.number, payload.title, payload.body
        ),
        TaskKind::Custom(payload) => {
            format!("{}\n\n{}", payload.name, payload.data)
        }
    }
}

/// Owns the worker slots.
pub struct WorkerPool {
    ctx: Arc<WorkerContext>,
    handles: Mutex<Vec<(String, tokio::task::JoinHandle<()>)>>,
    shutdown_tx: watch::Sender<bool>,
}

impl WorkerPool {
    /// Create an empty pool around the shared context.
    pub fn new(ctx: Arc<WorkerContext>) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            ctx,
            handles: Mutex::new(Vec::new()),
            shutdown_tx,
        }
    }

    /// Open `slots` worker slots.
    pub fn start(&self, slots: usize) {
        let mut handles = self.handles.lock().unwrap();
        for _ in 0..slots {
            let worker = Worker::new(Arc::clone(&self.ctx));
            let id = worker.id().to_string();
            let handle = tokio::spawn(worker.run(self.shutdown_tx.subscribe()));
            handles.push((id, handle));
        }
    }

    /// Identities of the open slots.
    pub fn worker_ids(&self) -> Vec<String> {
        self.handles
            .lock()
            .unwrap()
            .iter()
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Abort one slot and open a replacement (admin surface).
    pub fn restart_worker(&self, worker_id: &str) -> bool {
        let mut handles = self.handles.lock().unwrap();
        let Some(position) = handles.iter().position(|(id, _)| id == worker_id) else {
            return false;
        };
        let (_, handle) = handles.remove(position);
        handle.abort();
        let worker = Worker::new(Arc::clone(&self.ctx));
        let id = worker.id().to_string();
        let replacement = tokio::spawn(worker.run(self.shutdown_tx.subscribe()));
        handles.push((id, replacement));
        true
    }

    /// Drain the pool: signal shutdown, then wait up to `grace` for the
    /// slots to finish their current task. Stragglers are detached; their
    /// in-flight children are never signalled here and outlive the
    /// daemon.
    pub async fn shutdown(&self, grace: Duration) {
        let _ = self.shutdown_tx.send(true);
        let handles: Vec<_> = std::mem::take(&mut *self.handles.lock().unwrap());
        let (ids, joins): (Vec<_>, Vec<_>) = handles.into_iter().unzip();
        let drained = futures::future::join_all(joins);
        if tokio::time::timeout(grace, drained).await.is_err() {
            log::warn!(
                "worker slot(s) {} did not drain within {:.0}s grace",
                ids.join(", "),
                grace.as_secs_f64()
            );
        }
    }
}
