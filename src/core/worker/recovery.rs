//! Startup crash-recovery sweep over the running-task registry.
//!
//! For each record left behind by a previous instance: a still-alive
//! child is adopted and observed until it exits; a leftover result file
//! is processed as if the task had just completed; anything else is
//! marked failed with reason "interrupted". No adopted task is ever
//! started anew.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;

use super::WorkerContext;
use crate::core::state::pid_alive;
use crate::core::task::{
    CustomPayload, RunningTaskRecord, StatusTransition, SchedulingMeta, Task, TaskKind,
    TaskOutcome, TaskStatus,
};
use crate::Result;

/// How often an adoption watcher probes the child PID.
const ADOPT_POLL: Duration = Duration::from_millis(200);

/// Counts of what the sweep found.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Children still alive, now observed by a watcher
    pub adopted: usize,
    /// Tasks retired from a leftover result file
    pub completed: usize,
    /// Tasks marked failed with reason "interrupted"
    pub interrupted: usize,
}

/// Rebuild a minimal task from its running record.
///
/// The original payload died with the previous instance; what remains is
/// enough identity for result persistence and upstream reporting.
fn reconstruct_task(record: &RunningTaskRecord) -> Task {
    Task {
        id: record.task_id.clone(),
        project_id: record.project_id.clone(),
        issue_number: record.issue_number,
        kind: TaskKind::Custom(CustomPayload {
            name: "recovered".to_string(),
            data: serde_json::json!({ "worker_id": record.worker_id }),
        }),
        base_priority: 50,
        effective_priority: 50,
        enqueued_at: record.child_started_at,
        started_at: Some(record.child_started_at),
        completed_at: None,
        deadline: None,
        estimated_duration: None,
        attempts: 1,
        status: TaskStatus::Running,
        scheduling: SchedulingMeta::default(),
        result: None,
        error: None,
        history: vec![StatusTransition {
            status: TaskStatus::Running,
            at: record.child_started_at,
            reason: "reconstructed from running-task record".to_string(),
        }],
    }
}

/// Run the sweep. Alive children get a detached watcher; everything else
/// is settled before this returns.
pub async fn sweep(ctx: &Arc<WorkerContext>) -> Result<RecoveryReport> {
    let records = ctx.store.load_running_tasks()?;
    let mut report = RecoveryReport::default();

    for (task_id, record) in records {
        if pid_alive(record.child_pid) {
            log::info!(
                "adopting live child {} for task {} from previous run",
                record.child_pid,
                task_id
            );
            report.adopted += 1;
            tokio::spawn(adopt(Arc::clone(ctx), record));
        } else if ctx.scratch_path(&task_id, "result").exists() {
            match read_result(ctx, &task_id) {
                Ok(outcome) => {
                    log::info!("processing leftover result for task {}", task_id);
                    settle(ctx, &record, outcome).await;
                    report.completed += 1;
                }
                Err(e) => {
                    log::warn!("result file for {} unreadable ({}), marking interrupted", task_id, e);
                    interrupt(ctx, &record).await;
                    report.interrupted += 1;
                }
            }
        } else {
            log::warn!("task {} has no live child and no result, marking interrupted", task_id);
            interrupt(ctx, &record).await;
            report.interrupted += 1;
        }
    }
    Ok(report)
}

fn read_result(ctx: &WorkerContext, task_id: &str) -> Result<TaskOutcome> {
    let content = std::fs::read_to_string(ctx.scratch_path(task_id, "result"))?;
    Ok(serde_json::from_str(&content)?)
}

/// Observe an adopted child until it exits, then settle the task from
/// whatever evidence remains. A child outliving the default timeout is
/// marked stalled and then failed.
async fn adopt(ctx: Arc<WorkerContext>, record: RunningTaskRecord) {
    let deadline = tokio::time::Instant::now() + ctx.defaults.task_timeout();
    while pid_alive(record.child_pid) {
        if tokio::time::Instant::now() >= deadline {
            break;
        }
        tokio::time::sleep(ADOPT_POLL).await;
    }

    if pid_alive(record.child_pid) {
        stall(&ctx, &record).await;
        return;
    }

    match read_result(&ctx, &record.task_id) {
        Ok(outcome) => settle(&ctx, &record, outcome).await,
        // Output died with the previous instance
        Err(_) => interrupt(&ctx, &record).await,
    }
}

/// Settle an adopted child that outlived its observation window: the
/// task passes through `stalled`, the orphan is killed (it belongs to a
/// dead session and can never report), and the task fails.
async fn stall(ctx: &WorkerContext, record: &RunningTaskRecord) {
    let mut task = reconstruct_task(record);
    if let Err(e) = task.transition(TaskStatus::Stalled, "no status update after adoption") {
        log::error!("recovery transition for {}: {}", task.id, e);
    }
    log::warn!(
        "adopted child {} for task {} stalled past timeout, killing it",
        record.child_pid,
        record.task_id
    );
    #[cfg(unix)]
    unsafe {
        libc::kill(record.child_pid as libc::pid_t, libc::SIGKILL);
    }
    task.error = Some("stalled".to_string());
    if let Err(e) = task.transition(TaskStatus::Failed, "stall timeout") {
        log::error!("recovery transition for {}: {}", task.id, e);
    }
    let outcome = TaskOutcome {
        exit_code: -1,
        stdout: String::new(),
        stderr: "stalled: no status update after adoption".to_string(),
        success: false,
        completed_at: Utc::now(),
        rate_limited: false,
        reset_time: None,
        follow_up_actions: vec![],
    };
    if let Err(e) = ctx.results.handle(&task, &outcome).await {
        log::error!("stalled-task handling for {} failed: {}", task.id, e);
    }
    finalize(ctx, record).await;
}

async fn settle(ctx: &WorkerContext, record: &RunningTaskRecord, outcome: TaskOutcome) {
    let mut task = reconstruct_task(record);
    let transition = if outcome.success {
        task.transition(TaskStatus::Completed, "recovered result")
    } else {
        task.transition(TaskStatus::Failed, "recovered result")
    };
    if let Err(e) = transition {
        log::error!("recovery transition for {}: {}", task.id, e);
    }
    if let Err(e) = ctx.results.handle(&task, &outcome).await {
        log::error!("recovered result handling for {} failed: {}", task.id, e);
    }
    finalize(ctx, record).await;
}

async fn interrupt(ctx: &WorkerContext, record: &RunningTaskRecord) {
    let mut task = reconstruct_task(record);
    task.error = Some("interrupted".to_string());
    if let Err(e) = task.transition(TaskStatus::Failed, "interrupted") {
        log::error!("recovery transition for {}: {}", task.id, e);
    }
    let outcome = TaskOutcome {
        exit_code: -1,
        stdout: String::new(),
        stderr: "interrupted".to_string(),
        success: false,
        completed_at: Utc::now(),
        rate_limited: false,
        reset_time: None,
        follow_up_actions: vec![],
    };
    if let Err(e) = ctx.results.handle(&task, &outcome).await {
        log::error!("interrupted-task handling for {} failed: {}", task.id, e);
    }
    finalize(ctx, record).await;
}

async fn finalize(ctx: &WorkerContext, record: &RunningTaskRecord) {
    if let Err(e) = ctx.store.remove_running_task(&record.task_id).await {
        log::error!("failed to drop running record {}: {}", record.task_id, e);
    }
    for suffix in ["pid", "status", "result"] {
        let _ = std::fs::remove_file(ctx.scratch_path(&record.task_id, suffix));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DefaultsConfig, ProjectConfig, RateLimitConfig, SchedulingAlgorithm};
    use crate::core::queue::TaskQueue;
    use crate::core::rate_limit::RateLimiter;
    use crate::core::result_handler::ResultHandler;
    use crate::core::state::{IssueLockManager, StateStore};
    use crate::core::task::IssueRef;
    use crate::services::ai::AiToolRunner;
    use crate::services::github::MockGitHubClient;
    use tempfile::TempDir;

    fn context(mut github: MockGitHubClient) -> (TempDir, Arc<WorkerContext>) {
        github.expect_create_comment().returning(|_, _, _, _| Ok(()));
        github.expect_remove_label().returning(|_, _, _, _| Ok(()));
        github.expect_add_labels().returning(|_, _, _, _| Ok(()));

        let dir = TempDir::new().unwrap();
        let store = Arc::new(StateStore::new(dir.path()).unwrap());
        let queue = Arc::new(TaskQueue::new(
            SchedulingAlgorithm::PriorityBased,
            100,
            false,
            false,
        ));
        let locks = Arc::new(IssueLockManager::new(store.locks_dir()));
        let limiter = Arc::new(RateLimiter::new(RateLimitConfig::default()));
        let github: Arc<dyn crate::services::github::GitHubClient> = Arc::new(github);
        let results = Arc::new(ResultHandler::new(
            Arc::clone(&github),
            Arc::clone(&queue),
            Arc::clone(&store),
            RateLimitConfig {
                initial_backoff_ms: 1,
                ..Default::default()
            },
        ));
        results.register_project(&ProjectConfig::new("demo", "octo", "repo"));
        let defaults = DefaultsConfig {
            check_interval_ms: 60_000,
            task_timeout_ms: 2_000,
            stall_timeout_ms: 1_000,
        };
        let ctx = Arc::new(WorkerContext::new(
            queue,
            store,
            locks,
            limiter,
            AiToolRunner::new("sh", &["-c", "true"]),
            results,
            defaults,
            3,
        ));
        (dir, ctx)
    }

    fn record(task_id: &str, pid: u32) -> RunningTaskRecord {
        RunningTaskRecord {
            task_id: task_id.to_string(),
            project_id: "demo".to_string(),
            issue_number: 11,
            child_pid: pid,
            child_started_at: Utc::now(),
            worker_id: "worker-gone".to_string(),
        }
    }

    fn success_outcome() -> TaskOutcome {
        TaskOutcome {
            exit_code: 0,
            stdout: "recovered fine".to_string(),
            stderr: String::new(),
            success: true,
            completed_at: Utc::now(),
            rate_limited: false,
            reset_time: None,
            follow_up_actions: vec![],
        }
    }

    #[tokio::test]
    async fn test_dead_child_without_result_is_interrupted() {
        let (_dir, ctx) = context(MockGitHubClient::new());
        ctx.store
            .add_running_task(record("demo-11-1", 0))
            .await
            .unwrap();

        let report = sweep(&ctx).await.unwrap();
        assert_eq!(
            report,
            RecoveryReport {
                adopted: 0,
                completed: 0,
                interrupted: 1
            }
        );
        assert!(ctx.store.load_running_tasks().unwrap().is_empty());
        let error_record = ctx
            .store
            .results_dir()
            .join("error")
            .join("demo-11-1.json");
        assert!(error_record.exists());
        let content = std::fs::read_to_string(error_record).unwrap();
        assert!(content.contains("interrupted"));
    }

    #[tokio::test]
    async fn test_leftover_result_file_is_processed() {
        let (_dir, ctx) = context(MockGitHubClient::new());
        ctx.store
            .add_running_task(record("demo-11-2", 0))
            .await
            .unwrap();
        StateStore::atomic_write(
            &ctx.scratch_path("demo-11-2", "result"),
            &serde_json::to_vec(&success_outcome()).unwrap(),
        )
        .unwrap();

        let report = sweep(&ctx).await.unwrap();
        assert_eq!(report.completed, 1);
        assert_eq!(report.interrupted, 0);
        assert!(ctx
            .store
            .results_dir()
            .join("success")
            .join("demo-11-2.json")
            .exists());
        assert!(ctx.store.is_issue_processed(&IssueRef::new("demo", 11)));
        // Scratch cleaned up
        assert!(!ctx.scratch_path("demo-11-2", "result").exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_adopted_child_outliving_timeout_is_stalled_then_failed() {
        let (_dir, ctx) = context(MockGitHubClient::new());
        // Shrink the observation window so the watcher gives up quickly
        let ctx = Arc::new(WorkerContext::new(
            Arc::clone(&ctx.queue),
            Arc::clone(&ctx.store),
            Arc::clone(&ctx.locks),
            Arc::clone(&ctx.limiter),
            crate::services::ai::AiToolRunner::new("sh", &["-c", "true"]),
            Arc::clone(&ctx.results),
            DefaultsConfig {
                check_interval_ms: 60_000,
                task_timeout_ms: 400,
                stall_timeout_ms: 200,
            },
            3,
        ));
        let child = std::process::Command::new("sleep").arg("30").spawn().unwrap();
        let pid = child.id();
        ctx.store
            .add_running_task(record("demo-11-4", pid))
            .await
            .unwrap();

        let report = sweep(&ctx).await.unwrap();
        assert_eq!(report.adopted, 1);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(ctx.store.load_running_tasks().unwrap().is_empty());
        let record_path = ctx
            .store
            .results_dir()
            .join("error")
            .join("demo-11-4.json");
        let content = std::fs::read_to_string(record_path).unwrap();
        assert!(content.contains("stalled"));

        // The watcher already killed the orphan; reap it so the test
        // process leaves no zombie behind
        let mut child = child;
        let _ = child.kill();
        let _ = child.wait();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_live_child_is_adopted_then_settled() {
        let (_dir, ctx) = context(MockGitHubClient::new());
        let mut child = std::process::Command::new("sleep").arg("0.3").spawn().unwrap();
        ctx.store
            .add_running_task(record("demo-11-3", child.id()))
            .await
            .unwrap();

        let report = sweep(&ctx).await.unwrap();
        assert_eq!(report.adopted, 1);

        // Reap the child so its PID reads as dead (real adopted children
        // are reparented to init and reaped there)
        tokio::task::spawn_blocking(move || child.wait()).await.unwrap().unwrap();

        // The watcher settles the record once the child exits; without a
        // result file the task is marked interrupted
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(ctx.store.load_running_tasks().unwrap().is_empty());
        assert!(ctx
            .store
            .results_dir()
            .join("error")
            .join("demo-11-3.json")
            .exists());
    }
}
