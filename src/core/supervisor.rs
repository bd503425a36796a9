//! Daemon supervisor: startup sequencing, single-instance enforcement,
//! signal handling, draining shutdown, and the admin surface.
//!
//! Startup order matters: process lock first (exit cleanly if another
//! instance holds it), then state, rate limiter, and queue, then pending
//! restore and the crash-recovery sweep, then project registration and
//! worker slots, and signal handlers last. Shutdown reverses it: stop
//! discovery, drain workers within a bounded grace, persist what is left,
//! release locks, drop the process lock.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::config::{Config, ProjectConfig};
use crate::core::queue::{QueueStatistics, SchedulingSnapshot, TaskQueue};
use crate::core::rate_limit::RateLimiter;
use crate::core::result_handler::{ResultCounters, ResultHandler};
use crate::core::scheduler::{Scheduler, SchedulerContext};
use crate::core::state::{IssueLockManager, StateStore};
use crate::core::task::Task;
use crate::core::worker::{recovery, WorkerContext, WorkerPool};
use crate::error::RepoPilotError;
use crate::services::ai::AiToolRunner;
use crate::services::github::{GitHubClient, RestGitHubClient};
use crate::Result;

/// How long shutdown waits for in-flight workers.
const DRAIN_GRACE: Duration = Duration::from_secs(30);

/// Serializable daemon status for the admin surface.
#[derive(Debug, Clone, Serialize)]
pub struct DaemonStatus {
    pub pid: u32,
    pub started_at: DateTime<Utc>,
    pub draining: bool,
    pub dry_run: bool,
    pub queued: usize,
    pub running: usize,
    pub workers: usize,
    pub projects: usize,
}

/// The assembled daemon. Owns the queue, the scheduler, the worker pool,
/// and the only right to mutate the process lock.
pub struct Supervisor {
    config: Config,
    store: Arc<StateStore>,
    queue: Arc<TaskQueue>,
    limiter: Arc<RateLimiter>,
    locks: Arc<IssueLockManager>,
    scheduler: Scheduler,
    pool: WorkerPool,
    results: Arc<ResultHandler>,
    worker_ctx: Arc<WorkerContext>,
    projects: Mutex<Vec<ProjectConfig>>,
    started_at: DateTime<Utc>,
    draining: AtomicBool,
    dry_run: bool,
}

impl Supervisor {
    /// Build and initialize the daemon.
    ///
    /// Returns `Ok(None)` when another live instance already holds the
    /// process lock; the caller exits 0 in that case.
    pub async fn bootstrap(config: Config, dry_run: bool) -> Result<Option<Self>> {
        let state_dir = config.daemon.resolved_state_dir();
        let store = Arc::new(StateStore::new(&state_dir)?);
        if !store.acquire_process_lock().await? {
            log::info!(
                "another instance already holds {}, exiting",
                state_dir.join("process.lock").display()
            );
            return Ok(None);
        }
        log::info!("state directory: {}", state_dir.display());

        let limiter = Arc::new(RateLimiter::new(config.rate_limit.clone()));
        let queue = Arc::new(TaskQueue::from_config(&config));
        if let Some(snapshot) = store.load_queue_state::<SchedulingSnapshot>()? {
            queue.restore_scheduling(&snapshot);
        }

        let github: Arc<dyn GitHubClient> = Arc::new(RestGitHubClient::new(
            &config.github.base_url,
            config.github.token.as_deref(),
        )?);
        let locks = Arc::new(IssueLockManager::new(store.locks_dir()));
        let results = Arc::new(ResultHandler::new(
            Arc::clone(&github),
            Arc::clone(&queue),
            Arc::clone(&store),
            config.rate_limit.clone(),
        ));
        let worker_ctx = Arc::new(WorkerContext::new(
            Arc::clone(&queue),
            Arc::clone(&store),
            Arc::clone(&locks),
            Arc::clone(&limiter),
            AiToolRunner::from_config(&config.ai),
            Arc::clone(&results),
            config.defaults.clone(),
            config.rate_limit.max_retries,
        ));
        let scheduler = Scheduler::new(Arc::new(SchedulerContext {
            github,
            queue: Arc::clone(&queue),
            store: Arc::clone(&store),
            limiter: Arc::clone(&limiter),
            defaults: config.defaults.clone(),
            bounds: config.scheduling.clone(),
            rate: config.rate_limit.clone(),
            min_remaining_calls: config.github.min_remaining_calls,
        }));

        let supervisor = Self {
            store,
            queue,
            limiter,
            locks,
            scheduler,
            pool: WorkerPool::new(Arc::clone(&worker_ctx)),
            results,
            worker_ctx,
            projects: Mutex::new(Vec::new()),
            started_at: Utc::now(),
            draining: AtomicBool::new(false),
            dry_run,
            config,
        };

        supervisor.restore_pending_tasks().await?;
        let report = recovery::sweep(&supervisor.worker_ctx).await?;
        if report != recovery::RecoveryReport::default() {
            log::info!(
                "recovery sweep: {} adopted, {} settled from results, {} interrupted",
                report.adopted,
                report.completed,
                report.interrupted
            );
        }
        let reclaimed = supervisor.locks.cleanup_stale()?;
        if reclaimed > 0 {
            log::info!("reclaimed {} stale issue lock(s)", reclaimed);
        }

        supervisor.register_configured_projects().await?;
        Ok(Some(supervisor))
    }

    async fn restore_pending_tasks(&self) -> Result<()> {
        let mut pending = self.store.load_pending_tasks()?;
        // Restore in priority order so the queue sees them as persisted
        pending.sort_by(|a, b| {
            b.effective_priority
                .cmp(&a.effective_priority)
                .then(a.enqueued_at.cmp(&b.enqueued_at))
        });
        let total = pending.len();
        let mut restored = 0;
        for task in pending {
            match self.queue.enqueue(task) {
                Ok(_) => restored += 1,
                Err(e) => log::warn!("pending task not restored: {}", e),
            }
        }
        if total > 0 {
            log::info!("restored {}/{} pending task(s)", restored, total);
        }
        // The on-disk pending list is consumed; the queue owns them now
        self.store.save_pending_tasks(&[]).await?;
        Ok(())
    }

    async fn register_configured_projects(&self) -> Result<()> {
        // Admin-registered projects persist in the store; the config file
        // contributes (and overrides) its own entries at startup.
        let mut registry = self.store.load_projects()?;
        for project in &self.config.projects {
            match registry.iter_mut().find(|p| p.id == project.id) {
                Some(existing) => *existing = project.clone(),
                None => registry.push(project.clone()),
            }
        }
        self.store.save_projects(&registry).await?;
        for project in &registry {
            self.attach_project(project);
        }
        *self.projects.lock().unwrap() = registry;
        Ok(())
    }

    fn attach_project(&self, project: &ProjectConfig) {
        self.results.register_project(project);
        self.worker_ctx.register_project(project);
        self.scheduler.register_project(project.clone());
    }

    /// Run until a shutdown signal arrives, then drain.
    pub async fn run(&self) -> Result<()> {
        if self.dry_run {
            log::info!("dry-run mode: discovery only, no worker slots opened");
        } else {
            self.pool.start(self.config.daemon.max_concurrent);
            log::info!("opened {} worker slot(s)", self.config.daemon.max_concurrent);
        }

        let maintenance = self.spawn_maintenance();
        let outcome = self.wait_for_shutdown_signal().await;
        maintenance.abort();
        self.shutdown().await?;
        outcome
    }

    fn spawn_maintenance(&self) -> tokio::task::JoinHandle<()> {
        let queue = Arc::clone(&self.queue);
        let store = Arc::clone(&self.store);
        let locks = Arc::clone(&self.locks);
        let tick = Duration::from_millis(self.config.scheduling.poll_interval_ms);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(tick);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            let mut ticks: u64 = 0;
            loop {
                interval.tick().await;
                queue.tick();
                ticks += 1;
                // Lock reclamation and snapshot persistence are cheaper
                // than the scheduling tick; run them at a slower cadence
                if ticks % 10 == 0 {
                    if let Err(e) = store.save_queue_state(&queue.scheduling_snapshot()).await {
                        log::warn!("scheduling snapshot persist failed: {}", e);
                    }
                    match locks.cleanup_stale() {
                        Ok(0) => {}
                        Ok(n) => log::info!("reclaimed {} stale issue lock(s)", n),
                        Err(e) => log::warn!("lock cleanup failed: {}", e),
                    }
                }
            }
        })
    }

    #[cfg(unix)]
    async fn wait_for_shutdown_signal(&self) -> Result<()> {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())
            .map_err(|e| RepoPilotError::state(format!("signal handler: {}", e)))?;
        let mut sighup = signal(SignalKind::hangup())
            .map_err(|e| RepoPilotError::state(format!("signal handler: {}", e)))?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => log::info!("SIGINT received"),
            _ = sigterm.recv() => log::info!("SIGTERM received"),
            _ = sighup.recv() => log::info!("SIGHUP received"),
        }
        Ok(())
    }

    #[cfg(not(unix))]
    async fn wait_for_shutdown_signal(&self) -> Result<()> {
        let _ = tokio::signal::ctrl_c().await;
        log::info!("interrupt received");
        Ok(())
    }

    /// Draining shutdown: stop discovery, wait for in-flight workers,
    /// persist the remaining queue, release our locks, drop the process
    /// lock. Already-started children are never interrupted.
    pub async fn shutdown(&self) -> Result<()> {
        if self.draining.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        log::info!("draining: no new tasks will be accepted");
        self.queue.set_draining(true);
        self.scheduler.shutdown();
        self.pool.shutdown(DRAIN_GRACE).await;

        let pending = self.queue.drain_pending();
        if !pending.is_empty() {
            log::info!("persisting {} pending task(s)", pending.len());
        }
        self.store.save_pending_tasks(&pending).await?;
        self.store
            .save_queue_state(&self.queue.scheduling_snapshot())
            .await?;

        let released = self.locks.release_all_for_pid(std::process::id())?;
        if released > 0 {
            log::info!("released {} issue lock(s)", released);
        }
        self.store.release_process_lock().await?;
        log::info!("shutdown complete");
        Ok(())
    }

    // ----- admin surface ---------------------------------------------

    /// Current daemon status.
    pub fn status(&self) -> DaemonStatus {
        DaemonStatus {
            pid: std::process::id(),
            started_at: self.started_at,
            draining: self.draining.load(Ordering::SeqCst),
            dry_run: self.dry_run,
            queued: self.queue.depth(),
            running: self.queue.running_count(),
            workers: self.pool.worker_ids().len(),
            projects: self.projects.lock().unwrap().len(),
        }
    }

    /// Effective configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Registered projects.
    pub fn list_projects(&self) -> Vec<ProjectConfig> {
        self.projects.lock().unwrap().clone()
    }

    /// Register a new project or update an existing one; the change is
    /// persisted and takes effect immediately.
    pub async fn upsert_project(&self, project: ProjectConfig) -> Result<()> {
        {
            let mut projects = self.projects.lock().unwrap();
            match projects.iter_mut().find(|p| p.id == project.id) {
                Some(existing) => *existing = project.clone(),
                None => projects.push(project.clone()),
            }
        }
        let snapshot = self.projects.lock().unwrap().clone();
        self.store.save_projects(&snapshot).await?;
        if project.enabled {
            self.attach_project(&project);
        } else {
            self.scheduler.unregister_project(&project.id);
        }
        Ok(())
    }

    /// Unregister a project: its poller stops now, its queued tasks are
    /// cancelled, in-flight tasks run to completion.
    pub async fn unregister_project(&self, project_id: &str) -> Result<bool> {
        let removed = {
            let mut projects = self.projects.lock().unwrap();
            let before = projects.len();
            projects.retain(|p| p.id != project_id);
            projects.len() != before
        };
        if removed {
            let snapshot = self.projects.lock().unwrap().clone();
            self.store.save_projects(&snapshot).await?;
            self.scheduler.unregister_project(project_id);
            let cancelled = self.queue.unregister_project(project_id);
            if !cancelled.is_empty() {
                log::info!(
                    "cancelled {} queued task(s) of project {}",
                    cancelled.len(),
                    project_id
                );
            }
        }
        Ok(removed)
    }

    /// Queued tasks (admin surface).
    pub fn list_queued(&self) -> Vec<Task> {
        self.queue.queued_snapshot()
    }

    /// Running tasks (admin surface).
    pub fn list_running(&self) -> Vec<Task> {
        self.queue.running_snapshot()
    }

    /// Admit a task supplied by the admin layer.
    pub fn add_task(&self, task: Task) -> Result<String> {
        self.queue.enqueue(task).map_err(Into::into)
    }

    /// Remove a queued task.
    pub fn remove_task(&self, task_id: &str) -> Option<Task> {
        self.queue.remove_queued(task_id)
    }

    /// Worker slot identities.
    pub fn list_workers(&self) -> Vec<String> {
        self.pool.worker_ids()
    }

    /// Abort and replace one worker slot.
    pub fn restart_worker(&self, worker_id: &str) -> bool {
        self.pool.restart_worker(worker_id)
    }

    /// Queue statistics, including the fairness index.
    pub fn queue_statistics(&self) -> QueueStatistics {
        self.queue.statistics()
    }

    /// Outcome counters from the result handler.
    pub fn result_counters(&self) -> ResultCounters {
        self.results.counters()
    }

    /// Projects currently being polled.
    pub fn polling_projects(&self) -> Vec<String> {
        self.scheduler.active_projects()
    }

    /// Rate-limiter admission view (admin surface).
    pub fn rate_check(&self) -> crate::core::rate_limit::LimitCheck {
        self.limiter.check(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TestConfigBuilder;
    use crate::core::task::{IssuePayload, TaskKind};
    use tempfile::TempDir;

    fn config_for(dir: &TempDir) -> Config {
        TestConfigBuilder::new()
            .with_state_dir(dir.path())
            .with_max_concurrent(1)
            .build_config()
    }

    fn sample_task(issue: u64) -> Task {
        Task::new(
            "demo",
            issue,
            TaskKind::Issue(IssuePayload {
                number: issue,
                title: "t".into(),
                body: String::new(),
                labels: vec![],
                author: None,
                created_at: None,
            }),
            50,
        )
    }

    #[tokio::test]
    async fn test_second_instance_exits_cleanly() {
        let dir = TempDir::new().unwrap();
        let first = Supervisor::bootstrap(config_for(&dir), true)
            .await
            .unwrap()
            .expect("first instance acquires the lock");
        let second = Supervisor::bootstrap(config_for(&dir), true).await.unwrap();
        assert!(second.is_none(), "second instance must stand down");
        first.shutdown().await.unwrap();

        // After a clean shutdown the lock is free again
        let third = Supervisor::bootstrap(config_for(&dir), true).await.unwrap();
        assert!(third.is_some());
    }

    #[tokio::test]
    async fn test_pending_tasks_survive_restart() {
        let dir = TempDir::new().unwrap();

        let supervisor = Supervisor::bootstrap(config_for(&dir), true)
            .await
            .unwrap()
            .unwrap();
        for issue in 1..=5 {
            supervisor.add_task(sample_task(issue)).unwrap();
        }
        assert_eq!(supervisor.status().queued, 5);
        supervisor.shutdown().await.unwrap();

        let restarted = Supervisor::bootstrap(config_for(&dir), true)
            .await
            .unwrap()
            .unwrap();
        let queued = restarted.list_queued();
        assert_eq!(queued.len(), 5);
        let issues: std::collections::HashSet<u64> =
            queued.iter().map(|t| t.issue_number).collect();
        assert_eq!(issues, (1..=5).collect());
        restarted.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_restore_orders_by_priority_then_age() {
        let dir = TempDir::new().unwrap();
        let supervisor = Supervisor::bootstrap(config_for(&dir), true)
            .await
            .unwrap()
            .unwrap();
        let mut low = sample_task(1);
        low.base_priority = 10;
        let mut high = sample_task(2);
        high.base_priority = 90;
        supervisor.add_task(low).unwrap();
        supervisor.add_task(high).unwrap();
        supervisor.shutdown().await.unwrap();

        let restarted = Supervisor::bootstrap(config_for(&dir), true)
            .await
            .unwrap()
            .unwrap();
        let queued = restarted.list_queued();
        assert_eq!(queued[0].issue_number, 2);
        assert_eq!(queued[1].issue_number, 1);
        restarted.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_project_upsert_and_unregister() {
        let dir = TempDir::new().unwrap();
        let supervisor = Supervisor::bootstrap(config_for(&dir), true)
            .await
            .unwrap()
            .unwrap();

        let mut project = ProjectConfig::new("demo", "octo", "repo");
        project.enabled = false;
        supervisor.upsert_project(project.clone()).await.unwrap();
        assert_eq!(supervisor.list_projects().len(), 1);

        // The registration is persisted for the next startup
        let on_disk = supervisor.store.load_projects().unwrap();
        assert_eq!(on_disk.len(), 1);

        assert!(supervisor.unregister_project("demo").await.unwrap());
        assert!(supervisor.list_projects().is_empty());
        assert!(!supervisor.unregister_project("demo").await.unwrap());
        supervisor.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_status_reflects_draining() {
        let dir = TempDir::new().unwrap();
        let supervisor = Supervisor::bootstrap(config_for(&dir), true)
            .await
            .unwrap()
            .unwrap();
        assert!(!supervisor.status().draining);
        supervisor.shutdown().await.unwrap();
        assert!(supervisor.status().draining);
    }
}
