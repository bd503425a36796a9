//! Atomic, file-backed persistence for daemon state.
//!
//! The store owns the state directory layout:
//!
//! ```text
//! <state>/process.lock          single-instance lock (JSON)
//! <state>/running-tasks.json    tasks with a live child process
//! <state>/pending-tasks.json    queued tasks preserved across restarts
//! <state>/processed-issues.json issues handled in the current window
//! <state>/projects.json         registered project configurations
//! <state>/queue.json            scheduling-state snapshot
//! <state>/locks/                per-issue lock files
//! <state>/results/{success,error,archive}/
//! <state>/logs/
//! ```
//!
//! Writers within the process are serialized by an async mutex; writers in
//! other processes are excluded by the process lock.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

use super::pid_alive;
use crate::config::ProjectConfig;
use crate::core::task::{IssueRef, RunningTaskRecord, Task};
use crate::error::RepoPilotError;
use crate::Result;

/// Contents of the `process.lock` file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessLockInfo {
    pub pid: u32,
    pub started_at: DateTime<Utc>,
    pub host: String,
}

/// Upper bound on remembered processed issues; the oldest entries fall
/// out of the observation window first.
const PROCESSED_WINDOW: usize = 10_000;

/// Durable, atomic persistence rooted at a local directory.
pub struct StateStore {
    root: PathBuf,
    write_lock: Mutex<()>,
    processed: std::sync::Mutex<ProcessedCache>,
}

#[derive(Default)]
struct ProcessedCache {
    order: Vec<IssueRef>,
    set: std::collections::HashSet<IssueRef>,
}

impl StateStore {
    /// Open (creating if necessary) a state directory.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        for sub in [
            "locks",
            "results/success",
            "results/error",
            "results/archive",
            "logs",
            "scratch",
        ] {
            fs::create_dir_all(root.join(sub))?;
        }
        let store = Self {
            root,
            write_lock: Mutex::new(()),
            processed: std::sync::Mutex::new(ProcessedCache::default()),
        };
        store.prime_processed_cache()?;
        Ok(store)
    }

    /// Root directory of this store.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding per-issue lock files.
    pub fn locks_dir(&self) -> PathBuf {
        self.root.join("locks")
    }

    /// Directory holding per-task scratch files (pid/status/result).
    pub fn scratch_dir(&self) -> PathBuf {
        self.root.join("scratch")
    }

    /// Directory holding persisted task results.
    pub fn results_dir(&self) -> PathBuf {
        self.root.join("results")
    }

    fn path(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    // ----- atomic write primitive -------------------------------------

    /// Write `bytes` to `path` atomically: temp file in the same
    /// directory, fsync, then rename over the destination.
    pub fn atomic_write(path: &Path, bytes: &[u8]) -> Result<()> {
        let dir = path
            .parent()
            .ok_or_else(|| RepoPilotError::state(format!("no parent dir for {}", path.display())))?;
        let tmp = dir.join(format!(
            ".{}.tmp-{}",
            path.file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| "state".to_string()),
            std::process::id()
        ));
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(bytes)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, path)?;
        Ok(())
    }

    async fn write_json<T: Serialize>(&self, name: &str, value: &T) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let bytes = serde_json::to_vec_pretty(value)?;
        Self::atomic_write(&self.path(name), &bytes)
    }

    fn read_json<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>> {
        let path = self.path(name);
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&path)?;
        Ok(Some(serde_json::from_str(&content)?))
    }

    // ----- process lock ----------------------------------------------

    /// Try to acquire the single-instance process lock.
    ///
    /// Succeeds iff no lock file exists or the recorded PID is no longer
    /// alive (the stale lock is reclaimed). Returns `false` when another
    /// live instance holds it.
    pub async fn acquire_process_lock(&self) -> Result<bool> {
        let _guard = self.write_lock.lock().await;
        let path = self.path("process.lock");
        if let Ok(content) = fs::read_to_string(&path) {
            match serde_json::from_str::<ProcessLockInfo>(&content) {
                Ok(info) if info.pid != std::process::id() && pid_alive(info.pid) => {
                    return Ok(false);
                }
                Ok(info) => {
                    log::info!("reclaiming stale process lock held by pid {}", info.pid);
                }
                Err(e) => {
                    log::warn!("process lock file unparseable ({}), reclaiming", e);
                }
            }
        }
        let info = ProcessLockInfo {
            pid: std::process::id(),
            started_at: Utc::now(),
            host: std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string()),
        };
        Self::atomic_write(&path, &serde_json::to_vec_pretty(&info)?)?;
        Ok(true)
    }

    /// Release the process lock iff this process owns it.
    pub async fn release_process_lock(&self) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let path = self.path("process.lock");
        if let Ok(content) = fs::read_to_string(&path) {
            if let Ok(info) = serde_json::from_str::<ProcessLockInfo>(&content) {
                if info.pid != std::process::id() {
                    return Ok(());
                }
            }
        }
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Current holder of the process lock, if any.
    pub fn read_process_lock(&self) -> Result<Option<ProcessLockInfo>> {
        self.read_json("process.lock")
    }

    // ----- running tasks ---------------------------------------------

    /// Load the running-task registry.
    pub fn load_running_tasks(&self) -> Result<HashMap<String, RunningTaskRecord>> {
        Ok(self.read_json("running-tasks.json")?.unwrap_or_default())
    }

    /// Replace the running-task registry.
    pub async fn save_running_tasks(
        &self,
        tasks: &HashMap<String, RunningTaskRecord>,
    ) -> Result<()> {
        self.write_json("running-tasks.json", tasks).await
    }

    /// Insert one running-task record.
    pub async fn add_running_task(&self, record: RunningTaskRecord) -> Result<()> {
        let mut tasks = self.load_running_tasks()?;
        tasks.insert(record.task_id.clone(), record);
        self.save_running_tasks(&tasks).await
    }

    /// Remove one running-task record.
    pub async fn remove_running_task(&self, task_id: &str) -> Result<()> {
        let mut tasks = self.load_running_tasks()?;
        if tasks.remove(task_id).is_some() {
            self.save_running_tasks(&tasks).await?;
        }
        Ok(())
    }

    // ----- pending tasks ---------------------------------------------

    /// Load queued tasks persisted at the last shutdown.
    ///
    /// A corrupt file is salvaged record by record: unparseable entries
    /// are logged and skipped, never discarded wholesale.
    pub fn load_pending_tasks(&self) -> Result<Vec<Task>> {
        let path = self.path("pending-tasks.json");
        if !path.exists() {
            return Ok(Vec::new());
        }
        let content = fs::read_to_string(&path)?;
        let values: Vec<serde_json::Value> = match serde_json::from_str(&content) {
            Ok(serde_json::Value::Array(items)) => items,
            Ok(_) => {
                log::warn!("pending-tasks.json is not an array, ignoring");
                return Ok(Vec::new());
            }
            Err(e) => {
                log::warn!("pending-tasks.json unparseable ({}), ignoring", e);
                return Ok(Vec::new());
            }
        };
        let mut tasks = Vec::with_capacity(values.len());
        for value in values {
            match serde_json::from_value::<Task>(value) {
                Ok(task) => tasks.push(task),
                Err(e) => log::warn!("discarding unparseable pending task: {}", e),
            }
        }
        Ok(tasks)
    }

    /// Persist queued tasks for the next startup.
    pub async fn save_pending_tasks(&self, tasks: &[Task]) -> Result<()> {
        self.write_json("pending-tasks.json", &tasks).await
    }

    // ----- processed issues ------------------------------------------

    fn prime_processed_cache(&self) -> Result<()> {
        let refs: Vec<IssueRef> = self.read_json("processed-issues.json")?.unwrap_or_default();
        let mut cache = self.processed.lock().unwrap();
        cache.set = refs.iter().cloned().collect();
        cache.order = refs;
        Ok(())
    }

    /// Whether an issue was already handled in the current window.
    pub fn is_issue_processed(&self, issue: &IssueRef) -> bool {
        self.processed.lock().unwrap().set.contains(issue)
    }

    /// Record an issue as handled, evicting the oldest entries beyond
    /// the window bound.
    pub async fn mark_issue_processed(&self, issue: IssueRef) -> Result<()> {
        let snapshot = {
            let mut cache = self.processed.lock().unwrap();
            if !cache.set.insert(issue.clone()) {
                return Ok(());
            }
            cache.order.push(issue);
            while cache.order.len() > PROCESSED_WINDOW {
                let evicted = cache.order.remove(0);
                cache.set.remove(&evicted);
            }
            cache.order.clone()
        };
        self.write_json("processed-issues.json", &snapshot).await
    }

    /// Drop the processed-issue window (admin operation).
    pub async fn clear_processed_issues(&self) -> Result<()> {
        {
            let mut cache = self.processed.lock().unwrap();
            cache.order.clear();
            cache.set.clear();
        }
        self.write_json("processed-issues.json", &Vec::<IssueRef>::new())
            .await
    }

    // ----- project registry ------------------------------------------

    /// Load the persisted project registry.
    pub fn load_projects(&self) -> Result<Vec<ProjectConfig>> {
        Ok(self.read_json("projects.json")?.unwrap_or_default())
    }

    /// Persist the project registry.
    pub async fn save_projects(&self, projects: &[ProjectConfig]) -> Result<()> {
        self.write_json("projects.json", &projects).await
    }

    // ----- queue scheduling snapshot ---------------------------------

    /// Load the scheduling-state snapshot, if one was persisted.
    pub fn load_queue_state<T: DeserializeOwned>(&self) -> Result<Option<T>> {
        self.read_json("queue.json")
    }

    /// Persist the scheduling-state snapshot.
    pub async fn save_queue_state<T: Serialize>(&self, state: &T) -> Result<()> {
        self.write_json("queue.json", state).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::task::{IssuePayload, TaskKind};
    use tempfile::TempDir;

    fn store() -> (TempDir, StateStore) {
        let dir = TempDir::new().unwrap();
        let store = StateStore::new(dir.path()).unwrap();
        (dir, store)
    }

    fn sample_task(project: &str, issue: u64) -> Task {
        Task::new(
            project,
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
    async fn test_process_lock_roundtrip() {
        let (_dir, store) = store();
        assert!(store.acquire_process_lock().await.unwrap());
        let info = store.read_process_lock().unwrap().unwrap();
        assert_eq!(info.pid, std::process::id());
        // Same process can re-acquire its own lock
        assert!(store.acquire_process_lock().await.unwrap());
        store.release_process_lock().await.unwrap();
        assert!(store.read_process_lock().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_stale_lock_reclaimed() {
        let (_dir, store) = store();
        let stale = ProcessLockInfo {
            pid: 0,
            started_at: Utc::now(),
            host: "elsewhere".into(),
        };
        StateStore::atomic_write(
            &store.root().join("process.lock"),
            &serde_json::to_vec(&stale).unwrap(),
        )
        .unwrap();
        assert!(store.acquire_process_lock().await.unwrap());
    }

    #[tokio::test]
    async fn test_running_task_records_roundtrip() {
        let (_dir, store) = store();
        let record = RunningTaskRecord {
            task_id: "demo-1-100".into(),
            project_id: "demo".into(),
            issue_number: 1,
            child_pid: 4242,
            child_started_at: Utc::now(),
            worker_id: "w-1".into(),
        };
        store.add_running_task(record.clone()).await.unwrap();
        let loaded = store.load_running_tasks().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded["demo-1-100"].child_pid, 4242);

        store.remove_running_task("demo-1-100").await.unwrap();
        assert!(store.load_running_tasks().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_pending_tasks_salvage_corrupt_records() {
        let (_dir, store) = store();
        let good = sample_task("demo", 7);
        let mut raw = serde_json::to_value(vec![&good]).unwrap();
        raw.as_array_mut()
            .unwrap()
            .push(serde_json::json!({"garbage": true}));
        StateStore::atomic_write(
            &store.root().join("pending-tasks.json"),
            &serde_json::to_vec(&raw).unwrap(),
        )
        .unwrap();

        let tasks = store.load_pending_tasks().unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].issue_number, 7);
    }

    #[tokio::test]
    async fn test_pending_tasks_totally_corrupt_file() {
        let (_dir, store) = store();
        std::fs::write(store.root().join("pending-tasks.json"), b"{not json").unwrap();
        assert!(store.load_pending_tasks().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_processed_issue_window_survives_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let store = StateStore::new(dir.path()).unwrap();
            store
                .mark_issue_processed(IssueRef::new("demo", 9))
                .await
                .unwrap();
        }
        let reopened = StateStore::new(dir.path()).unwrap();
        assert!(reopened.is_issue_processed(&IssueRef::new("demo", 9)));
        assert!(!reopened.is_issue_processed(&IssueRef::new("demo", 10)));
    }

    #[tokio::test]
    async fn test_atomic_write_replaces_content() {
        let (_dir, store) = store();
        let path = store.root().join("probe.json");
        StateStore::atomic_write(&path, b"first").unwrap();
        StateStore::atomic_write(&path, b"second").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "second");
        // No temp files left behind
        let leftovers: Vec<_> = std::fs::read_dir(store.root())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains(".tmp-"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn test_project_registry_roundtrip() {
        let (_dir, store) = store();
        let projects = vec![crate::config::ProjectConfig::new("demo", "octo", "repo")];
        store.save_projects(&projects).await.unwrap();
        let loaded = store.load_projects().unwrap();
        assert_eq!(loaded, projects);
    }
}
