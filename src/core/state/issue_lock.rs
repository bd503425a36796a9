//! Per-issue mutual-exclusion locks.
//!
//! One lock file per `(project, issue)` guarantees at most one concurrent
//! worker per issue, across threads and across processes sharing the same
//! state directory. A lock is valid iff the holder PID is alive and the
//! TTL has not elapsed; anything else is stale and reclaimable.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::PathBuf;

use super::pid_alive;
use crate::core::task::IssueRef;
use crate::Result;

/// Identity of the worker holding an issue lock.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockHolder {
    pub pid: u32,
    pub worker_id: String,
    pub task_id: String,
    /// Present when the supervisor tracks a session; never consulted for
    /// lock validity.
    #[serde(default)]
    pub session_id: Option<String>,
}

/// On-disk contents of one issue lock file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IssueLock {
    pub locked_at: DateTime<Utc>,
    pub holder: LockHolder,
    /// Validity window in seconds from `locked_at`
    pub ttl_secs: u64,
}

impl IssueLock {
    /// Whether this lock still excludes other workers.
    pub fn is_valid(&self, now: DateTime<Utc>) -> bool {
        pid_alive(self.holder.pid)
            && now - self.locked_at < ChronoDuration::seconds(self.ttl_secs as i64)
    }
}

/// Default lock validity window.
const DEFAULT_TTL_SECS: u64 = 3_600;

/// Manager for the `locks/` directory of a state store.
pub struct IssueLockManager {
    dir: PathBuf,
    ttl_secs: u64,
}

impl IssueLockManager {
    /// Create a manager over an existing locks directory.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            ttl_secs: DEFAULT_TTL_SECS,
        }
    }

    /// Override the lock TTL (primarily for tests).
    pub fn with_ttl_secs(mut self, ttl_secs: u64) -> Self {
        self.ttl_secs = ttl_secs;
        self
    }

    fn lock_path(&self, issue: &IssueRef) -> PathBuf {
        self.dir
            .join(format!("{}-{}.lock", issue.project_id, issue.issue_number))
    }

    /// Try to acquire the lock for an issue.
    ///
    /// Creation is atomic (`O_EXCL` semantics): exactly one of several
    /// concurrent callers wins. A stale lock (dead holder or elapsed TTL)
    /// is removed and acquisition retried once.
    pub fn acquire(&self, issue: &IssueRef, holder: LockHolder) -> Result<bool> {
        let lock = IssueLock {
            locked_at: Utc::now(),
            holder,
            ttl_secs: self.ttl_secs,
        };
        let bytes = serde_json::to_vec_pretty(&lock)?;
        for attempt in 0..2 {
            match fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(self.lock_path(issue))
            {
                Ok(mut file) => {
                    file.write_all(&bytes)?;
                    file.sync_all()?;
                    return Ok(true);
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    if attempt == 0 && self.reclaim_if_stale(issue)? {
                        continue;
                    }
                    return Ok(false);
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(false)
    }

    /// Release the lock iff the caller's PID owns it.
    ///
    /// Returns `true` when a lock was actually removed.
    pub fn release(&self, issue: &IssueRef, pid: u32) -> Result<bool> {
        match self.check(issue)? {
            Some(lock) if lock.holder.pid == pid => {
                fs::remove_file(self.lock_path(issue))?;
                Ok(true)
            }
            Some(_) => {
                log::warn!("refusing to release {}: not the holder", issue);
                Ok(false)
            }
            None => Ok(false),
        }
    }

    /// Current lock for an issue, if the file exists and parses.
    pub fn check(&self, issue: &IssueRef) -> Result<Option<IssueLock>> {
        let path = self.lock_path(issue);
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&path)?;
        match serde_json::from_str(&content) {
            Ok(lock) => Ok(Some(lock)),
            Err(e) => {
                log::warn!("lock file for {} unparseable ({}), treating as stale", issue, e);
                Ok(None)
            }
        }
    }

    fn reclaim_if_stale(&self, issue: &IssueRef) -> Result<bool> {
        let stale = match self.check(issue)? {
            Some(lock) => !lock.is_valid(Utc::now()),
            // Unparseable or vanished: reclaimable either way
            None => true,
        };
        if stale {
            match fs::remove_file(self.lock_path(issue)) {
                Ok(()) => {
                    log::info!("reclaimed stale issue lock for {}", issue);
                    Ok(true)
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(true),
                Err(e) => Err(e.into()),
            }
        } else {
            Ok(false)
        }
    }

    /// Remove every stale lock in the directory; returns how many fell.
    pub fn cleanup_stale(&self) -> Result<usize> {
        let now = Utc::now();
        let mut removed = 0;
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().map(|e| e != "lock").unwrap_or(true) {
                continue;
            }
            let stale = match fs::read_to_string(&path) {
                Ok(content) => match serde_json::from_str::<IssueLock>(&content) {
                    Ok(lock) => !lock.is_valid(now),
                    Err(_) => true,
                },
                Err(_) => true,
            };
            if stale && fs::remove_file(&path).is_ok() {
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Release every lock held by the given PID (shutdown path).
    pub fn release_all_for_pid(&self, pid: u32) -> Result<usize> {
        let mut released = 0;
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().map(|e| e != "lock").unwrap_or(true) {
                continue;
            }
            if let Ok(content) = fs::read_to_string(&path) {
                if let Ok(lock) = serde_json::from_str::<IssueLock>(&content) {
                    if lock.holder.pid == pid && fs::remove_file(&path).is_ok() {
                        released += 1;
                    }
                }
            }
        }
        Ok(released)
    }

    fn write_raw(&self, issue: &IssueRef, lock: &IssueLock) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(lock)?;
        crate::core::state::StateStore::atomic_write(&self.lock_path(issue), &bytes)
    }

    /// Plant a lock regardless of current state (test/recovery helper).
    #[doc(hidden)]
    pub fn force_write(&self, issue: &IssueRef, lock: &IssueLock) -> Result<()> {
        self.write_raw(issue, lock)
    }
}

/// Convenience constructor for the common acquire call.
pub fn holder_for(worker_id: &str, task_id: &str) -> LockHolder {
    LockHolder {
        pid: std::process::id(),
        worker_id: worker_id.to_string(),
        task_id: task_id.to_string(),
        session_id: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn manager() -> (TempDir, IssueLockManager) {
        let dir = TempDir::new().unwrap();
        let mgr = IssueLockManager::new(dir.path());
        (dir, mgr)
    }

    fn holder(task: &str) -> LockHolder {
        holder_for("w-test", task)
    }

    #[test]
    fn test_acquire_then_conflict() {
        let (_dir, mgr) = manager();
        let issue = IssueRef::new("demo", 9);
        assert!(mgr.acquire(&issue, holder("t1")).unwrap());
        // Second acquire by a live holder fails
        assert!(!mgr.acquire(&issue, holder("t2")).unwrap());
        let lock = mgr.check(&issue).unwrap().unwrap();
        assert_eq!(lock.holder.task_id, "t1");
    }

    #[test]
    fn test_release_requires_ownership() {
        let (_dir, mgr) = manager();
        let issue = IssueRef::new("demo", 9);
        assert!(mgr.acquire(&issue, holder("t1")).unwrap());
        assert!(!mgr.release(&issue, std::process::id() + 1).unwrap());
        assert!(mgr.release(&issue, std::process::id()).unwrap());
        assert!(mgr.check(&issue).unwrap().is_none());
    }

    #[test]
    fn test_dead_holder_is_reclaimed() {
        let (_dir, mgr) = manager();
        let issue = IssueRef::new("demo", 3);
        let dead = IssueLock {
            locked_at: Utc::now(),
            holder: LockHolder {
                pid: 0,
                worker_id: "w-gone".into(),
                task_id: "t-gone".into(),
                session_id: None,
            },
            ttl_secs: 3_600,
        };
        mgr.force_write(&issue, &dead).unwrap();
        assert!(mgr.acquire(&issue, holder("t-new")).unwrap());
        assert_eq!(mgr.check(&issue).unwrap().unwrap().holder.task_id, "t-new");
    }

    #[test]
    fn test_expired_ttl_is_reclaimed() {
        let (_dir, mgr) = manager();
        let issue = IssueRef::new("demo", 4);
        let expired = IssueLock {
            locked_at: Utc::now() - ChronoDuration::seconds(10),
            holder: holder("t-old"),
            ttl_secs: 1,
        };
        mgr.force_write(&issue, &expired).unwrap();
        assert!(mgr.acquire(&issue, holder("t-new")).unwrap());
    }

    #[test]
    fn test_cleanup_stale_counts() {
        let (_dir, mgr) = manager();
        let live = IssueRef::new("demo", 1);
        assert!(mgr.acquire(&live, holder("t-live")).unwrap());

        let dead_issue = IssueRef::new("demo", 2);
        let dead = IssueLock {
            locked_at: Utc::now(),
            holder: LockHolder {
                pid: 0,
                worker_id: "w".into(),
                task_id: "t".into(),
                session_id: None,
            },
            ttl_secs: 3_600,
        };
        mgr.force_write(&dead_issue, &dead).unwrap();

        assert_eq!(mgr.cleanup_stale().unwrap(), 1);
        assert!(mgr.check(&live).unwrap().is_some());
        assert!(mgr.check(&dead_issue).unwrap().is_none());
    }

    #[test]
    fn test_concurrent_acquire_single_winner() {
        let (_dir, mgr) = manager();
        let mgr = std::sync::Arc::new(mgr);
        let issue = IssueRef::new("demo", 77);
        let mut handles = Vec::new();
        for i in 0..8 {
            let mgr = std::sync::Arc::clone(&mgr);
            let issue = issue.clone();
            handles.push(std::thread::spawn(move || {
                mgr.acquire(&issue, holder(&format!("t{}", i))).unwrap()
            }));
        }
        let wins: usize = handles
            .into_iter()
            .map(|h| h.join().unwrap() as usize)
            .sum();
        assert_eq!(wins, 1);
    }
}
