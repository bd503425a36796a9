//! Persistent state layer: atomic file-backed store and per-issue locks.
//!
//! Everything the daemon must remember across restarts lives in a single
//! state directory. All writes go through write-temp + fsync + rename so a
//! crash mid-write leaves either the old or the new file intact, never a
//! truncated one.

mod issue_lock;
mod store;

pub use issue_lock::{holder_for, IssueLock, IssueLockManager, LockHolder};
pub use store::{ProcessLockInfo, StateStore};

/// Check whether a process with the given PID is currently alive.
///
/// Signal 0 probes existence without delivering anything; `EPERM` means
/// the process exists but belongs to another user, which still counts as
/// alive for lock-validity purposes.
#[cfg(unix)]
pub fn pid_alive(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }
    let ret = unsafe { libc::kill(pid as libc::pid_t, 0) };
    if ret == 0 {
        true
    } else {
        std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
    }
}

/// On non-unix platforms a PID cannot be probed cheaply; treat every
/// recorded holder as dead so stale locks are always reclaimable.
#[cfg(not(unix))]
pub fn pid_alive(_pid: u32) -> bool {
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_own_pid_is_alive() {
        assert!(pid_alive(std::process::id()));
    }

    #[test]
    fn test_pid_zero_is_dead() {
        assert!(!pid_alive(0));
    }

    #[cfg(unix)]
    #[test]
    fn test_exited_child_is_dead() {
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let pid = child.id();
        child.wait().unwrap();
        assert!(!pid_alive(pid));
    }
}
