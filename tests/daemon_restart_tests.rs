//! Restart-safety tests over the supervisor's public API.

use repopilot::config::{Config, TestConfigBuilder};
use repopilot::core::supervisor::Supervisor;
use repopilot::core::task::{IssuePayload, Task, TaskKind};
use std::collections::HashSet;
use tempfile::TempDir;

fn config_for(dir: &TempDir) -> Config {
    TestConfigBuilder::new()
        .with_state_dir(dir.path())
        .with_max_concurrent(1)
        .build_config()
}

fn task_for(issue: u64) -> Task {
    Task::new(
        "demo",
        issue,
        TaskKind::Issue(IssuePayload {
            number: issue,
            title: format!("issue {}", issue),
            body: String::new(),
            labels: vec![],
            author: None,
            created_at: None,
        }),
        50,
    )
}

#[tokio::test]
async fn test_queued_work_is_neither_lost_nor_duplicated_across_restart() {
    let dir = TempDir::new().unwrap();

    let enqueued: HashSet<u64> = (1..=100).collect();
    {
        let daemon = Supervisor::bootstrap(config_for(&dir), true)
            .await
            .unwrap()
            .expect("first instance starts");
        for issue in &enqueued {
            daemon.add_task(task_for(*issue)).unwrap();
        }
        daemon.shutdown().await.unwrap();
    }

    let restarted = Supervisor::bootstrap(config_for(&dir), true)
        .await
        .unwrap()
        .expect("lock is free after clean shutdown");
    let restored: HashSet<u64> = restarted
        .list_queued()
        .iter()
        .map(|t| t.issue_number)
        .collect();

    assert_eq!(restored, enqueued, "restored set equals the enqueued set");
    restarted.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_second_instance_stands_down_without_mutating_state() {
    let dir = TempDir::new().unwrap();
    let first = Supervisor::bootstrap(config_for(&dir), true)
        .await
        .unwrap()
        .expect("first instance starts");
    first.add_task(task_for(7)).unwrap();

    // The second instance must not acquire the lock, and must not have
    // touched the first instance's pending state
    let second = Supervisor::bootstrap(config_for(&dir), true).await.unwrap();
    assert!(second.is_none());
    assert_eq!(first.status().queued, 1);

    first.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_dispatched_tasks_do_not_reappear_after_restart() {
    let dir = TempDir::new().unwrap();
    let daemon = Supervisor::bootstrap(config_for(&dir), true)
        .await
        .unwrap()
        .unwrap();
    for issue in 1..=5 {
        daemon.add_task(task_for(issue)).unwrap();
    }
    // Simulate completions before the crash boundary
    let completed: Vec<_> = (0..2)
        .map(|_| {
            let task = daemon.list_queued().first().cloned().unwrap();
            daemon.remove_task(&task.id).unwrap();
            task.issue_number
        })
        .collect();
    daemon.shutdown().await.unwrap();

    let restarted = Supervisor::bootstrap(config_for(&dir), true)
        .await
        .unwrap()
        .unwrap();
    let restored: HashSet<u64> = restarted
        .list_queued()
        .iter()
        .map(|t| t.issue_number)
        .collect();
    for issue in completed {
        assert!(!restored.contains(&issue), "completed work must not return");
    }
    assert_eq!(restored.len(), 3);
    restarted.shutdown().await.unwrap();
}
