//! `status` command: inspect a daemon's persistent state directory.

use std::sync::Arc;
use tabled::{Table, Tabled};

use crate::cli::{print_warning, StatusArgs};
use crate::config::ConfigService;
use crate::core::state::{pid_alive, StateStore};
use crate::Result;

#[derive(Tabled)]
struct TaskRow {
    #[tabled(rename = "Task")]
    id: String,
    #[tabled(rename = "Project")]
    project: String,
    #[tabled(rename = "Issue")]
    issue: u64,
    #[tabled(rename = "Kind")]
    kind: String,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "Priority")]
    priority: u8,
    #[tabled(rename = "Attempts")]
    attempts: u32,
}

#[derive(Tabled)]
struct ProjectRow {
    #[tabled(rename = "Project")]
    id: String,
    #[tabled(rename = "Repository")]
    repo: String,
    #[tabled(rename = "Enabled")]
    enabled: bool,
    #[tabled(rename = "Base prio")]
    base_priority: u8,
    #[tabled(rename = "Weight")]
    share_weight: f64,
}

/// Render the daemon, queue, and project state from disk.
pub async fn execute_with_config(
    args: StatusArgs,
    config_service: Arc<dyn ConfigService>,
) -> Result<()> {
    let config = config_service.get_config()?;
    let state_dir = args
        .state_dir
        .unwrap_or_else(|| config.daemon.resolved_state_dir());
    let store = StateStore::new(&state_dir)?;

    let lock = store.read_process_lock()?;
    let pending = store.load_pending_tasks()?;
    let running = store.load_running_tasks()?;
    let projects = store.load_projects()?;

    if args.json {
        let daemon = lock.as_ref().map(|info| {
            serde_json::json!({
                "pid": info.pid,
                "started_at": info.started_at,
                "host": info.host,
                "alive": pid_alive(info.pid),
            })
        });
        let report = serde_json::json!({
            "state_dir": state_dir,
            "daemon": daemon,
            "pending_tasks": pending,
            "running_tasks": running,
            "projects": projects,
        });
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("State directory: {}", state_dir.display());
    match lock {
        Some(info) if pid_alive(info.pid) => {
            println!(
                "Daemon: running (pid {}, started {})",
                info.pid,
                info.started_at.format("%Y-%m-%d %H:%M:%S UTC")
            );
        }
        Some(info) => {
            print_warning(&format!(
                "Daemon: stale lock from pid {} (not running)",
                info.pid
            ));
        }
        None => println!("Daemon: not running"),
    }
    println!(
        "Tasks: {} pending, {} running",
        pending.len(),
        running.len()
    );

    if !projects.is_empty() {
        let rows: Vec<ProjectRow> = projects
            .iter()
            .map(|p| ProjectRow {
                id: p.id.clone(),
                repo: format!("{}/{}", p.owner, p.repo),
                enabled: p.enabled,
                base_priority: p.base_priority,
                share_weight: p.share_weight,
            })
            .collect();
        println!("\n{}", Table::new(rows));
    }

    if !pending.is_empty() {
        let rows: Vec<TaskRow> = pending
            .iter()
            .map(|t| TaskRow {
                id: t.id.clone(),
                project: t.project_id.clone(),
                issue: t.issue_number,
                kind: t.kind.name().to_string(),
                status: t.status.to_string(),
                priority: t.effective_priority,
                attempts: t.attempts,
            })
            .collect();
        println!("\n{}", Table::new(rows));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::StatusArgs;
    use crate::config::TestConfigBuilder;

    #[tokio::test]
    async fn test_status_runs_against_empty_state_dir() {
        let dir = tempfile::tempdir().unwrap();
        let service = Arc::new(
            TestConfigBuilder::new()
                .with_state_dir(dir.path())
                .build_service(),
        );
        let args = StatusArgs {
            state_dir: None,
            json: true,
        };
        execute_with_config(args, service).await.unwrap();
    }
}
