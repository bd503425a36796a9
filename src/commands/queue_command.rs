//! `queue` command: list, add, or remove pending tasks on disk.
//!
//! These operations work directly against the state directory. A running
//! daemon loads the pending file only at startup, so mutations made while
//! it runs take effect on the next restart; a warning says so.

use std::sync::Arc;
use tabled::{Table, Tabled};

use crate::cli::{print_success, print_warning, QueueAction, QueueArgs};
use crate::config::ConfigService;
use crate::core::state::{pid_alive, StateStore};
use crate::core::task::{CustomPayload, Task, TaskKind};
use crate::error::RepoPilotError;
use crate::Result;

#[derive(Tabled)]
struct PendingRow {
    #[tabled(rename = "Task")]
    id: String,
    #[tabled(rename = "Project")]
    project: String,
    #[tabled(rename = "Issue")]
    issue: u64,
    #[tabled(rename = "Kind")]
    kind: String,
    #[tabled(rename = "Priority")]
    priority: u8,
    #[tabled(rename = "Enqueued")]
    enqueued: String,
}

fn warn_if_daemon_running(store: &StateStore) -> Result<()> {
    if let Some(info) = store.read_process_lock()? {
        if pid_alive(info.pid) {
            print_warning(&format!(
                "daemon is running (pid {}); queue changes apply at its next restart",
                info.pid
            ));
        }
    }
    Ok(())
}

/// Execute one queue operation against the state directory.
pub async fn execute_with_config(
    args: QueueArgs,
    config_service: Arc<dyn ConfigService>,
) -> Result<()> {
    let config = config_service.get_config()?;
    let state_dir = args
        .state_dir
        .unwrap_or_else(|| config.daemon.resolved_state_dir());
    let store = StateStore::new(&state_dir)?;

    match args.action {
        QueueAction::List { json } => {
            let pending = store.load_pending_tasks()?;
            if json {
                println!("{}", serde_json::to_string_pretty(&pending)?);
                return Ok(());
            }
            if pending.is_empty() {
                println!("pending queue is empty");
                return Ok(());
            }
            let rows: Vec<PendingRow> = pending
                .iter()
                .map(|t| PendingRow {
                    id: t.id.clone(),
                    project: t.project_id.clone(),
                    issue: t.issue_number,
                    kind: t.kind.name().to_string(),
                    priority: t.effective_priority,
                    enqueued: t.enqueued_at.format("%Y-%m-%d %H:%M:%S").to_string(),
                })
                .collect();
            println!("{}", Table::new(rows));
            Ok(())
        }
        QueueAction::Add {
            project,
            issue,
            title,
            priority,
        } => {
            if priority > 100 {
                return Err(RepoPilotError::validation("priority must be within [0, 100]"));
            }
            warn_if_daemon_running(&store)?;
            let mut pending = store.load_pending_tasks()?;
            if pending
                .iter()
                .any(|t| t.project_id == project && t.issue_number == issue)
            {
                return Err(RepoPilotError::validation(format!(
                    "a pending task for {}#{} already exists",
                    project, issue
                )));
            }
            let task = Task::new(
                &project,
                issue,
                TaskKind::Custom(CustomPayload {
                    name: title,
                    data: serde_json::Value::Null,
                }),
                priority,
            );
            let id = task.id.clone();
            pending.push(task);
            store.save_pending_tasks(&pending).await?;
            print_success(&format!("task {} added to the pending queue", id));
            Ok(())
        }
        QueueAction::Remove { task_id } => {
            warn_if_daemon_running(&store)?;
            let mut pending = store.load_pending_tasks()?;
            let before = pending.len();
            pending.retain(|t| t.id != task_id);
            if pending.len() == before {
                return Err(RepoPilotError::validation(format!(
                    "no pending task with id {}",
                    task_id
                )));
            }
            store.save_pending_tasks(&pending).await?;
            print_success(&format!("task {} removed", task_id));
            Ok(())
        }
    }
}
