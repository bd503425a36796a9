//! Task model: the unit of work scheduled and executed by the daemon.
//!
//! A task wraps a single discovered issue, comment, or pull-request event
//! together with its scheduling state. Status changes go through
//! [`Task::transition`], which enforces the state machine and records a
//! timestamped history entry for every change.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::error::RepoPilotError;
use crate::Result;

/// Reference to a single issue within a registered project.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IssueRef {
    /// Project identifier
    pub project_id: String,
    /// Issue or pull-request number
    pub issue_number: u64,
}

impl IssueRef {
    /// Build a reference from its parts.
    pub fn new(project_id: impl Into<String>, issue_number: u64) -> Self {
        Self {
            project_id: project_id.into(),
            issue_number,
        }
    }
}

impl fmt::Display for IssueRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.project_id, self.issue_number)
    }
}

/// Snapshot of a discovered issue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IssuePayload {
    pub number: u64,
    pub title: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub labels: Vec<String>,
    pub author: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
}

/// Snapshot of an actionable issue comment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommentPayload {
    pub issue_number: u64,
    pub comment_id: u64,
    pub body: String,
    pub author: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
}

/// Snapshot of an open pull request awaiting review.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrPayload {
    pub number: u64,
    pub title: String,
    #[serde(default)]
    pub body: String,
    pub head_ref: Option<String>,
    pub base_ref: Option<String>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Free-form payload for tasks created by follow-up actions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomPayload {
    pub name: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

/// Closed set of task kinds, each carrying its own payload shape.
///
/// The worker dispatches on this tag; there is no runtime subclassing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload", rename_all = "kebab-case")]
pub enum TaskKind {
    Issue(IssuePayload),
    Comment(CommentPayload),
    PrReview(PrPayload),
    Custom(CustomPayload),
}

impl TaskKind {
    /// Stable name used in counters and result routing.
    pub fn name(&self) -> &'static str {
        match self {
            TaskKind::Issue(_) => "issue",
            TaskKind::Comment(_) => "comment",
            TaskKind::PrReview(_) => "pr-review",
            TaskKind::Custom(_) => "custom",
        }
    }
}

/// Lifecycle status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskStatus {
    Queued,
    Assigned,
    Running,
    Completed,
    Failed,
    Retrying,
    Cancelled,
    Stalled,
}

impl TaskStatus {
    /// Whether a task in this status still occupies the per-issue slot.
    ///
    /// At most one task per `(project, issue)` may be in an active status
    /// at any instant.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            TaskStatus::Queued | TaskStatus::Assigned | TaskStatus::Running | TaskStatus::Retrying
        )
    }

    /// Whether this status ends the task's lifecycle.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Cancelled | TaskStatus::Failed
        )
    }

    fn can_transition_to(&self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Queued, Assigned)
                | (Queued, Cancelled)
                | (Assigned, Running)
                | (Assigned, Queued)
                | (Assigned, Cancelled)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
                | (Running, Stalled)
                | (Running, Retrying)
                | (Failed, Retrying)
                | (Retrying, Assigned)
                | (Retrying, Cancelled)
                | (Stalled, Failed)
                | (Stalled, Running)
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TaskStatus::Queued => "queued",
            TaskStatus::Assigned => "assigned",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Retrying => "retrying",
            TaskStatus::Cancelled => "cancelled",
            TaskStatus::Stalled => "stalled",
        };
        write!(f, "{}", name)
    }
}

/// One recorded status change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusTransition {
    pub status: TaskStatus,
    pub at: DateTime<Utc>,
    pub reason: String,
}

/// Per-task scheduling metadata maintained by the queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct SchedulingMeta {
    /// Dispatch key under weighted-fair scheduling; lower is earlier
    pub virtual_start_time: f64,
    /// Fairness weight of the owning project at enqueue time
    pub fair_share_weight: f64,
}

/// A declared follow-up operation carried in a task result.
///
/// The action name is matched against the bounded set the result handler
/// understands; unknown names are logged and ignored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FollowUpAction {
    #[serde(rename = "type")]
    pub action: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

/// Result envelope produced by one AI-tool execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskOutcome {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub success: bool,
    pub completed_at: DateTime<Utc>,
    #[serde(default)]
    pub rate_limited: bool,
    #[serde(default)]
    pub reset_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub follow_up_actions: Vec<FollowUpAction>,
}

/// Record of a task whose child process is currently executing.
///
/// Created when the worker spawns the child and destroyed on completion,
/// or during the recovery sweep when the PID is no longer alive.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunningTaskRecord {
    pub task_id: String,
    pub project_id: String,
    pub issue_number: u64,
    pub child_pid: u32,
    pub child_started_at: DateTime<Utc>,
    pub worker_id: String,
}

/// The unit of work scheduled and executed: a single issue, comment, or
/// pull-request event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Globally unique identity: `{project}-{issue}-{enqueue epoch millis}`
    pub id: String,
    pub project_id: String,
    pub issue_number: u64,
    pub kind: TaskKind,
    pub base_priority: u8,
    pub effective_priority: u8,
    pub enqueued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub deadline: Option<DateTime<Utc>>,
    pub estimated_duration: Option<Duration>,
    pub attempts: u32,
    pub status: TaskStatus,
    #[serde(default)]
    pub scheduling: SchedulingMeta,
    pub result: Option<TaskOutcome>,
    pub error: Option<String>,
    #[serde(default)]
    pub history: Vec<StatusTransition>,
}

impl Task {
    /// Create a freshly queued task for a discovered work item.
    pub fn new(project_id: &str, issue_number: u64, kind: TaskKind, base_priority: u8) -> Self {
        let enqueued_at = Utc::now();
        let id = format!(
            "{}-{}-{}",
            project_id,
            issue_number,
            enqueued_at.timestamp_millis()
        );
        Self {
            id,
            project_id: project_id.to_string(),
            issue_number,
            kind,
            base_priority,
            effective_priority: base_priority,
            enqueued_at,
            started_at: None,
            completed_at: None,
            deadline: None,
            estimated_duration: None,
            attempts: 0,
            status: TaskStatus::Queued,
            scheduling: SchedulingMeta::default(),
            result: None,
            error: None,
            history: vec![StatusTransition {
                status: TaskStatus::Queued,
                at: enqueued_at,
                reason: "enqueued".to_string(),
            }],
        }
    }

    /// Reference to the issue this task operates on.
    pub fn issue_ref(&self) -> IssueRef {
        IssueRef::new(self.project_id.clone(), self.issue_number)
    }

    /// Apply a status transition, enforcing the state machine.
    ///
    /// Timestamps are maintained as a side effect: the first entry into
    /// `running` sets `started_at`, and every terminal status sets
    /// `completed_at`.
    ///
    /// # Errors
    ///
    /// Returns [`RepoPilotError::InvalidTransition`] when the state
    /// machine forbids the change.
    pub fn transition(&mut self, next: TaskStatus, reason: impl Into<String>) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(RepoPilotError::InvalidTransition {
                task_id: self.id.clone(),
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        let now = Utc::now();
        if next == TaskStatus::Running && self.started_at.is_none() {
            self.started_at = Some(now);
        }
        if next.is_terminal() {
            self.completed_at = Some(now);
        }
        self.status = next;
        self.history.push(StatusTransition {
            status: next,
            at: now,
            reason: reason.into(),
        });
        Ok(())
    }

    /// Whether the task's deadline has passed.
    pub fn deadline_expired(&self, now: DateTime<Utc>) -> bool {
        self.deadline.map(|d| d <= now).unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn issue_task() -> Task {
        Task::new(
            "demo",
            42,
            TaskKind::Issue(IssuePayload {
                number: 42,
                title: "broken build".into(),
                body: String::new(),
                labels: vec!["task:bug".into()],
                author: None,
                created_at: None,
            }),
            50,
        )
    }

    #[test]
    fn test_task_id_contains_project_and_issue() {
        let task = issue_task();
        assert!(task.id.starts_with("demo-42-"));
        assert_eq!(task.issue_ref().to_string(), "demo#42");
    }

    #[test]
    fn test_happy_path_transitions() {
        let mut task = issue_task();
        task.transition(TaskStatus::Assigned, "dispatched").unwrap();
        task.transition(TaskStatus::Running, "child spawned").unwrap();
        task.transition(TaskStatus::Completed, "exit 0").unwrap();
        assert!(task.started_at.is_some());
        assert!(task.completed_at.is_some());
        assert!(task.completed_at >= task.started_at);
        assert_eq!(task.history.len(), 4);
    }

    #[test]
    fn test_retry_cycle_transitions() {
        let mut task = issue_task();
        task.transition(TaskStatus::Assigned, "dispatched").unwrap();
        task.transition(TaskStatus::Running, "child spawned").unwrap();
        task.transition(TaskStatus::Failed, "exit 1").unwrap();
        task.transition(TaskStatus::Retrying, "attempt 1 of 3").unwrap();
        task.transition(TaskStatus::Assigned, "re-dispatched").unwrap();
        assert_eq!(task.status, TaskStatus::Assigned);
    }

    #[test]
    fn test_illegal_transition_rejected() {
        let mut task = issue_task();
        let err = task.transition(TaskStatus::Completed, "skip ahead").unwrap_err();
        assert!(matches!(err, RepoPilotError::InvalidTransition { .. }));
        assert_eq!(task.status, TaskStatus::Queued);
    }

    #[test]
    fn test_stalled_can_recover_or_fail() {
        let mut task = issue_task();
        task.transition(TaskStatus::Assigned, "dispatched").unwrap();
        task.transition(TaskStatus::Running, "child spawned").unwrap();
        task.transition(TaskStatus::Stalled, "no status update").unwrap();
        task.transition(TaskStatus::Running, "status update arrived").unwrap();
        task.transition(TaskStatus::Stalled, "no status update").unwrap();
        task.transition(TaskStatus::Failed, "stall timeout").unwrap();
        assert!(task.status.is_terminal());
    }

    #[test]
    fn test_kind_serde_uses_kebab_tags() {
        let task = issue_task();
        let json = serde_json::to_value(&task).unwrap();
        assert_eq!(json["kind"]["kind"], "issue");
        let back: Task = serde_json::from_value(json).unwrap();
        assert_eq!(back.kind.name(), "issue");
    }

    #[test]
    fn test_active_statuses() {
        assert!(TaskStatus::Queued.is_active());
        assert!(TaskStatus::Retrying.is_active());
        assert!(!TaskStatus::Completed.is_active());
        assert!(!TaskStatus::Stalled.is_active());
    }
}
