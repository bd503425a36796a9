//! Multi-project, multi-algorithm ordered task container.
//!
//! One logical queue serves every registered project. A single task list
//! plus two hash indexes (by `(project, issue)` for dedup, by project for
//! fairness decisions) back all four scheduling algorithms; the active
//! algorithm only changes the comparator applied at dispatch.
//!
//! Admission is typed: [`enqueue`](TaskQueue::enqueue) returns an
//! [`EnqueueError`] value instead of signalling duplicates or overflow
//! through panics or sentinel states.

mod metrics;
mod priority;

pub use metrics::{jain_fairness_index, ProjectQueueStats};
pub use priority::{effective_priority, parse_cpu_share, parse_memory_share, PriorityInputs};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use thiserror::Error;

use crate::config::{
    Config, ProjectConfig, ProjectSchedulingConfig, ResourceQuota, SchedulingAlgorithm,
};
use crate::core::task::{IssueRef, Task, TaskStatus};
use metrics::ProjectMetrics;

/// Typed admission failure.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum EnqueueError {
    /// The queue has reached its configured maximum depth.
    #[error("queue full (capacity {capacity})")]
    QueueFull { capacity: usize },
    /// A task for the same issue is already queued or running.
    #[error("duplicate task for {issue}")]
    Duplicate { issue: IssueRef },
    /// The project is at its concurrency quota.
    #[error("resource quota exceeded for project {project_id}")]
    QuotaExceeded { project_id: String },
    /// The issue lock is held by another worker.
    #[error("issue lock held for {issue}")]
    LockHeld { issue: IssueRef },
    /// The daemon is draining; no new work is accepted.
    #[error("queue is draining")]
    Draining,
}

impl From<EnqueueError> for crate::error::RepoPilotError {
    fn from(err: EnqueueError) -> Self {
        crate::error::RepoPilotError::CommandExecution(err.to_string())
    }
}

/// Per-project scheduling state held by the queue.
#[derive(Debug, Clone)]
struct ProjectScheduleState {
    base_priority: u8,
    dynamic_priority: u8,
    share_weight: f64,
    fair_share_tokens: f64,
    quota: Option<ResourceQuota>,
    targets: Option<ProjectSchedulingConfig>,
    running: usize,
}

impl ProjectScheduleState {
    fn from_config(project: &ProjectConfig) -> Self {
        Self {
            base_priority: project.base_priority,
            dynamic_priority: project.base_priority,
            share_weight: project.share_weight,
            fair_share_tokens: project.share_weight,
            quota: project.resource_quota.clone(),
            targets: project.scheduling.clone(),
            running: 0,
        }
    }

    fn has_quota_headroom(&self) -> bool {
        match &self.quota {
            Some(quota) => self.running < quota.max_concurrent,
            None => true,
        }
    }
}

/// Process-wide accounted resource usage.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ResourceUsage {
    pub concurrent: usize,
    pub cpu: f64,
    pub memory_bytes: u64,
}

/// Persisted slice of scheduling state, restored across restarts.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchedulingSnapshot {
    pub projects: HashMap<String, ProjectSchedulingEntry>,
}

/// One project's persisted scheduling continuity values.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectSchedulingEntry {
    pub fair_share_tokens: f64,
    pub dynamic_priority: u8,
}

/// Frozen queue statistics for the admin surface.
#[derive(Debug, Clone, Serialize)]
pub struct QueueStatistics {
    pub depth: usize,
    pub running: usize,
    pub fairness_index: f64,
    pub resource_usage: ResourceUsage,
    pub projects: HashMap<String, ProjectQueueStats>,
}

struct Inner {
    queued: Vec<Task>,
    queued_index: HashSet<IssueRef>,
    running: HashMap<String, Task>,
    running_index: HashSet<IssueRef>,
    projects: HashMap<String, ProjectScheduleState>,
    metrics: HashMap<String, ProjectMetrics>,
    resource_usage: ResourceUsage,
    virtual_clock: u64,
    draining: bool,
}

/// The global task queue.
pub struct TaskQueue {
    inner: Mutex<Inner>,
    algorithm: SchedulingAlgorithm,
    max_depth: usize,
    dynamic_priority_enabled: bool,
    resource_quota_enabled: bool,
}

impl TaskQueue {
    /// Build a queue from the daemon configuration.
    pub fn from_config(config: &Config) -> Self {
        let queue = Self::new(
            config.scheduling.algorithm,
            config.scheduling.max_queue_depth,
            config.scheduling.dynamic_priority_enabled,
            config.scheduling.resource_quota_enabled,
        );
        for project in &config.projects {
            queue.register_project(project);
        }
        queue
    }

    /// Build a queue with explicit parameters.
    pub fn new(
        algorithm: SchedulingAlgorithm,
        max_depth: usize,
        dynamic_priority_enabled: bool,
        resource_quota_enabled: bool,
    ) -> Self {
        Self {
            inner: Mutex::new(Inner {
                queued: Vec::new(),
                queued_index: HashSet::new(),
                running: HashMap::new(),
                running_index: HashSet::new(),
                projects: HashMap::new(),
                metrics: HashMap::new(),
                resource_usage: ResourceUsage::default(),
                virtual_clock: 0,
                draining: false,
            }),
            algorithm,
            max_depth,
            dynamic_priority_enabled,
            resource_quota_enabled,
        }
    }

    /// Active scheduling algorithm.
    pub fn algorithm(&self) -> SchedulingAlgorithm {
        self.algorithm
    }

    // ----- project registry ------------------------------------------

    /// Register or refresh a project's scheduling state.
    pub fn register_project(&self, project: &ProjectConfig) {
        let mut inner = self.inner.lock().unwrap();
        let state = ProjectScheduleState::from_config(project);
        match inner.projects.get_mut(&project.id) {
            Some(existing) => {
                // Preserve runtime continuity, refresh configuration
                existing.base_priority = state.base_priority;
                existing.share_weight = state.share_weight;
                existing.quota = state.quota;
                existing.targets = state.targets;
            }
            None => {
                inner.projects.insert(project.id.clone(), state);
            }
        }
        inner.metrics.entry(project.id.clone()).or_default();
    }

    /// Drop a project's scheduling state; its queued tasks are cancelled
    /// and returned.
    pub fn unregister_project(&self, project_id: &str) -> Vec<Task> {
        let mut inner = self.inner.lock().unwrap();
        let inner = &mut *inner;
        inner.projects.remove(project_id);
        let mut removed = Vec::new();
        let mut kept = Vec::with_capacity(inner.queued.len());
        for mut task in inner.queued.drain(..) {
            if task.project_id == project_id {
                inner.queued_index.remove(&task.issue_ref());
                if let Err(e) = task.transition(TaskStatus::Cancelled, "project unregistered") {
                    log::warn!("cancel on unregister: {}", e);
                }
                removed.push(task);
            } else {
                kept.push(task);
            }
        }
        inner.queued = kept;
        removed
    }

    // ----- admission --------------------------------------------------

    /// Admit a freshly discovered task.
    ///
    /// Rejects duplicates (another task for the same issue is queued or
    /// running), overflow beyond the configured depth, and everything
    /// while the daemon drains. On success the task's effective priority
    /// and weighted-fair metadata are computed and its id is returned.
    pub fn enqueue(&self, mut task: Task) -> Result<String, EnqueueError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.draining {
            return Err(EnqueueError::Draining);
        }
        let issue = task.issue_ref();
        if inner.queued_index.contains(&issue) || inner.running_index.contains(&issue) {
            return Err(EnqueueError::Duplicate { issue });
        }
        if inner.queued.len() >= self.max_depth {
            return Err(EnqueueError::QueueFull {
                capacity: self.max_depth,
            });
        }

        Self::prepare_scheduling(&mut inner, &mut task);
        let id = task.id.clone();
        inner
            .metrics
            .entry(task.project_id.clone())
            .or_default()
            .enqueued += 1;
        inner.queued_index.insert(issue);
        inner.queued.push(task);
        Ok(id)
    }

    /// Re-admit a task that is retrying after a failure or rate limit.
    ///
    /// Atomically drops the running entry and inserts the caller's copy
    /// back into the queue, so no concurrent enqueue can sneak a
    /// duplicate in between. A retrying task carries a flat +5 over the
    /// base effective-priority formula.
    pub fn requeue(&self, mut task: Task) {
        let mut inner = self.inner.lock().unwrap();
        Self::remove_running_entry(&mut inner, &task.id);
        let issue = task.issue_ref();
        if inner.queued_index.contains(&issue) {
            // A duplicate slipped in while the task was off-queue; keep
            // the retrying copy, which carries the attempt history.
            inner.queued.retain(|t| t.issue_ref() != issue);
        }
        Self::prepare_scheduling(&mut inner, &mut task);
        inner.queued_index.insert(issue);
        inner.queued.push(task);
    }

    fn prepare_scheduling(inner: &mut Inner, task: &mut Task) {
        let now = Utc::now();
        let (project_priority, under_quota, tokens, weight) =
            match inner.projects.get(&task.project_id) {
                Some(p) => (
                    p.dynamic_priority,
                    p.quota.is_some() && p.has_quota_headroom(),
                    p.fair_share_tokens,
                    p.share_weight,
                ),
                None => (task.base_priority, false, 1.0, 1.0),
            };
        task.effective_priority = effective_priority(
            &PriorityInputs {
                project_priority,
                task_priority: task.base_priority,
                deadline: task.deadline,
                under_quota,
            },
            now,
        );
        if task.status == TaskStatus::Retrying {
            task.effective_priority = task.effective_priority.saturating_add(5).min(100);
        }
        inner.virtual_clock += 1;
        task.scheduling.fair_share_weight = weight;
        task.scheduling.virtual_start_time = inner.virtual_clock as f64 / tokens.max(f64::EPSILON)
            + (100 - task.effective_priority) as f64;
    }

    // ----- selection --------------------------------------------------

    /// Select, remove, and return the next task to execute.
    ///
    /// The task transitions to `assigned`, is recorded in the running
    /// index, and its project's resource usage is charged. `None` when
    /// the queue is empty, quota-blocked, or draining.
    pub fn next_task(&self, requesting_project: Option<&str>) -> Option<Task> {
        let mut inner = self.inner.lock().unwrap();
        if inner.draining {
            return None;
        }

        let quota_gated = self.resource_quota_enabled
            || self.algorithm == SchedulingAlgorithm::ResourceAware;
        let position = {
            let eligible = inner.queued.iter().enumerate().filter(|(_, task)| {
                if let Some(project) = requesting_project {
                    if task.project_id != project {
                        return false;
                    }
                }
                if quota_gated {
                    if let Some(state) = inner.projects.get(&task.project_id) {
                        if !state.has_quota_headroom() {
                            return false;
                        }
                    }
                }
                true
            });
            match self.algorithm {
                SchedulingAlgorithm::WeightedFair => eligible
                    .min_by(|(_, a), (_, b)| {
                        a.scheduling
                            .virtual_start_time
                            .total_cmp(&b.scheduling.virtual_start_time)
                    })
                    .map(|(i, _)| i),
                SchedulingAlgorithm::DeadlineAware => eligible
                    .min_by(|(_, a), (_, b)| match (a.deadline, b.deadline) {
                        (Some(da), Some(db)) => da.cmp(&db),
                        (Some(_), None) => std::cmp::Ordering::Less,
                        (None, Some(_)) => std::cmp::Ordering::Greater,
                        (None, None) => b
                            .effective_priority
                            .cmp(&a.effective_priority)
                            .then(a.enqueued_at.cmp(&b.enqueued_at)),
                    })
                    .map(|(i, _)| i),
                SchedulingAlgorithm::PriorityBased | SchedulingAlgorithm::ResourceAware => {
                    eligible
                        .max_by(|(_, a), (_, b)| {
                            a.effective_priority
                                .cmp(&b.effective_priority)
                                .then(b.enqueued_at.cmp(&a.enqueued_at))
                        })
                        .map(|(i, _)| i)
                }
            }
        }?;

        let mut task = inner.queued.remove(position);
        inner.queued_index.remove(&task.issue_ref());
        if let Err(e) = task.transition(TaskStatus::Assigned, "dispatched") {
            log::error!("dispatch transition failed: {}", e);
        }

        let wait_secs = (Utc::now() - task.enqueued_at).num_milliseconds() as f64 / 1_000.0;
        inner
            .metrics
            .entry(task.project_id.clone())
            .or_default()
            .record_dispatch(wait_secs.max(0.0));

        Self::charge_usage(&mut inner, &task);
        if self.algorithm == SchedulingAlgorithm::WeightedFair {
            if let Some(state) = inner.projects.get_mut(&task.project_id) {
                state.fair_share_tokens = (state.fair_share_tokens * 0.9).max(f64::EPSILON);
            }
        }
        inner.running_index.insert(task.issue_ref());
        inner.running.insert(task.id.clone(), task.clone());
        Some(task)
    }

    fn charge_usage(inner: &mut Inner, task: &Task) {
        inner.resource_usage.concurrent += 1;
        if let Some(state) = inner.projects.get_mut(&task.project_id) {
            state.running += 1;
            if let Some(quota) = &state.quota {
                if let Some(cpu) = quota.cpu.as_deref().and_then(parse_cpu_share) {
                    inner.resource_usage.cpu += cpu;
                }
                if let Some(mem) = quota.memory.as_deref().and_then(parse_memory_share) {
                    inner.resource_usage.memory_bytes += mem;
                }
            }
        }
    }

    fn refund_usage(inner: &mut Inner, task: &Task) {
        inner.resource_usage.concurrent = inner.resource_usage.concurrent.saturating_sub(1);
        if let Some(state) = inner.projects.get_mut(&task.project_id) {
            state.running = state.running.saturating_sub(1);
            if let Some(quota) = &state.quota {
                if let Some(cpu) = quota.cpu.as_deref().and_then(parse_cpu_share) {
                    inner.resource_usage.cpu = (inner.resource_usage.cpu - cpu).max(0.0);
                }
                if let Some(mem) = quota.memory.as_deref().and_then(parse_memory_share) {
                    inner.resource_usage.memory_bytes =
                        inner.resource_usage.memory_bytes.saturating_sub(mem);
                }
            }
        }
    }

    fn remove_running_entry(inner: &mut Inner, task_id: &str) -> Option<Task> {
        let task = inner.running.remove(task_id)?;
        inner.running_index.remove(&task.issue_ref());
        Self::refund_usage(inner, &task);
        Some(task)
    }

    // ----- retirement -------------------------------------------------

    /// Retire a task with a terminal outcome and record its metrics.
    pub fn finish(&self, task_id: &str, success: bool, exec_secs: f64) -> Option<Task> {
        let mut inner = self.inner.lock().unwrap();
        let task = Self::remove_running_entry(&mut inner, task_id)?;
        let now = Utc::now();
        let latency = (now - task.enqueued_at).num_milliseconds() as f64 / 1_000.0;
        inner
            .metrics
            .entry(task.project_id.clone())
            .or_default()
            .record_completion(now, exec_secs, latency.max(0.0), success);
        Some(task)
    }

    /// Remove a queued task (admin surface); returns it cancelled.
    pub fn remove_queued(&self, task_id: &str) -> Option<Task> {
        let mut inner = self.inner.lock().unwrap();
        let position = inner.queued.iter().position(|t| t.id == task_id)?;
        let mut task = inner.queued.remove(position);
        inner.queued_index.remove(&task.issue_ref());
        if let Err(e) = task.transition(TaskStatus::Cancelled, "removed by admin") {
            log::warn!("cancel on remove: {}", e);
        }
        Some(task)
    }

    // ----- draining ---------------------------------------------------

    /// Flip the draining flag; a draining queue admits and dispatches
    /// nothing.
    pub fn set_draining(&self, draining: bool) {
        self.inner.lock().unwrap().draining = draining;
    }

    /// Remove and return every queued task, ordered for persistence by
    /// descending effective priority then enqueue time.
    pub fn drain_pending(&self) -> Vec<Task> {
        let mut inner = self.inner.lock().unwrap();
        inner.queued_index.clear();
        let mut tasks: Vec<Task> = inner.queued.drain(..).collect();
        tasks.sort_by(|a, b| {
            b.effective_priority
                .cmp(&a.effective_priority)
                .then(a.enqueued_at.cmp(&b.enqueued_at))
        });
        tasks
    }

    // ----- periodic maintenance --------------------------------------

    /// One maintenance tick: replenish fair-share tokens, run the
    /// dynamic-priority adjuster, and refresh queued effective
    /// priorities.
    pub fn tick(&self) {
        let mut inner = self.inner.lock().unwrap();
        let now = Utc::now();

        for state in inner.projects.values_mut() {
            state.fair_share_tokens =
                (state.fair_share_tokens + state.share_weight * 0.1).min(state.share_weight);
        }

        if self.dynamic_priority_enabled {
            Self::adjust_dynamic_priorities(&mut inner, now);
        }

        for metrics in inner.metrics.values_mut() {
            metrics.prune(now);
        }

        Self::refresh_effective_priorities(&mut inner);
    }

    fn adjust_dynamic_priorities(inner: &mut Inner, now: chrono::DateTime<Utc>) {
        let oldest_wait: HashMap<String, f64> = {
            let mut map: HashMap<String, f64> = HashMap::new();
            for task in &inner.queued {
                let wait = (now - task.enqueued_at).num_seconds() as f64;
                let entry = map.entry(task.project_id.clone()).or_insert(0.0);
                if wait > *entry {
                    *entry = wait;
                }
            }
            map
        };

        for (project_id, state) in inner.projects.iter_mut() {
            let mut bump: i32 = 0;
            if let (Some(targets), Some(metrics)) =
                (state.targets.as_ref(), inner.metrics.get(project_id))
            {
                if let Some(min_throughput) = targets.min_throughput {
                    if metrics.throughput_per_hour() < min_throughput {
                        bump += 10;
                    }
                }
                if let Some(max_latency) = targets.max_latency_secs {
                    if metrics.latency_secs() > max_latency {
                        bump += 10;
                    }
                }
            }
            if oldest_wait.get(project_id).copied().unwrap_or(0.0) > 3_600.0 {
                bump += 5;
            }

            if bump > 0 {
                state.dynamic_priority =
                    (state.dynamic_priority as i32 + bump).clamp(0, 100) as u8;
            } else if state.dynamic_priority != state.base_priority {
                // Decay back toward the configured base
                let base = state.base_priority as i32;
                let current = state.dynamic_priority as i32;
                let step = (current - base).signum() * 5;
                let next = current - step;
                state.dynamic_priority = if (next - base).signum() != (current - base).signum() {
                    state.base_priority
                } else {
                    next.clamp(0, 100) as u8
                };
            }
        }
    }

    fn refresh_effective_priorities(inner: &mut Inner) {
        let now = Utc::now();
        let projects = inner.projects.clone();
        for task in inner.queued.iter_mut() {
            let (project_priority, under_quota) = match projects.get(&task.project_id) {
                Some(p) => (
                    p.dynamic_priority,
                    p.quota.is_some() && p.has_quota_headroom(),
                ),
                None => (task.base_priority, false),
            };
            task.effective_priority = effective_priority(
                &PriorityInputs {
                    project_priority,
                    task_priority: task.base_priority,
                    deadline: task.deadline,
                    under_quota,
                },
                now,
            );
            if task.status == TaskStatus::Retrying {
                task.effective_priority = task.effective_priority.saturating_add(5).min(100);
            }
        }
    }

    // ----- introspection ----------------------------------------------

    /// Number of queued tasks.
    pub fn depth(&self) -> usize {
        self.inner.lock().unwrap().queued.len()
    }

    /// Number of running tasks.
    pub fn running_count(&self) -> usize {
        self.inner.lock().unwrap().running.len()
    }

    /// Whether a task for the issue is queued or running.
    pub fn contains_issue(&self, issue: &IssueRef) -> bool {
        let inner = self.inner.lock().unwrap();
        inner.queued_index.contains(issue) || inner.running_index.contains(issue)
    }

    /// Clone of the queued tasks (admin surface).
    pub fn queued_snapshot(&self) -> Vec<Task> {
        self.inner.lock().unwrap().queued.clone()
    }

    /// Clone of the running tasks (admin surface).
    pub fn running_snapshot(&self) -> Vec<Task> {
        self.inner.lock().unwrap().running.values().cloned().collect()
    }

    /// Frozen statistics including Jain's fairness index.
    pub fn statistics(&self) -> QueueStatistics {
        let inner = self.inner.lock().unwrap();
        let samples: Vec<f64> = inner
            .metrics
            .values()
            .map(|m| m.throughput_per_hour())
            .collect();
        QueueStatistics {
            depth: inner.queued.len(),
            running: inner.running.len(),
            fairness_index: jain_fairness_index(&samples),
            resource_usage: inner.resource_usage.clone(),
            projects: inner
                .metrics
                .iter()
                .map(|(id, m)| (id.clone(), m.snapshot()))
                .collect(),
        }
    }

    /// Persisted scheduling continuity values.
    pub fn scheduling_snapshot(&self) -> SchedulingSnapshot {
        let inner = self.inner.lock().unwrap();
        SchedulingSnapshot {
            projects: inner
                .projects
                .iter()
                .map(|(id, state)| {
                    (
                        id.clone(),
                        ProjectSchedulingEntry {
                            fair_share_tokens: state.fair_share_tokens,
                            dynamic_priority: state.dynamic_priority,
                        },
                    )
                })
                .collect(),
        }
    }

    /// Restore scheduling continuity values from a snapshot.
    pub fn restore_scheduling(&self, snapshot: &SchedulingSnapshot) {
        let mut inner = self.inner.lock().unwrap();
        for (id, entry) in &snapshot.projects {
            if let Some(state) = inner.projects.get_mut(id) {
                state.fair_share_tokens = entry.fair_share_tokens.max(f64::EPSILON);
                state.dynamic_priority = entry.dynamic_priority.min(100);
            }
        }
    }
}
