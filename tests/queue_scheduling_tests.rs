//! Scheduling-behavior tests over the public queue API: priority
//! ordering, deadline boosts, weighted-fair throughput, and dedup under
//! concurrent enqueue.

use chrono::Utc;
use repopilot::config::{ProjectConfig, SchedulingAlgorithm};
use repopilot::core::queue::{
    effective_priority, jain_fairness_index, EnqueueError, PriorityInputs, TaskQueue,
};
use repopilot::core::task::{IssuePayload, Task, TaskKind};
use std::sync::Arc;

fn task_for(project: &str, issue: u64, priority: u8) -> Task {
    Task::new(
        project,
        issue,
        TaskKind::Issue(IssuePayload {
            number: issue,
            title: format!("issue {}", issue),
            body: String::new(),
            labels: vec![],
            author: None,
            created_at: None,
        }),
        priority,
    )
}

#[test]
fn test_high_priority_task_jumps_the_line() {
    let queue = TaskQueue::new(SchedulingAlgorithm::PriorityBased, 100, false, false);
    queue.register_project(&ProjectConfig::new("p", "octo", "r"));
    for issue in 0..10 {
        queue.enqueue(task_for("p", issue, 50)).unwrap();
    }
    queue.enqueue(task_for("p", 99, 100)).unwrap();

    let next = queue.next_task(None).unwrap();
    assert_eq!(next.issue_number, 99);
    assert_eq!(next.effective_priority, 80); // 0.6*50 + 0.4*100
}

#[test]
fn test_deadline_boost_beats_twin_without_deadline() {
    let now = Utc::now();
    let base = PriorityInputs {
        project_priority: 50,
        task_priority: 50,
        deadline: None,
        under_quota: false,
    };
    let mut dated = base;
    dated.deadline = Some(now + chrono::Duration::hours(1));

    let plain = effective_priority(&base, now);
    let boosted = effective_priority(&dated, now);
    assert!(boosted as i32 - plain as i32 >= 20);
}

#[test]
fn test_weighted_fair_thousand_dispatch_ratio() {
    let queue = TaskQueue::new(SchedulingAlgorithm::WeightedFair, 5_000, false, false);
    let mut heavy = ProjectConfig::new("heavy", "octo", "h");
    heavy.share_weight = 2.0;
    let light = ProjectConfig::new("light", "octo", "l");
    queue.register_project(&heavy);
    queue.register_project(&light);

    for i in 0..1_000u64 {
        queue.enqueue(task_for("heavy", i, 50)).unwrap();
        queue.enqueue(task_for("light", 10_000 + i, 50)).unwrap();
    }

    let mut dispatched = (0usize, 0usize);
    for _ in 0..1_000 {
        let task = queue.next_task(None).unwrap();
        if task.project_id == "heavy" {
            dispatched.0 += 1;
        } else {
            dispatched.1 += 1;
        }
        queue.finish(&task.id, true, 0.01);
        queue.tick();
    }
    let ratio = dispatched.0 as f64 / dispatched.1 as f64;
    assert!(
        (1.8..=2.2).contains(&ratio),
        "weighted-fair ratio {} out of bounds ({}:{})",
        ratio,
        dispatched.0,
        dispatched.1
    );
}

#[test]
fn test_equal_weights_reach_high_fairness_index() {
    let queue = TaskQueue::new(SchedulingAlgorithm::WeightedFair, 2_000, false, false);
    for name in ["a", "b", "c", "d"] {
        queue.register_project(&ProjectConfig::new(name, "octo", name));
    }
    for i in 0..100u64 {
        for name in ["a", "b", "c", "d"] {
            queue.enqueue(task_for(name, i, 50)).unwrap();
        }
    }
    let mut throughput = std::collections::HashMap::new();
    for _ in 0..400 {
        let task = queue.next_task(None).unwrap();
        *throughput.entry(task.project_id.clone()).or_insert(0.0) += 1.0;
        queue.finish(&task.id, true, 0.01);
    }
    let samples: Vec<f64> = throughput.values().copied().collect();
    assert!(jain_fairness_index(&samples) >= 0.95);
}

#[test]
fn test_concurrent_enqueue_admits_exactly_one_per_issue() {
    let queue = Arc::new(TaskQueue::new(
        SchedulingAlgorithm::PriorityBased,
        1_000,
        false,
        false,
    ));
    queue.register_project(&ProjectConfig::new("p", "octo", "r"));

    let mut handles = Vec::new();
    for _ in 0..16 {
        let queue = Arc::clone(&queue);
        handles.push(std::thread::spawn(move || {
            let mut admitted = 0;
            for issue in 0..50u64 {
                if queue.enqueue(task_for("p", issue, 50)).is_ok() {
                    admitted += 1;
                }
            }
            admitted
        }));
    }
    let total: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
    assert_eq!(total, 50, "each issue admitted exactly once");
    assert_eq!(queue.depth(), 50);
}

#[test]
fn test_duplicate_rejection_is_typed() {
    let queue = TaskQueue::new(SchedulingAlgorithm::PriorityBased, 100, false, false);
    queue.enqueue(task_for("p", 1, 50)).unwrap();
    match queue.enqueue(task_for("p", 1, 50)) {
        Err(EnqueueError::Duplicate { issue }) => {
            assert_eq!(issue.issue_number, 1);
        }
        other => panic!("expected Duplicate, got {:?}", other),
    }
}
