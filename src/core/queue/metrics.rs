//! Per-project queue metrics and the process-wide fairness index.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};

/// Rolling observation window for throughput and latency, in minutes.
const WINDOW_MINUTES: i64 = 60;

/// Mutable metric state for one project.
#[derive(Debug, Default)]
pub struct ProjectMetrics {
    pub enqueued: u64,
    pub completed: u64,
    pub failed: u64,
    total_exec_secs: f64,
    total_wait_secs: f64,
    wait_samples: u64,
    /// (completion instant, end-to-end latency seconds) within the window
    window: VecDeque<(DateTime<Utc>, f64)>,
}

impl ProjectMetrics {
    /// Record a dispatch and how long the task waited in queue.
    pub fn record_dispatch(&mut self, wait_secs: f64) {
        self.total_wait_secs += wait_secs;
        self.wait_samples += 1;
    }

    /// Record a finished execution.
    pub fn record_completion(
        &mut self,
        now: DateTime<Utc>,
        exec_secs: f64,
        latency_secs: f64,
        success: bool,
    ) {
        if success {
            self.completed += 1;
        } else {
            self.failed += 1;
        }
        self.total_exec_secs += exec_secs;
        self.window.push_back((now, latency_secs));
        self.prune(now);
    }

    /// Drop window entries older than one hour.
    pub fn prune(&mut self, now: DateTime<Utc>) {
        while let Some((at, _)) = self.window.front() {
            if now - *at > Duration::minutes(WINDOW_MINUTES) {
                self.window.pop_front();
            } else {
                break;
            }
        }
    }

    /// Completions per hour over the rolling window.
    pub fn throughput_per_hour(&self) -> f64 {
        self.window.len() as f64
    }

    /// Average end-to-end latency (seconds) over the rolling window.
    pub fn latency_secs(&self) -> f64 {
        if self.window.is_empty() {
            return 0.0;
        }
        self.window.iter().map(|(_, l)| l).sum::<f64>() / self.window.len() as f64
    }

    /// Average execution time (seconds) over the whole run.
    pub fn avg_execution_secs(&self) -> f64 {
        let finished = self.completed + self.failed;
        if finished == 0 {
            return 0.0;
        }
        self.total_exec_secs / finished as f64
    }

    /// Average queue wait (seconds) over the whole run.
    pub fn avg_wait_secs(&self) -> f64 {
        if self.wait_samples == 0 {
            return 0.0;
        }
        self.total_wait_secs / self.wait_samples as f64
    }

    /// Frozen, serializable view of this project's metrics.
    pub fn snapshot(&self) -> ProjectQueueStats {
        ProjectQueueStats {
            enqueued: self.enqueued,
            completed: self.completed,
            failed: self.failed,
            avg_execution_secs: self.avg_execution_secs(),
            avg_wait_secs: self.avg_wait_secs(),
            throughput_per_hour: self.throughput_per_hour(),
            latency_secs: self.latency_secs(),
        }
    }
}

/// Serializable per-project statistics.
#[derive(Debug, Clone, Serialize)]
pub struct ProjectQueueStats {
    pub enqueued: u64,
    pub completed: u64,
    pub failed: u64,
    pub avg_execution_secs: f64,
    pub avg_wait_secs: f64,
    pub throughput_per_hour: f64,
    pub latency_secs: f64,
}

/// Jain's fairness index over a set of throughput samples.
///
/// `J = (Σx)² / (n · Σx²)`, in `(0, 1]`; 1.0 means perfectly even.
/// An empty or all-zero sample set reports 1.0 (nothing is unfair yet).
pub fn jain_fairness_index(samples: &[f64]) -> f64 {
    if samples.is_empty() {
        return 1.0;
    }
    let sum: f64 = samples.iter().sum();
    let sum_sq: f64 = samples.iter().map(|x| x * x).sum();
    if sum_sq == 0.0 {
        return 1.0;
    }
    (sum * sum) / (samples.len() as f64 * sum_sq)
}

/// Compute the fairness index across a metrics map.
pub fn fairness_across(projects: &HashMap<String, ProjectMetrics>) -> f64 {
    let samples: Vec<f64> = projects
        .values()
        .map(|m| m.throughput_per_hour())
        .collect();
    jain_fairness_index(&samples)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_prunes_old_entries() {
        let mut metrics = ProjectMetrics::default();
        let start = Utc::now() - Duration::hours(2);
        metrics.record_completion(start, 1.0, 5.0, true);
        metrics.record_completion(Utc::now(), 1.0, 5.0, true);
        assert_eq!(metrics.throughput_per_hour(), 1.0);
        assert_eq!(metrics.completed, 2);
    }

    #[test]
    fn test_averages() {
        let mut metrics = ProjectMetrics::default();
        metrics.record_dispatch(2.0);
        metrics.record_dispatch(4.0);
        metrics.record_completion(Utc::now(), 10.0, 12.0, true);
        metrics.record_completion(Utc::now(), 20.0, 24.0, false);
        assert_eq!(metrics.avg_wait_secs(), 3.0);
        assert_eq!(metrics.avg_execution_secs(), 15.0);
        assert_eq!(metrics.latency_secs(), 18.0);
        assert_eq!(metrics.completed, 1);
        assert_eq!(metrics.failed, 1);
    }

    #[test]
    fn test_jain_even_distribution_is_one() {
        let j = jain_fairness_index(&[5.0, 5.0, 5.0, 5.0]);
        assert!((j - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_jain_skewed_distribution_drops() {
        let j = jain_fairness_index(&[10.0, 0.0, 0.0, 0.0]);
        assert!((j - 0.25).abs() < 1e-9);
    }

    #[test]
    fn test_jain_empty_is_one() {
        assert_eq!(jain_fairness_index(&[]), 1.0);
        assert_eq!(jain_fairness_index(&[0.0, 0.0]), 1.0);
    }
}
