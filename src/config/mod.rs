// src/config/mod.rs
//! Configuration management module for RepoPilot.
//!
//! This module provides the complete configuration service system with
//! dependency injection support and comprehensive type definitions.
//!
//! # Key Components
//!
//! - [`Config`] - Main configuration structure containing all settings
//! - [`ConfigService`] - Service interface for configuration management
//! - [`ProductionConfigService`] - Production implementation with file I/O
//! - [`TestConfigService`] - Test implementation with controlled behavior
//! - [`TestConfigBuilder`] - Builder pattern for test configurations
//!
//! # Examples
//!
//! ```rust
//! use repopilot::config::{Config, ConfigService, TestConfigService};
//!
//! let config_service = TestConfigService::with_defaults();
//! let config = config_service.get_config().unwrap();
//! assert!(config.daemon.max_concurrent >= 1);
//! ```
//!
//! # Architecture
//!
//! The configuration system uses dependency injection to provide testable
//! and maintainable configuration management. All configuration access
//! should go through the [`ConfigService`] trait.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

mod builder;
mod service;
mod validator;

pub use builder::TestConfigBuilder;
pub use service::{ConfigService, ProductionConfigService, TestConfigService};
pub use validator::validate_config;

/// Main configuration structure containing all daemon settings.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Daemon process settings (worker count, admin endpoint, state dir)
    pub daemon: DaemonConfig,
    /// Fallback values applied when a project omits its own
    pub defaults: DefaultsConfig,
    /// Backoff and retry policy for upstream rate limits
    pub rate_limit: RateLimitConfig,
    /// Queue scheduling algorithm and tuning
    pub scheduling: SchedulingConfig,
    /// Logging verbosity
    pub logging: LoggingConfig,
    /// GitHub API endpoint and credentials
    pub github: GitHubConfig,
    /// External AI tool invocation settings
    pub ai: AiToolConfig,
    /// Registered projects to poll for work
    pub projects: Vec<ProjectConfig>,
}

/// Daemon-level process settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Number of concurrent worker slots
    pub max_concurrent: usize,
    /// Port reserved for the external admin layer
    pub port: u16,
    /// Host reserved for the external admin layer
    pub host: String,
    /// Directory holding all persistent state; `None` selects the
    /// platform default under the user state directory
    pub state_dir: Option<PathBuf>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            // Child processes are heavyweight; cap well below core count
            max_concurrent: (num_cpus::get() / 2).clamp(1, 4),
            port: 3003,
            host: "127.0.0.1".to_string(),
            state_dir: None,
        }
    }
}

impl DaemonConfig {
    /// Resolve the state directory, falling back to the platform default.
    pub fn resolved_state_dir(&self) -> PathBuf {
        self.state_dir.clone().unwrap_or_else(|| {
            dirs::state_dir()
                .or_else(dirs::data_local_dir)
                .unwrap_or_else(|| PathBuf::from("."))
                .join("repopilot")
        })
    }
}

/// Default timing values applied when projects omit their own.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DefaultsConfig {
    /// Default polling interval in milliseconds
    pub check_interval_ms: u64,
    /// Default per-task execution timeout in milliseconds
    pub task_timeout_ms: u64,
    /// A running task with no status update for this long is stalled
    pub stall_timeout_ms: u64,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            check_interval_ms: 60_000,
            task_timeout_ms: 600_000,
            stall_timeout_ms: 120_000,
        }
    }
}

impl DefaultsConfig {
    /// Default polling interval as a [`Duration`].
    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(self.check_interval_ms)
    }

    /// Default task timeout as a [`Duration`].
    pub fn task_timeout(&self) -> Duration {
        Duration::from_millis(self.task_timeout_ms)
    }

    /// Default stall window as a [`Duration`].
    pub fn stall_timeout(&self) -> Duration {
        Duration::from_millis(self.stall_timeout_ms)
    }
}

/// Exponential backoff policy for upstream rate limits and task retries.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// First retry delay in milliseconds
    pub initial_backoff_ms: u64,
    /// Upper bound on any retry delay in milliseconds
    pub max_backoff_ms: u64,
    /// Delay multiplier applied per attempt
    pub multiplier: f64,
    /// Symmetric jitter fraction applied to each delay (0.0..1.0)
    pub jitter_fraction: f64,
    /// Maximum retry attempts before a task fails terminally
    pub max_retries: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            initial_backoff_ms: 1_000,
            max_backoff_ms: 300_000,
            multiplier: 2.0,
            jitter_fraction: 0.1,
            max_retries: 5,
        }
    }
}

/// Scheduling algorithm selection for the global task queue.
///
/// Exactly one algorithm is active per daemon instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SchedulingAlgorithm {
    /// Strict descending effective-priority order
    PriorityBased,
    /// Weighted fair queuing with per-project share tokens
    WeightedFair,
    /// Earliest deadline first, undated tasks behind dated ones
    DeadlineAware,
    /// Priority order restricted by per-project concurrency quotas
    ResourceAware,
}

/// Queue scheduling configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulingConfig {
    /// Active queue ordering algorithm
    pub algorithm: SchedulingAlgorithm,
    /// Enable the periodic dynamic-priority adjuster
    pub dynamic_priority_enabled: bool,
    /// Enforce per-project resource quotas at dispatch
    pub resource_quota_enabled: bool,
    /// Adjuster/replenishment tick interval in milliseconds
    pub poll_interval_ms: u64,
    /// Maximum queued tasks before enqueue is refused
    pub max_queue_depth: usize,
    /// Global lower bound on project polling intervals (ms)
    pub min_polling_interval_ms: u64,
    /// Global upper bound on project polling intervals (ms)
    pub max_polling_interval_ms: u64,
}

impl Default for SchedulingConfig {
    fn default() -> Self {
        Self {
            algorithm: SchedulingAlgorithm::WeightedFair,
            dynamic_priority_enabled: true,
            resource_quota_enabled: false,
            poll_interval_ms: 1_000,
            max_queue_depth: 1_000,
            min_polling_interval_ms: 10_000,
            max_polling_interval_ms: 3_600_000,
        }
    }
}

/// Logging verbosity configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// One of `debug`, `info`, `warn`, `error`
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// GitHub API endpoint and authentication settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GitHubConfig {
    /// REST API base URL; overridable for GitHub Enterprise or tests
    pub base_url: String,
    /// Personal access token; anonymous requests when absent
    pub token: Option<String>,
    /// Minimum remaining API budget required before a poll proceeds
    pub min_remaining_calls: u32,
}

impl Default for GitHubConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.github.com".to_string(),
            token: None,
            min_remaining_calls: 10,
        }
    }
}

/// External AI command-line tool invocation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AiToolConfig {
    /// Executable to spawn for each task
    pub command: String,
    /// Arguments passed before the prompt is written to stdin
    pub args: Vec<String>,
}

impl Default for AiToolConfig {
    fn default() -> Self {
        Self {
            command: "claude".to_string(),
            args: vec!["--print".to_string()],
        }
    }
}

/// Per-project resource quota limiting concurrent executions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceQuota {
    /// Maximum tasks of this project running at once
    pub max_concurrent: usize,
    /// CPU share in Kubernetes notation (`"500m"` is half a core)
    pub cpu: Option<String>,
    /// Memory share in Kubernetes notation (`"1Gi"`, `"512Mi"`)
    pub memory: Option<String>,
}

/// Optional per-project scheduling targets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ProjectSchedulingConfig {
    /// Default deadline horizon (days) applied when an issue has none
    pub deadline_days: Option<u32>,
    /// Target completions per hour; falling short raises dynamic priority
    pub min_throughput: Option<f64>,
    /// Target average latency in seconds; exceeding it raises dynamic priority
    pub max_latency_secs: Option<f64>,
    /// Per-task execution timeout override in milliseconds
    pub task_timeout_ms: Option<u64>,
    /// Per-task stall window override in milliseconds
    pub stall_timeout_ms: Option<u64>,
}

/// A registered upstream repository the daemon polls for work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectConfig {
    /// Stable project identifier used in task ids and state files
    pub id: String,
    /// Repository owner (user or organization)
    pub owner: String,
    /// Repository name
    pub repo: String,
    /// Polling interval in milliseconds; clamped to the global bounds
    #[serde(default)]
    pub polling_interval_ms: Option<u64>,
    /// Only issues carrying at least one of these labels are eligible;
    /// an empty list admits every open issue
    #[serde(default)]
    pub labels: Vec<String>,
    /// Issues carrying any of these labels are skipped
    #[serde(default)]
    pub exclude_labels: Vec<String>,
    /// Also poll recent comments on eligible issues
    #[serde(default)]
    pub process_comments: bool,
    /// Also poll open non-draft pull requests
    #[serde(default)]
    pub process_pull_requests: bool,
    /// Base priority contributed to every task of this project (0-100)
    #[serde(default = "default_base_priority")]
    pub base_priority: u8,
    /// Fairness weight under weighted-fair scheduling
    #[serde(default = "default_share_weight")]
    pub share_weight: f64,
    /// Optional concurrency/CPU/memory quota
    #[serde(default)]
    pub resource_quota: Option<ResourceQuota>,
    /// Optional scheduling targets
    #[serde(default)]
    pub scheduling: Option<ProjectSchedulingConfig>,
    /// Working directory the AI tool runs in (project checkout)
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    /// Environment overlay applied to every child of this project
    #[serde(default)]
    pub env: std::collections::HashMap<String, String>,
    /// Disabled projects keep their registration but are not polled
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_base_priority() -> u8 {
    50
}

fn default_share_weight() -> f64 {
    1.0
}

fn default_enabled() -> bool {
    true
}

impl ProjectConfig {
    /// Minimal project definition with defaults for everything optional.
    pub fn new(id: &str, owner: &str, repo: &str) -> Self {
        Self {
            id: id.to_string(),
            owner: owner.to_string(),
            repo: repo.to_string(),
            polling_interval_ms: None,
            labels: Vec::new(),
            exclude_labels: Vec::new(),
            process_comments: false,
            process_pull_requests: false,
            base_priority: default_base_priority(),
            share_weight: default_share_weight(),
            resource_quota: None,
            scheduling: None,
            working_dir: None,
            env: std::collections::HashMap::new(),
            enabled: true,
        }
    }

    /// Effective polling interval, clamped to the global bounds.
    pub fn polling_interval(&self, defaults: &DefaultsConfig, bounds: &SchedulingConfig) -> Duration {
        let ms = self
            .polling_interval_ms
            .unwrap_or(defaults.check_interval_ms)
            .clamp(bounds.min_polling_interval_ms, bounds.max_polling_interval_ms);
        Duration::from_millis(ms)
    }

    /// Effective per-task timeout for this project.
    pub fn task_timeout(&self, defaults: &DefaultsConfig) -> Duration {
        let ms = self
            .scheduling
            .as_ref()
            .and_then(|s| s.task_timeout_ms)
            .unwrap_or(defaults.task_timeout_ms);
        Duration::from_millis(ms)
    }

    /// Effective stall window for this project.
    pub fn stall_timeout(&self, defaults: &DefaultsConfig) -> Duration {
        let ms = self
            .scheduling
            .as_ref()
            .and_then(|s| s.stall_timeout_ms)
            .unwrap_or(defaults.stall_timeout_ms);
        Duration::from_millis(ms)
    }
}
