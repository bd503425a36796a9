//! Configuration builder for fluent test configuration creation.
//!
//! This module provides a fluent API for building test configurations,
//! making it easy to create specific configuration scenarios for testing.

use crate::config::{
    Config, ProjectConfig, ResourceQuota, SchedulingAlgorithm, TestConfigService,
};

/// Fluent builder for creating test configurations.
///
/// # Examples
///
/// ```rust
/// use repopilot::config::{SchedulingAlgorithm, TestConfigBuilder};
///
/// let config = TestConfigBuilder::new()
///     .with_algorithm(SchedulingAlgorithm::PriorityBased)
///     .with_max_concurrent(1)
///     .with_project("demo", "octocat", "hello-world")
///     .build_config();
/// assert_eq!(config.projects.len(), 1);
/// ```
pub struct TestConfigBuilder {
    config: Config,
}

impl TestConfigBuilder {
    /// Create a new configuration builder with default values.
    pub fn new() -> Self {
        Self {
            config: Config::default(),
        }
    }

    /// Set the number of worker slots.
    pub fn with_max_concurrent(mut self, max_concurrent: usize) -> Self {
        self.config.daemon.max_concurrent = max_concurrent;
        self
    }

    /// Set the state directory.
    pub fn with_state_dir(mut self, dir: impl Into<std::path::PathBuf>) -> Self {
        self.config.daemon.state_dir = Some(dir.into());
        self
    }

    /// Select the active scheduling algorithm.
    pub fn with_algorithm(mut self, algorithm: SchedulingAlgorithm) -> Self {
        self.config.scheduling.algorithm = algorithm;
        self
    }

    /// Enable or disable the dynamic-priority adjuster.
    pub fn with_dynamic_priority(mut self, enabled: bool) -> Self {
        self.config.scheduling.dynamic_priority_enabled = enabled;
        self
    }

    /// Enable or disable resource-quota enforcement.
    pub fn with_resource_quotas(mut self, enabled: bool) -> Self {
        self.config.scheduling.resource_quota_enabled = enabled;
        self
    }

    /// Set the retry cap for failing tasks.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.config.rate_limit.max_retries = max_retries;
        self
    }

    /// Set the GitHub API base URL (typically a wiremock server URI).
    pub fn with_github_base_url(mut self, base_url: &str) -> Self {
        self.config.github.base_url = base_url.to_string();
        self
    }

    /// Set the AI tool command and arguments.
    pub fn with_ai_command(mut self, command: &str, args: &[&str]) -> Self {
        self.config.ai.command = command.to_string();
        self.config.ai.args = args.iter().map(|s| s.to_string()).collect();
        self
    }

    /// Register a project with default settings.
    pub fn with_project(mut self, id: &str, owner: &str, repo: &str) -> Self {
        self.config.projects.push(ProjectConfig::new(id, owner, repo));
        self
    }

    /// Register a fully specified project.
    pub fn with_project_config(mut self, project: ProjectConfig) -> Self {
        self.config.projects.push(project);
        self
    }

    /// Set the fairness weight of the most recently added project.
    pub fn with_share_weight(mut self, weight: f64) -> Self {
        if let Some(project) = self.config.projects.last_mut() {
            project.share_weight = weight;
        }
        self
    }

    /// Set the resource quota of the most recently added project.
    pub fn with_quota(mut self, max_concurrent: usize) -> Self {
        if let Some(project) = self.config.projects.last_mut() {
            project.resource_quota = Some(ResourceQuota {
                max_concurrent,
                cpu: None,
                memory: None,
            });
        }
        self
    }

    /// Build the final configuration value.
    pub fn build_config(self) -> Config {
        self.config
    }

    /// Build a [`TestConfigService`] holding the configuration.
    pub fn build_service(self) -> TestConfigService {
        TestConfigService::with_config(self.config)
    }
}

impl Default for TestConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_chains_project_settings() {
        let config = TestConfigBuilder::new()
            .with_project("a", "octo", "alpha")
            .with_share_weight(2.0)
            .with_quota(3)
            .with_project("b", "octo", "beta")
            .build_config();

        assert_eq!(config.projects.len(), 2);
        assert_eq!(config.projects[0].share_weight, 2.0);
        assert_eq!(config.projects[0].resource_quota.as_ref().unwrap().max_concurrent, 3);
        assert_eq!(config.projects[1].share_weight, 1.0);
    }
}
