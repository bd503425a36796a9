//! Configuration validation providing validation rules and constraints.
//!
//! Validation runs after deserialization and before any component consumes
//! the configuration, so components can assume every field is in range.

use crate::config::Config;
use crate::error::RepoPilotError;
use crate::Result;

/// Validate a full configuration tree.
///
/// # Errors
///
/// Returns a [`RepoPilotError::Config`] naming the first offending field.
pub fn validate_config(config: &Config) -> Result<()> {
    if config.daemon.max_concurrent == 0 {
        return Err(invalid("daemon.max_concurrent", "must be at least 1"));
    }
    if config.defaults.check_interval_ms == 0 {
        return Err(invalid("defaults.check_interval_ms", "must be positive"));
    }
    if config.defaults.task_timeout_ms == 0 {
        return Err(invalid("defaults.task_timeout_ms", "must be positive"));
    }
    if config.defaults.stall_timeout_ms == 0 {
        return Err(invalid("defaults.stall_timeout_ms", "must be positive"));
    }

    validate_rate_limit(config)?;
    validate_scheduling(config)?;
    validate_logging(config)?;
    validate_github(config)?;

    for project in &config.projects {
        validate_project(config, project)?;
    }
    let mut seen = std::collections::HashSet::new();
    for project in &config.projects {
        if !seen.insert(project.id.as_str()) {
            return Err(invalid(
                "projects.id",
                &format!("duplicate project id '{}'", project.id),
            ));
        }
    }
    Ok(())
}

fn validate_rate_limit(config: &Config) -> Result<()> {
    let rl = &config.rate_limit;
    if rl.initial_backoff_ms == 0 {
        return Err(invalid("rate_limit.initial_backoff_ms", "must be positive"));
    }
    if rl.max_backoff_ms < rl.initial_backoff_ms {
        return Err(invalid(
            "rate_limit.max_backoff_ms",
            "must be >= initial_backoff_ms",
        ));
    }
    if rl.multiplier < 1.0 {
        return Err(invalid("rate_limit.multiplier", "must be >= 1.0"));
    }
    if !(0.0..=1.0).contains(&rl.jitter_fraction) {
        return Err(invalid(
            "rate_limit.jitter_fraction",
            "must be within [0.0, 1.0]",
        ));
    }
    if rl.max_retries == 0 {
        return Err(invalid("rate_limit.max_retries", "must be at least 1"));
    }
    Ok(())
}

fn validate_scheduling(config: &Config) -> Result<()> {
    let s = &config.scheduling;
    if s.poll_interval_ms == 0 {
        return Err(invalid("scheduling.poll_interval_ms", "must be positive"));
    }
    if s.min_polling_interval_ms == 0 {
        return Err(invalid(
            "scheduling.min_polling_interval_ms",
            "must be positive",
        ));
    }
    if s.max_polling_interval_ms < s.min_polling_interval_ms {
        return Err(invalid(
            "scheduling.max_polling_interval_ms",
            "must be >= min_polling_interval_ms",
        ));
    }
    Ok(())
}

fn validate_logging(config: &Config) -> Result<()> {
    match config.logging.level.as_str() {
        "debug" | "info" | "warn" | "error" => Ok(()),
        other => Err(invalid(
            "logging.level",
            &format!("unknown level '{}', expected debug|info|warn|error", other),
        )),
    }
}

fn validate_github(config: &Config) -> Result<()> {
    url::Url::parse(&config.github.base_url)
        .map_err(|e| invalid("github.base_url", &e.to_string()))?;
    Ok(())
}

fn validate_project(config: &Config, project: &crate::config::ProjectConfig) -> Result<()> {
    if project.id.is_empty() || project.owner.is_empty() || project.repo.is_empty() {
        return Err(invalid("projects", "id, owner, and repo are all required"));
    }
    if project.id.contains(['/', '\\']) {
        return Err(invalid(
            "projects.id",
            "must not contain path separators; it names state files",
        ));
    }
    if project.base_priority > 100 {
        return Err(invalid("projects.base_priority", "must be within [0, 100]"));
    }
    if project.share_weight <= 0.0 {
        return Err(invalid("projects.share_weight", "must be positive"));
    }
    if let Some(quota) = &project.resource_quota {
        if quota.max_concurrent == 0 {
            return Err(invalid(
                "projects.resource_quota.max_concurrent",
                "must be at least 1",
            ));
        }
        if quota.max_concurrent > config.daemon.max_concurrent {
            log::warn!(
                "project '{}' quota max_concurrent {} exceeds daemon capacity {}",
                project.id,
                quota.max_concurrent,
                config.daemon.max_concurrent
            );
        }
        if let Some(cpu) = &quota.cpu {
            crate::core::queue::parse_cpu_share(cpu)
                .ok_or_else(|| invalid("projects.resource_quota.cpu", "unparseable CPU share"))?;
        }
        if let Some(memory) = &quota.memory {
            crate::core::queue::parse_memory_share(memory).ok_or_else(|| {
                invalid("projects.resource_quota.memory", "unparseable memory share")
            })?;
        }
    }
    Ok(())
}

fn invalid(field: &str, message: &str) -> RepoPilotError {
    RepoPilotError::config(format!("{}: {}", field, message))
}
