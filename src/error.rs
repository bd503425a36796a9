//! Comprehensive error types for RepoPilot daemon operations.
//!
//! This module defines the `RepoPilotError` enum covering all error
//! conditions that can occur during project polling, task scheduling,
//! AI tool execution, state persistence, and general command execution.
//!
//! It also provides helper methods to construct errors and generate
//! user-friendly messages.
use thiserror::Error;

/// Represents all possible errors in the RepoPilot application.
///
/// Each variant provides specific context to facilitate debugging and
/// user-friendly reporting. Errors are grouped by recovery policy rather
/// than by origin: transient upstream failures carry enough information
/// for the retry machinery, terminal failures carry the final cause.
///
/// # Examples
///
/// ```rust
/// use repopilot::error::{RepoPilotError, RepoPilotResult};
///
/// fn example() -> RepoPilotResult<()> {
///     Err(RepoPilotError::TaskExecution {
///         task_id: "demo-42-1700000000".to_string(),
///         reason: "child exited with code 1".to_string(),
///     })
/// }
/// ```
///
/// # Exit Codes
///
/// Each error variant maps to an exit code via `RepoPilotError::exit_code`.
#[derive(Error, Debug)]
pub enum RepoPilotError {
    /// I/O operation failed during file system access.
    ///
    /// This variant wraps `std::io::Error` and provides context about
    /// state-directory operations that failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration error due to invalid or missing settings.
    ///
    /// Contains a human-readable message describing the issue.
    #[error("Configuration error: {message}")]
    Config {
        /// Description of the configuration error
        message: String,
    },

    /// GitHub API call failed.
    ///
    /// Carries the error message and, when available, the HTTP status
    /// returned by the upstream tracker.
    #[error("GitHub API error: {message}")]
    GitHubApi {
        /// Error message from the API
        message: String,
        /// HTTP status code, if the request reached the server
        status: Option<u16>,
    },

    /// The AI tool child process could not be spawned or failed.
    #[error("AI tool error: {0}")]
    AiTool(String),

    /// A task execution failed (non-zero exit, stall, or invalid result).
    #[error("Task {task_id} failed: {reason}")]
    TaskExecution {
        /// Identifier of the failed task
        task_id: String,
        /// Cause of the failure
        reason: String,
    },

    /// A task exceeded its execution timeout.
    #[error("Task {task_id} timed out (limit: {limit:?})")]
    TaskTimeout {
        /// Identifier of the timed-out task
        task_id: String,
        /// The effective timeout that was exceeded
        limit: std::time::Duration,
    },

    /// Persistent state could not be read, written, or locked.
    #[error("State error: {message}")]
    State {
        /// Description of the state-layer failure
        message: String,
    },

    /// A record failed validation and was archived.
    #[error("Validation error: {message}")]
    Validation {
        /// Description of the invalid record
        message: String,
    },

    /// An illegal task status transition was attempted.
    #[error("Invalid status transition for task {task_id}: {from} -> {to}")]
    InvalidTransition {
        /// Identifier of the task
        task_id: String,
        /// Status before the attempted transition
        from: String,
        /// Status the transition attempted to reach
        to: String,
    },

    /// Generic command execution error.
    #[error("{0}")]
    CommandExecution(String),

    /// Catch-all error variant wrapping any other failure.
    #[error("Unknown error: {0}")]
    Other(#[from] anyhow::Error),
}

// Convert reqwest error to GitHub API error
impl From<reqwest::Error> for RepoPilotError {
    fn from(err: reqwest::Error) -> Self {
        RepoPilotError::GitHubApi {
            message: err.to_string(),
            status: err.status().map(|s| s.as_u16()),
        }
    }
}

// Convert config crate error to configuration error
impl From<config::ConfigError> for RepoPilotError {
    fn from(err: config::ConfigError) -> Self {
        match err {
            config::ConfigError::NotFound(path) => RepoPilotError::Config {
                message: format!("Configuration file not found: {}", path),
            },
            config::ConfigError::Message(msg) => RepoPilotError::Config { message: msg },
            _ => RepoPilotError::Config {
                message: format!("Configuration error: {}", err),
            },
        }
    }
}

impl From<serde_json::Error> for RepoPilotError {
    fn from(err: serde_json::Error) -> Self {
        RepoPilotError::State {
            message: format!("JSON serialization/deserialization error: {}", err),
        }
    }
}

/// Specialized `Result` type for RepoPilot operations.
pub type RepoPilotResult<T> = Result<T, RepoPilotError>;

impl RepoPilotError {
    /// Create a configuration error with the given message.
    ///
    /// # Examples
    ///
    /// ```rust
    /// # use repopilot::error::RepoPilotError;
    /// let err = RepoPilotError::config("invalid setting");
    /// assert_eq!(err.to_string(), "Configuration error: invalid setting");
    /// ```
    pub fn config<S: Into<String>>(message: S) -> Self {
        RepoPilotError::Config {
            message: message.into(),
        }
    }

    /// Create a state-layer error with the given message.
    pub fn state<S: Into<String>>(message: S) -> Self {
        RepoPilotError::State {
            message: message.into(),
        }
    }

    /// Create a GitHub API error without an HTTP status.
    pub fn github_api<S: Into<String>>(message: S) -> Self {
        RepoPilotError::GitHubApi {
            message: message.into(),
            status: None,
        }
    }

    /// Create an AI tool error with the given message.
    pub fn ai_tool<S: Into<String>>(message: S) -> Self {
        RepoPilotError::AiTool(message.into())
    }

    /// Create a validation error with the given message.
    pub fn validation<S: Into<String>>(message: S) -> Self {
        RepoPilotError::Validation {
            message: message.into(),
        }
    }

    /// Create a task execution failure error with task ID and reason.
    pub fn task_execution_failed<S1, S2>(task_id: S1, reason: S2) -> Self
    where
        S1: Into<String>,
        S2: Into<String>,
    {
        RepoPilotError::TaskExecution {
            task_id: task_id.into(),
            reason: reason.into(),
        }
    }

    /// Create a task timeout error with task ID and duration.
    pub fn task_timeout<S: Into<String>>(task_id: S, limit: std::time::Duration) -> Self {
        RepoPilotError::TaskTimeout {
            task_id: task_id.into(),
            limit,
        }
    }

    /// Whether this error is worth retrying within the same task.
    ///
    /// Transient upstream failures (rate limits, 5xx, network) retry;
    /// validation failures and illegal transitions never do.
    pub fn is_transient(&self) -> bool {
        match self {
            RepoPilotError::GitHubApi { status, .. } => {
                matches!(status, None | Some(429) | Some(500..=599))
            }
            RepoPilotError::AiTool(_) | RepoPilotError::Io(_) => true,
            _ => false,
        }
    }

    /// Return the corresponding exit code for this error variant.
    ///
    /// # Examples
    ///
    /// ```rust
    /// # use repopilot::error::RepoPilotError;
    /// assert_eq!(RepoPilotError::config("x").exit_code(), 2);
    /// ```
    pub fn exit_code(&self) -> i32 {
        match self {
            RepoPilotError::Io(_) => 1,
            RepoPilotError::Config { .. } => 2,
            RepoPilotError::GitHubApi { .. } => 3,
            RepoPilotError::AiTool(_) => 3,
            RepoPilotError::TaskExecution { .. } => 4,
            RepoPilotError::TaskTimeout { .. } => 4,
            RepoPilotError::State { .. } => 5,
            RepoPilotError::Validation { .. } => 6,
            _ => 1,
        }
    }

    /// Return a user-friendly error message with suggested remedies.
    ///
    /// # Examples
    ///
    /// ```rust
    /// # use repopilot::error::RepoPilotError;
    /// let msg = RepoPilotError::config("missing key").user_friendly_message();
    /// assert!(msg.contains("Configuration error:"));
    /// ```
    pub fn user_friendly_message(&self) -> String {
        match self {
            RepoPilotError::Io(e) => format!("File operation error: {}", e),
            RepoPilotError::Config { message } => format!(
                "Configuration error: {}\nHint: run 'repopilot config --help' for details",
                message
            ),
            RepoPilotError::GitHubApi { message, status } => match status {
                Some(code) => format!(
                    "GitHub API error (HTTP {}): {}\nHint: check network connection and token settings",
                    code, message
                ),
                None => format!(
                    "GitHub API error: {}\nHint: check network connection and token settings",
                    message
                ),
            },
            RepoPilotError::AiTool(msg) => format!(
                "AI tool error: {}\nHint: verify the configured command is installed and on PATH",
                msg
            ),
            RepoPilotError::State { message } => format!(
                "State error: {}\nHint: inspect the state directory for damaged files",
                message
            ),
            RepoPilotError::Validation { message } => {
                format!("Validation error: {}", message)
            }
            RepoPilotError::TaskExecution { task_id, reason } => {
                format!("Task {} failed: {}", task_id, reason)
            }
            RepoPilotError::TaskTimeout { task_id, limit } => {
                format!("Task {} timed out (limit: {:?})", task_id, limit)
            }
            RepoPilotError::InvalidTransition { task_id, from, to } => {
                format!("Task {} attempted illegal transition {} -> {}", task_id, from, to)
            }
            RepoPilotError::CommandExecution(msg) => msg.clone(),
            RepoPilotError::Other(err) => {
                format!("Unknown error: {}\nHint: please report this issue", err)
            }
        }
    }
}

// Unit test: RepoPilotError error types and helper methods
#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_config_error_creation() {
        let error = RepoPilotError::config("test config error");
        assert!(matches!(error, RepoPilotError::Config { .. }));
        assert_eq!(error.to_string(), "Configuration error: test config error");
    }

    #[test]
    fn test_github_api_error_creation() {
        let error = RepoPilotError::github_api("boom");
        assert!(matches!(error, RepoPilotError::GitHubApi { .. }));
        assert!(error.to_string().contains("boom"));
    }

    #[test]
    fn test_io_error_conversion() {
        let io_error = io::Error::new(io::ErrorKind::NotFound, "file not found");
        let err: RepoPilotError = io_error.into();
        assert!(matches!(err, RepoPilotError::Io(_)));
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(RepoPilotError::config("test").exit_code(), 2);
        assert_eq!(RepoPilotError::github_api("test").exit_code(), 3);
        assert_eq!(RepoPilotError::state("test").exit_code(), 5);
        assert_eq!(RepoPilotError::validation("test").exit_code(), 6);
        assert_eq!(
            RepoPilotError::task_execution_failed("t", "r").exit_code(),
            4
        );
    }

    #[test]
    fn test_transient_classification() {
        assert!(
            RepoPilotError::GitHubApi {
                message: "server melted".into(),
                status: Some(502),
            }
            .is_transient()
        );
        assert!(
            !RepoPilotError::GitHubApi {
                message: "not found".into(),
                status: Some(404),
            }
            .is_transient()
        );
        assert!(!RepoPilotError::validation("bad record").is_transient());
    }

    #[test]
    fn test_user_friendly_messages() {
        let config_error = RepoPilotError::config("missing key");
        let message = config_error.user_friendly_message();
        assert!(message.contains("Configuration error:"));
        assert!(message.contains("repopilot config --help"));

        let ai_error = RepoPilotError::ai_tool("spawn failed");
        let message = ai_error.user_friendly_message();
        assert!(message.contains("AI tool error:"));
        assert!(message.contains("PATH"));
    }
}
