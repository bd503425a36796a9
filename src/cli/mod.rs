//! Command-line interface for the RepoPilot orchestration daemon.
//!
//! This module provides the top-level CLI application structure and
//! subcommands for running the daemon, inspecting its state directory,
//! managing the pending queue, configuration management, and shell
//! completion generation.
//!
//! # Architecture
//!
//! The CLI is built using `clap` and follows a subcommand pattern:
//! - `start` - Run the orchestration daemon in the foreground
//! - `status` - Inspect a daemon's state directory
//! - `queue` - List, add, or remove pending tasks
//! - `config` - Configuration management and inspection
//! - `generate-completion` - Shell completion script generation
//!
//! # Examples
//!
//! ```bash
//! # Run the daemon with an explicit configuration file
//! repopilot --config ./repopilot.toml start
//!
//! # Inspect a state directory
//! repopilot status --state-dir ~/.local/state/repopilot
//!
//! # List the pending queue
//! repopilot queue list
//! ```

mod config_args;
mod generate_completion_args;
mod queue_args;
mod start_args;
mod status_args;
pub mod ui;

use clap::{Parser, Subcommand};
pub use config_args::{ConfigAction, ConfigArgs};
pub use generate_completion_args::GenerateCompletionArgs;
pub use queue_args::{QueueAction, QueueArgs};
pub use start_args::StartArgs;
pub use status_args::StatusArgs;
pub use ui::{print_error, print_success, print_warning};

use crate::config::{ConfigService, ProductionConfigService};
use std::sync::Arc;

/// Main CLI application structure defining the top-level interface.
#[derive(Parser, Debug)]
#[command(name = "repopilot")]
#[command(about = "AI-assisted issue orchestration daemon for GitHub repositories")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Cli {
    /// Path to the configuration file (defaults to the user config dir)
    #[arg(long, global = true, value_name = "FILE")]
    pub config: Option<std::path::PathBuf>,

    /// The subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available subcommands for the RepoPilot CLI application.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the orchestration daemon in the foreground
    Start(StartArgs),

    /// Inspect the daemon's persistent state
    Status(StatusArgs),

    /// List, add, or remove pending tasks
    Queue(QueueArgs),

    /// Manage and inspect application configuration
    Config(ConfigArgs),

    /// Generate shell completion scripts
    GenerateCompletion(GenerateCompletionArgs),
}

/// Executes the RepoPilot CLI application with parsed arguments.
///
/// This is the main entry point for CLI execution, routing parsed
/// command-line arguments to their respective command handlers through
/// the central dispatcher.
///
/// # Error Handling
///
/// Returns a [`crate::Result<()>`] that wraps any errors encountered
/// during command execution. Errors are propagated up to the main
/// function for proper exit code handling.
pub async fn run() -> crate::Result<()> {
    let cli = Cli::parse();
    let config_service: Arc<dyn ConfigService> = match &cli.config {
        Some(path) => Arc::new(ProductionConfigService::with_config_path(path.clone())),
        None => Arc::new(ProductionConfigService::new()?),
    };
    crate::commands::dispatcher::dispatch_command(cli.command, config_service).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_structure_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_start_with_flags() {
        let cli = Cli::parse_from(["repopilot", "start", "--dry-run"]);
        match cli.command {
            Commands::Start(args) => assert!(args.dry_run),
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_parse_queue_add() {
        let cli = Cli::parse_from([
            "repopilot", "queue", "add", "--project", "demo", "--issue", "42", "--title",
            "do it",
        ]);
        match cli.command {
            Commands::Queue(args) => match args.action {
                QueueAction::Add { project, issue, .. } => {
                    assert_eq!(project, "demo");
                    assert_eq!(issue, 42);
                }
                other => panic!("unexpected action: {:?}", other),
            },
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_global_config_flag() {
        let cli = Cli::parse_from(["repopilot", "--config", "/tmp/x.toml", "status"]);
        assert_eq!(cli.config.unwrap().to_str().unwrap(), "/tmp/x.toml");
    }
}
