// src/cli/queue_args.rs
use clap::{Args, Subcommand};
use std::path::PathBuf;

/// Arguments for pending-queue management.
#[derive(Args, Debug)]
pub struct QueueArgs {
    /// State directory to operate on (defaults to the configured one)
    #[arg(long, global = true, value_name = "DIR")]
    pub state_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub action: QueueAction,
}

/// Queue operations.
#[derive(Subcommand, Debug)]
pub enum QueueAction {
    /// List pending and running tasks
    List {
        /// Emit machine-readable JSON instead of tables
        #[arg(long)]
        json: bool,
    },
    /// Append a custom task to the pending queue
    Add {
        /// Project the task belongs to
        #[arg(long)]
        project: String,
        /// Issue number the task operates on
        #[arg(long)]
        issue: u64,
        /// Human-readable description fed to the AI tool
        #[arg(long)]
        title: String,
        /// Base priority in [0, 100]
        #[arg(long, default_value_t = 50)]
        priority: u8,
    },
    /// Remove a pending task by id
    Remove {
        /// Task id as shown by `queue list`
        task_id: String,
    },
}
