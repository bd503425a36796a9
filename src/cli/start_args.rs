// src/cli/start_args.rs
use clap::Args;
use std::path::PathBuf;

/// Arguments for running the daemon.
#[derive(Args, Debug)]
pub struct StartArgs {
    /// Discover and enqueue work but execute no child processes
    #[arg(long)]
    pub dry_run: bool,

    /// Override the state directory from configuration
    #[arg(long, value_name = "DIR")]
    pub state_dir: Option<PathBuf>,
}
