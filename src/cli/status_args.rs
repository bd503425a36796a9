// src/cli/status_args.rs
use clap::Args;
use std::path::PathBuf;

/// Arguments for inspecting a daemon state directory.
#[derive(Args, Debug)]
pub struct StatusArgs {
    /// State directory to inspect (defaults to the configured one)
    #[arg(long, value_name = "DIR")]
    pub state_dir: Option<PathBuf>,

    /// Emit machine-readable JSON instead of tables
    #[arg(long)]
    pub json: bool,
}
