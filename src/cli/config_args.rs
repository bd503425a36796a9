// src/cli/config_args.rs
use clap::{Args, Subcommand};

/// Arguments for configuration management.
#[derive(Args, Debug)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub action: ConfigAction,
}

/// Configuration operations.
#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Print the effective configuration as TOML
    Show,
    /// Print the configuration file path in use
    Path,
    /// Load and validate the configuration, reporting problems
    Validate,
}
