// src/cli/generate_completion_args.rs
use clap::Args;
use clap_complete::Shell;

/// Arguments for shell completion script generation.
#[derive(Args, Debug)]
pub struct GenerateCompletionArgs {
    /// Shell to generate a completion script for
    #[arg(value_enum)]
    pub shell: Shell,
}
