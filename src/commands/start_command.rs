//! `start` command: run the orchestration daemon in the foreground.

use std::sync::Arc;

use crate::cli::{print_warning, StartArgs};
use crate::config::ConfigService;
use crate::core::supervisor::Supervisor;
use crate::Result;

/// Boot the daemon and run until a shutdown signal.
///
/// Exits cleanly (without error) when another instance already holds the
/// process lock for the same state directory.
pub async fn execute_with_config(
    args: StartArgs,
    config_service: Arc<dyn ConfigService>,
) -> Result<()> {
    let mut config = config_service.get_config()?;
    if let Some(dir) = args.state_dir {
        config.daemon.state_dir = Some(dir);
    }

    match Supervisor::bootstrap(config, args.dry_run).await? {
        None => {
            print_warning("another instance is already running; nothing to do");
            Ok(())
        }
        Some(supervisor) => {
            log::info!("repopilot {} started (pid {})", crate::VERSION, std::process::id());
            supervisor.run().await
        }
    }
}
