use crate::{cli::Commands, config::ConfigService, Result};
use std::sync::Arc;

/// Central command dispatcher to avoid code duplication.
///
/// This module provides a unified way to dispatch commands, so the CLI
/// entry point and any embedding code share the same execution path.
///
/// # Design Principles
///
/// - **Single Responsibility**: Each command handler handles exactly one
///   command type
/// - **Error Handling**: Unified error handling across all command paths
/// - **Testability**: Individual command dispatch is testable without a
///   full CLI setup
///
/// # Examples
///
/// ```rust
/// use repopilot::commands::dispatcher::dispatch_command;
/// use repopilot::cli::{Commands, ConfigAction, ConfigArgs};
/// use repopilot::config::TestConfigService;
/// use std::sync::Arc;
///
/// # async fn example() -> repopilot::Result<()> {
/// let config_service = Arc::new(TestConfigService::with_defaults());
/// let args = ConfigArgs { action: ConfigAction::Validate };
/// dispatch_command(Commands::Config(args), config_service).await?;
/// # Ok(())
/// # }
/// ```
pub async fn dispatch_command(
    command: Commands,
    config_service: Arc<dyn ConfigService>,
) -> Result<()> {
    match command {
        Commands::Start(args) => {
            crate::commands::start_command::execute_with_config(args, config_service).await
        }
        Commands::Status(args) => {
            crate::commands::status_command::execute_with_config(args, config_service).await
        }
        Commands::Queue(args) => {
            crate::commands::queue_command::execute_with_config(args, config_service).await
        }
        Commands::Config(args) => {
            crate::commands::config_command::execute_with_config(args, config_service).await
        }
        Commands::GenerateCompletion(args) => {
            let mut cmd = <crate::cli::Cli as clap::CommandFactory>::command();
            let cmd_name = cmd.get_name().to_string();
            let mut stdout = std::io::stdout();
            clap_complete::generate(args.shell, &mut cmd, cmd_name, &mut stdout);
            Ok(())
        }
    }
}
