//! `config` command: show, locate, and validate configuration.

use std::sync::Arc;

use crate::cli::{print_success, ConfigAction, ConfigArgs};
use crate::config::ConfigService;
use crate::error::RepoPilotError;
use crate::Result;

/// Execute one configuration operation.
pub async fn execute_with_config(
    args: ConfigArgs,
    config_service: Arc<dyn ConfigService>,
) -> Result<()> {
    match args.action {
        ConfigAction::Show => {
            let config = config_service.get_config()?;
            let rendered = toml::to_string_pretty(&config).map_err(|e| {
                RepoPilotError::config(format!("failed to render configuration: {}", e))
            })?;
            println!("{}", rendered);
            Ok(())
        }
        ConfigAction::Path => {
            match config_service.config_file_path() {
                Some(path) => println!("{}", path.display()),
                None => println!("(in-memory configuration, no file)"),
            }
            Ok(())
        }
        ConfigAction::Validate => {
            // get_config runs full validation
            let config = config_service.get_config()?;
            print_success(&format!(
                "configuration valid: {} project(s), algorithm {:?}",
                config.projects.len(),
                config.scheduling.algorithm
            ));
            Ok(())
        }
    }
}
