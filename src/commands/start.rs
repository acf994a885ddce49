use anyhow::Result;
use colored::Colorize;
use logrelay::{config, server};
use std::path::PathBuf;
use tracing::info;

/// Execute the start command
///
/// Loads configuration, then serves until SIGINT/SIGTERM.
pub async fn execute(config_path: PathBuf) -> Result<()> {
    println!("{}", "Starting logrelay...".green());

    let cfg = config::load_config(&config_path)?;
    info!(config = %config_path.display(), "Configuration loaded");

    server::start_server(cfg, config_path).await
}
