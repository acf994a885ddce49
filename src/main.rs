use anyhow::Result;
use clap::Parser;

mod cli;
mod commands;

use logrelay::{config, init_tracing};

#[tokio::main]
async fn main() -> Result<()> {
    let args = cli::Cli::parse();

    // Logging settings come from the config file; fall back to defaults when it is unusable
    let server = config::load_config(&args.config)
        .map(|cfg| cfg.server)
        .unwrap_or_default();
    init_tracing(&server.log_level, server.log_format == "json");

    match args.get_command() {
        cli::Commands::Start => {
            commands::start::execute(args.config.clone()).await?;
        }
        cli::Commands::Send {
            message,
            level,
            endpoint,
        } => {
            commands::send::execute(&args.config, message, level, endpoint).await?;
        }
        cli::Commands::Config { action } => match action {
            cli::ConfigCommands::Show => commands::config::show(&args.config)?,
            cli::ConfigCommands::Validate => commands::config::validate(&args.config)?,
        },
        cli::Commands::Version => {
            println!("logrelay v{}", env!("CARGO_PKG_VERSION"));
        }
    }

    Ok(())
}
