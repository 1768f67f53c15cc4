use clap::Parser;
use eyre::Result;

use lambda_live::cli::{Cli, Commands};
use lambda_live::commands::{Command, Overrides, config::ConfigCommand, start::StartCommand};

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = Cli::parse();

    // Load .env file if it exists
    lambda_live::cli::config::load_env()?;

    // Level configured via RUST_LOG, file sink via LAMBDA_LIVE_LOG_FILE
    lambda_live_core::utils::tracing::init_tracing()?;

    match cli.command {
        Commands::Start { debug, port } => {
            StartCommand {
                config: cli.config,
                overrides: Overrides { debug, port },
            }
            .execute()
            .await
        }
        Commands::Config => ConfigCommand { path: cli.config }.execute().await,
    }
}
