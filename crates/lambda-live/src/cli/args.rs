use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Run deployed Lambda functions against the code on this machine.
#[derive(Parser)]
#[command(version, about, long_about = None, author)]
pub struct Cli {
    /// Path to lambda-live.toml (defaults to the current directory)
    #[arg(short, long, global = true, env = "LAMBDA_LIVE_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Clone, Debug, PartialEq, Eq)]
pub enum Commands {
    /// Start a live session and serve invocations until Ctrl+C
    Start {
        /// Attach mode: serve every instance from one externally started runtime client
        #[arg(long)]
        debug: bool,
        /// Preferred port for the local runtime API
        #[arg(short, long, env = "LAMBDA_LIVE_PORT")]
        port: Option<u16>,
    },
    /// Print the resolved configuration
    Config,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_flags() {
        let cli = Cli::try_parse_from([
            "lambda-live",
            "start",
            "--debug",
            "--port",
            "9001",
            "--config",
            "svc/lambda-live.toml",
        ])
        .unwrap();

        assert_eq!(cli.config, Some(PathBuf::from("svc/lambda-live.toml")));
        assert_eq!(
            cli.command,
            Commands::Start {
                debug: true,
                port: Some(9001),
            }
        );
    }

    #[test]
    fn config_subcommand() {
        let cli = Cli::try_parse_from(["lambda-live", "config"]).unwrap();
        assert_eq!(cli.command, Commands::Config);
    }

    #[test]
    fn a_subcommand_is_required() {
        assert!(Cli::try_parse_from(["lambda-live"]).is_err());
    }
}
