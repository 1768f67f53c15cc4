use async_trait::async_trait;
use eyre::Result;
use std::path::Path;

use lambda_live_core::Config;

pub mod config;
pub mod start;

#[async_trait]
pub trait Command {
    async fn execute(&self) -> Result<()>;
}

/// Flags given on the command line; they win over the file.
#[derive(Debug, Clone, Copy, Default)]
pub struct Overrides {
    pub debug: bool,
    pub port: Option<u16>,
}

pub fn resolve_config(path: Option<&Path>, overrides: Overrides) -> Result<Config> {
    let mut config = Config::discover(path)?;
    if overrides.debug {
        config.debug = true;
    }
    if let Some(port) = overrides.port {
        config.runtime.port = port;
    }
    Ok(config)
}
