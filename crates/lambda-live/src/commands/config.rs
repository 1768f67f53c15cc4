use async_trait::async_trait;
use eyre::Result;
use std::io::Write;
use std::path::PathBuf;

use super::{Command, Overrides, resolve_config};

pub struct ConfigCommand {
    pub path: Option<PathBuf>,
}

#[async_trait]
impl Command for ConfigCommand {
    async fn execute(&self) -> Result<()> {
        let config = resolve_config(self.path.as_deref(), Overrides::default())?;

        let mut stdout = std::io::stdout();
        writeln!(stdout, "# root: {}", config.root.display())?;
        writeln!(stdout, "{}", config.to_toml()?)?;
        Ok(())
    }
}
