//! CLI command handlers.

use std::path::{Path, PathBuf};

use anyhow::Result;
use realmgate_config::{LoadedConfig, RealmgateConfig};

pub mod auth;
pub mod check;
pub mod config;
pub mod status;

/// Shared context for all commands.
#[derive(Debug, Clone)]
pub struct Context {
    /// Explicit config directory (`--config-dir`), if any.
    pub config_dir: Option<PathBuf>,
    /// Output as JSON for scripting.
    pub json_output: bool,
    /// Verbose output enabled.
    pub verbose: bool,
}

impl Context {
    /// Directory holding `config.toml`, `tokens.json` and `logs/`.
    pub fn data_dir(&self) -> Option<PathBuf> {
        self.config_dir
            .clone()
            .or_else(realmgate_config::default_config_dir)
    }

    /// Like [`data_dir`](Self::data_dir), as an error when unresolvable.
    pub fn require_data_dir(&self) -> Result<PathBuf> {
        self.data_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))
    }

    /// Merge the user config, `./realmgate.toml` and the environment.
    pub fn load_config(&self) -> LoadedConfig {
        RealmgateConfig::load(self.data_dir().as_deref(), Path::new("."))
    }

    /// Print a value as pretty JSON.
    pub fn print_json<T: serde::Serialize>(&self, value: &T) -> Result<()> {
        println!("{}", serde_json::to_string_pretty(value)?);
        Ok(())
    }
}
