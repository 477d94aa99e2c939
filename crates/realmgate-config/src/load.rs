//! Reading realmgate's config layers.
//!
//! Two files are read, the later one replacing whole sections of the
//! earlier: `<config dir>/config.toml`, then `realmgate.toml` in the project
//! directory. `REALMGATE_*` provider overrides are applied on top.

use std::path::{Path, PathBuf};

use crate::{CLIENT_SECRET_ENV, ConfigError, RealmgateConfig, Result};

/// File name of the user config inside the config directory.
pub const USER_CONFIG_FILE: &str = "config.toml";

/// File name of the project-local config.
pub const PROJECT_CONFIG_FILE: &str = "realmgate.toml";

/// Platform config directory for realmgate, e.g. `~/.config/realmgate`.
pub fn default_config_dir() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("realmgate"))
}

/// A merged config and what went into it.
#[derive(Debug, Clone, Default)]
pub struct LoadedConfig {
    pub config: RealmgateConfig,
    /// Files that contributed, lowest precedence first.
    pub files: Vec<PathBuf>,
    /// Problems found while loading. None of them stop the load.
    pub warnings: Vec<String>,
}

impl LoadedConfig {
    fn read_layer(&mut self, path: &Path) {
        if !path.is_file() {
            return;
        }
        match RealmgateConfig::from_file(path) {
            Ok(layer) => {
                if layer
                    .provider
                    .as_ref()
                    .is_some_and(|p| p.has_plaintext_secret())
                {
                    self.warnings.push(format!(
                        "{} stores a plaintext client_secret; set {} instead",
                        path.display(),
                        CLIENT_SECRET_ENV
                    ));
                }
                self.config.merge(layer);
                self.files.push(path.to_path_buf());
            }
            Err(e) => self
                .warnings
                .push(format!("Skipped {}: {}", path.display(), e)),
        }
    }
}

impl RealmgateConfig {
    /// Parse a single config file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
            path: path.display().to_string(),
            source: e,
        })?;
        Self::from_toml(&contents)
    }

    /// Load the user and project layers, then the process environment.
    ///
    /// A missing `config_dir` skips the user layer.
    pub fn load(config_dir: Option<&Path>, project_dir: &Path) -> LoadedConfig {
        Self::load_with(config_dir, project_dir, |key| {
            std::env::var(key).ok().filter(|v| !v.is_empty())
        })
    }

    /// Like [`load`](Self::load), with overrides taken from `lookup`.
    pub fn load_with<F>(config_dir: Option<&Path>, project_dir: &Path, lookup: F) -> LoadedConfig
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut loaded = LoadedConfig::default();
        let layers = [
            config_dir.map(|dir| dir.join(USER_CONFIG_FILE)),
            Some(project_dir.join(PROJECT_CONFIG_FILE)),
        ];
        for path in layers.into_iter().flatten() {
            loaded.read_layer(&path);
        }
        // Overrides come after the secret check: a secret from the
        // environment is the recommended setup.
        loaded.config.apply_overrides_from(lookup);
        loaded
    }
}
