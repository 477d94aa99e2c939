//! Configuration system for realmgate.
//!
//! Provides TOML-based configuration with:
//! - `[provider]` identity provider endpoints and client registration
//! - `[session]` refresh leeway, gateway timeout and retry policy
//! - `[logging]` console level and JSON log file toggle
//! - Config file layering (user config + project-local overrides)
//! - Environment overrides for the provider section

pub mod error;
pub mod load;
pub mod types;

pub use error::{ConfigError, Result};
pub use load::{LoadedConfig, PROJECT_CONFIG_FILE, USER_CONFIG_FILE, default_config_dir};
pub use types::*;
