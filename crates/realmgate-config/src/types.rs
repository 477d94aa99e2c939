//! Configuration types mapping to the TOML schema.
//!
//! Top-level config:
//! ```toml
//! [provider]               # identity provider + client registration
//! [session]                # refresh / timeout / retry policy
//! [logging]                # console level, JSON log file
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::ConfigError;

/// Environment variable overriding `provider.server_url`.
pub const SERVER_URL_ENV: &str = "REALMGATE_SERVER_URL";
/// Environment variable overriding `provider.realm`.
pub const REALM_ENV: &str = "REALMGATE_REALM";
/// Environment variable overriding `provider.client_id`.
pub const CLIENT_ID_ENV: &str = "REALMGATE_CLIENT_ID";
/// Environment variable overriding `provider.client_secret`.
pub const CLIENT_SECRET_ENV: &str = "REALMGATE_CLIENT_SECRET";

// ─────────────────────────────────────────────────────────────────────────────
// Top-level Config
// ─────────────────────────────────────────────────────────────────────────────

/// Root configuration structure.
///
/// All sections are optional so that partial configs (e.g., project-local
/// overrides) can be loaded and merged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RealmgateConfig {
    /// Identity provider configuration.
    pub provider: Option<ProviderConfig>,

    /// Session lifecycle configuration.
    pub session: Option<SessionSection>,

    /// Logging configuration.
    pub logging: Option<LoggingConfig>,
}

impl RealmgateConfig {
    /// Create an empty config.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse from a TOML string.
    pub fn from_toml(toml_str: &str) -> crate::Result<Self> {
        Ok(toml::from_str(toml_str)?)
    }

    /// Serialize to a TOML string.
    pub fn to_toml(&self) -> crate::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Merge another config on top of this one (other takes priority).
    pub fn merge(&mut self, other: RealmgateConfig) {
        if other.provider.is_some() {
            self.provider = other.provider;
        }

        if other.session.is_some() {
            self.session = other.session;
        }

        if other.logging.is_some() {
            self.logging = other.logging;
        }
    }

    /// The provider section, validated.
    pub fn provider(&self) -> crate::Result<&ProviderConfig> {
        let provider = self.provider.as_ref().ok_or(ConfigError::NoProvider)?;
        provider.validate()?;
        Ok(provider)
    }

    /// The session section, or defaults when absent.
    pub fn session(&self) -> SessionSection {
        self.session.clone().unwrap_or_default()
    }

    /// The logging section, or defaults when absent.
    pub fn logging(&self) -> LoggingConfig {
        self.logging.clone().unwrap_or_default()
    }

    /// Apply provider overrides from an arbitrary lookup.
    ///
    /// Creates the `[provider]` section if an override is present and the
    /// section is missing.
    pub fn apply_overrides_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let server_url = lookup(SERVER_URL_ENV);
        let realm = lookup(REALM_ENV);
        let client_id = lookup(CLIENT_ID_ENV);
        let client_secret = lookup(CLIENT_SECRET_ENV);

        if server_url.is_none() && realm.is_none() && client_id.is_none() && client_secret.is_none()
        {
            return;
        }

        let provider = self.provider.get_or_insert_with(ProviderConfig::default);
        if let Some(v) = server_url {
            provider.server_url = v;
        }
        if let Some(v) = realm {
            provider.realm = v;
        }
        if let Some(v) = client_id {
            provider.client_id = v;
        }
        if let Some(v) = client_secret {
            provider.client_secret = Some(v);
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Provider Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Identity provider configuration.
///
/// ```toml
/// [provider]
/// server_url = "http://auth.localhost/"
/// realm = "my-organization"
/// client_id = "my-web-app"
/// redirect_uri = "http://localhost:3000/auth/callback"
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    /// Base URL of the identity server (without `/realms/...`).
    pub server_url: String,
    /// Realm name.
    pub realm: String,
    /// OAuth2 client ID.
    pub client_id: String,
    /// Client secret for confidential clients.
    pub client_secret: Option<String>,
    /// Redirect URI registered for the authorization code flow.
    pub redirect_uri: Option<String>,
    /// Requested scopes.
    pub scopes: Vec<String>,
    /// Resolve endpoints from the OIDC discovery document instead of
    /// deriving them from the realm path.
    pub discovery: bool,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            server_url: String::new(),
            realm: String::new(),
            client_id: String::new(),
            client_secret: None,
            redirect_uri: None,
            scopes: vec!["openid".to_string(), "profile".to_string(), "email".to_string()],
            discovery: false,
        }
    }
}

impl ProviderConfig {
    /// Check that the required fields are set.
    pub fn validate(&self) -> crate::Result<()> {
        for (field, value) in [
            ("server_url", &self.server_url),
            ("realm", &self.realm),
            ("client_id", &self.client_id),
        ] {
            if value.trim().is_empty() {
                return Err(ConfigError::MissingField {
                    field: field.to_string(),
                    context: "[provider]".to_string(),
                });
            }
        }

        if !(self.server_url.starts_with("http://") || self.server_url.starts_with("https://")) {
            return Err(ConfigError::InvalidValue {
                field: "provider.server_url".to_string(),
                reason: format!("'{}' is not an http(s) URL", self.server_url),
            });
        }

        Ok(())
    }

    /// Whether a plaintext client secret is stored in the config.
    pub fn has_plaintext_secret(&self) -> bool {
        self.client_secret.as_deref().is_some_and(|s| !s.is_empty())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Session Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Session lifecycle configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSection {
    /// Refresh this many seconds before the access token expires.
    pub refresh_leeway_secs: u64,
    /// Timeout applied to every call to the identity provider.
    pub gateway_timeout_secs: u64,
    /// Retries for transient refresh failures before forcing re-login.
    pub refresh_max_retries: u32,
    /// Base delay for exponential refresh backoff.
    pub refresh_backoff_ms: u64,
    /// Persist tokens between runs.
    pub persist_tokens: bool,
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            refresh_leeway_secs: 30,
            gateway_timeout_secs: 10,
            refresh_max_retries: 3,
            refresh_backoff_ms: 250,
            persist_tokens: true,
        }
    }
}

impl SessionSection {
    /// Refresh leeway as a duration.
    pub fn refresh_leeway(&self) -> Duration {
        Duration::from_secs(self.refresh_leeway_secs)
    }

    /// Gateway timeout as a duration.
    pub fn gateway_timeout(&self) -> Duration {
        Duration::from_secs(self.gateway_timeout_secs)
    }

    /// Base backoff as a duration.
    pub fn refresh_backoff(&self) -> Duration {
        Duration::from_millis(self.refresh_backoff_ms)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Logging Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Logging configuration section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Console log level (`error`, `warn`, `info`, `debug`, `trace`).
    pub level: String,
    /// Write a rolling JSON log file under `<config dir>/logs`.
    pub json_file: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_file: true,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
