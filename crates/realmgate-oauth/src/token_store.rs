//! Token persistence.
//!
//! The session machine keeps the live tokens in memory. A [`TokenStore`]
//! is the optional durable copy the host application chooses, used to
//! restore a session on the next start.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::{AuthError, Result};
use crate::oauth::TokenSet;

/// Default token file name within the realmgate data directory.
pub const TOKEN_FILE: &str = "tokens.json";

// ============================================================================
// StoredTokens
// ============================================================================

/// Serializable tokens with absolute expiry.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredTokens {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub id_token: Option<String>,
    pub expires_at: DateTime<Utc>,
    #[serde(default)]
    pub refresh_expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub scope: String,
    pub created_at: DateTime<Utc>,
}

impl std::fmt::Debug for StoredTokens {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoredTokens")
            .field("expires_at", &self.expires_at)
            .field("has_refresh_token", &self.refresh_token.is_some())
            .field("scope", &self.scope)
            .field("created_at", &self.created_at)
            .finish_non_exhaustive()
    }
}

impl StoredTokens {
    /// Convert a fresh token response issued at `now`.
    pub fn from_token_set(tokens: &TokenSet, now: DateTime<Utc>) -> Self {
        Self {
            access_token: tokens.access_token.clone(),
            refresh_token: tokens.refresh_token.clone(),
            id_token: tokens.id_token.clone(),
            expires_at: tokens.expires_at(now),
            refresh_expires_at: tokens
                .refresh_expires_in
                .filter(|secs| *secs > 0)
                .map(|secs| now + Duration::seconds(secs.min(i64::MAX as u64) as i64)),
            scope: tokens.scope.clone(),
            created_at: now,
        }
    }

    /// Rebuild a token set whose lifetimes are relative to `now`.
    pub fn to_token_set(&self, now: DateTime<Utc>) -> TokenSet {
        TokenSet {
            access_token: self.access_token.clone(),
            refresh_token: self.refresh_token.clone(),
            expires_in: self.expires_in_secs(now),
            refresh_expires_in: self
                .refresh_expires_at
                .map(|at| (at - now).num_seconds().max(0) as u64),
            token_type: "Bearer".to_string(),
            scope: self.scope.clone(),
            id_token: self.id_token.clone(),
        }
    }

    /// Whether the refresh token is known to have expired at `now`.
    pub fn refresh_expired(&self, now: DateTime<Utc>) -> bool {
        self.refresh_token.is_none() || self.refresh_expires_at.is_some_and(|at| now >= at)
    }

    /// Whether the access token expires within `leeway` of `now`.
    pub fn is_expired(&self, leeway: std::time::Duration, now: DateTime<Utc>) -> bool {
        let leeway = Duration::from_std(leeway).unwrap_or_else(|_| Duration::zero());
        now >= self.expires_at - leeway
    }

    /// Seconds until the access token expires (zero once expired).
    pub fn expires_in_secs(&self, now: DateTime<Utc>) -> u64 {
        (self.expires_at - now).num_seconds().max(0) as u64
    }
}

// ============================================================================
// TokenStore Trait
// ============================================================================

/// Durable storage for the session's tokens.
#[async_trait]
pub trait TokenStore: Send + Sync + std::fmt::Debug {
    /// Check if tokens exist.
    fn has_tokens(&self) -> bool;

    /// Save tokens to storage.
    async fn save_tokens(&self, tokens: &StoredTokens) -> Result<()>;

    /// Load tokens from storage.
    async fn load_tokens(&self) -> Result<Option<StoredTokens>>;

    /// Delete stored tokens.
    async fn delete_tokens(&self) -> Result<()>;
}

/// Shared token store for use across async contexts.
pub type SharedTokenStore = Arc<dyn TokenStore>;

// ============================================================================
// FileTokenStore
// ============================================================================

/// File-based token store.
#[derive(Debug)]
pub struct FileTokenStore {
    token_path: PathBuf,
    cached_tokens: Arc<RwLock<Option<StoredTokens>>>,
}

impl FileTokenStore {
    /// Create a store writing `tokens.json` inside `data_dir`.
    pub fn new(data_dir: &Path) -> Self {
        Self::with_path(data_dir.join(TOKEN_FILE))
    }

    /// Create with a custom token path.
    pub fn with_path(token_path: PathBuf) -> Self {
        Self {
            token_path,
            cached_tokens: Arc::new(RwLock::new(None)),
        }
    }

    /// Get the token file path.
    pub fn token_path(&self) -> &Path {
        &self.token_path
    }
}

#[async_trait]
impl TokenStore for FileTokenStore {
    fn has_tokens(&self) -> bool {
        self.token_path.exists()
    }

    async fn save_tokens(&self, tokens: &StoredTokens) -> Result<()> {
        if let Some(parent) = self.token_path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                AuthError::Storage(format!("Failed to create token directory: {}", e))
            })?;
        }

        let json = serde_json::to_string_pretty(tokens)
            .map_err(|e| AuthError::Storage(format!("Failed to serialize tokens: {}", e)))?;

        tokio::fs::write(&self.token_path, json)
            .await
            .map_err(|e| AuthError::Storage(format!("Failed to write token file: {}", e)))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o600);
            tokio::fs::set_permissions(&self.token_path, perms)
                .await
                .map_err(|e| AuthError::Storage(format!("Failed to restrict token file: {}", e)))?;
        }

        let mut cache = self.cached_tokens.write().await;
        *cache = Some(tokens.clone());

        tracing::debug!(path = %self.token_path.display(), "Tokens saved");
        Ok(())
    }

    async fn load_tokens(&self) -> Result<Option<StoredTokens>> {
        {
            let cache = self.cached_tokens.read().await;
            if cache.is_some() {
                return Ok(cache.clone());
            }
        }

        if !self.token_path.exists() {
            return Ok(None);
        }

        let content = tokio::fs::read_to_string(&self.token_path)
            .await
            .map_err(|e| AuthError::Storage(format!("Failed to read token file: {}", e)))?;

        let tokens: StoredTokens = serde_json::from_str(&content)
            .map_err(|e| AuthError::Storage(format!("Failed to parse token file: {}", e)))?;

        let mut cache = self.cached_tokens.write().await;
        *cache = Some(tokens.clone());

        Ok(Some(tokens))
    }

    async fn delete_tokens(&self) -> Result<()> {
        if self.token_path.exists() {
            tokio::fs::remove_file(&self.token_path)
                .await
                .map_err(|e| AuthError::Storage(format!("Failed to delete token file: {}", e)))?;
        }
        let mut cache = self.cached_tokens.write().await;
        *cache = None;
        Ok(())
    }
}

// ============================================================================
// InMemoryTokenStore
// ============================================================================

/// In-memory token store, for tests and hosts that never persist.
#[derive(Debug, Default)]
pub struct InMemoryTokenStore {
    tokens: RwLock<Option<StoredTokens>>,
}

impl InMemoryTokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tokens(tokens: StoredTokens) -> Self {
        Self {
            tokens: RwLock::new(Some(tokens)),
        }
    }
}

#[async_trait]
impl TokenStore for InMemoryTokenStore {
    fn has_tokens(&self) -> bool {
        self.tokens
            .try_read()
            .map(|guard| guard.is_some())
            .unwrap_or(false)
    }

    async fn save_tokens(&self, tokens: &StoredTokens) -> Result<()> {
        let mut cache = self.tokens.write().await;
        *cache = Some(tokens.clone());
        Ok(())
    }

    async fn load_tokens(&self) -> Result<Option<StoredTokens>> {
        let cache = self.tokens.read().await;
        Ok(cache.clone())
    }

    async fn delete_tokens(&self) -> Result<()> {
        let mut cache = self.tokens.write().await;
        *cache = None;
        Ok(())
    }
}

/// Create a shared file-based token store.
pub fn create_token_store(data_dir: &Path) -> SharedTokenStore {
    Arc::new(FileTokenStore::new(data_dir))
}

/// Create a shared in-memory token store.
pub fn create_memory_token_store() -> SharedTokenStore {
    Arc::new(InMemoryTokenStore::new())
}
