//! OIDC client primitives: realm endpoints, PKCE, redirect URLs and token sets.

use std::fmt;

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::{DateTime, Duration, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use url::Url;

use crate::error::{AuthError, Result};

/// Client registration and provider location.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub server_url: String,
    pub realm: String,
    pub client_id: String,
    pub client_secret: Option<String>,
    pub redirect_uri: Option<String>,
    pub scopes: Vec<String>,
}

impl ProviderConfig {
    /// Create a config for a public client.
    pub fn new(
        server_url: impl Into<String>,
        realm: impl Into<String>,
        client_id: impl Into<String>,
    ) -> Self {
        Self {
            server_url: server_url.into(),
            realm: realm.into(),
            client_id: client_id.into(),
            client_secret: None,
            redirect_uri: None,
            scopes: vec!["openid".to_string(), "profile".to_string(), "email".to_string()],
        }
    }

    /// Set the client secret (confidential clients).
    pub fn with_client_secret(mut self, secret: impl Into<String>) -> Self {
        self.client_secret = Some(secret.into());
        self
    }

    /// Set the redirect URI for the authorization code flow.
    pub fn with_redirect_uri(mut self, uri: impl Into<String>) -> Self {
        self.redirect_uri = Some(uri.into());
        self
    }

    /// Override the requested scopes.
    pub fn with_scopes(mut self, scopes: Vec<String>) -> Self {
        self.scopes = scopes;
        self
    }

    /// Space-separated scope string.
    pub fn scope(&self) -> String {
        self.scopes.join(" ")
    }

    /// Realm issuer URL, e.g. `http://auth.localhost/realms/my-organization`.
    pub fn issuer(&self) -> String {
        format!(
            "{}/realms/{}",
            self.server_url.trim_end_matches('/'),
            self.realm
        )
    }

    /// OIDC discovery document URL for the realm.
    pub fn discovery_url(&self) -> String {
        format!("{}/.well-known/openid-configuration", self.issuer())
    }
}

/// Provider endpoints used by the gateway.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Endpoints {
    #[serde(rename = "authorization_endpoint")]
    pub authorization: String,
    #[serde(rename = "token_endpoint")]
    pub token: String,
    #[serde(rename = "userinfo_endpoint")]
    pub userinfo: String,
    #[serde(rename = "end_session_endpoint")]
    pub end_session: String,
}

impl Endpoints {
    /// Derive the standard realm endpoints without a discovery round trip.
    pub fn for_realm(config: &ProviderConfig) -> Self {
        let base = format!("{}/protocol/openid-connect", config.issuer());
        Self {
            authorization: format!("{base}/auth"),
            token: format!("{base}/token"),
            userinfo: format!("{base}/userinfo"),
            end_session: format!("{base}/logout"),
        }
    }
}

/// PKCE code verifier and challenge pair.
#[derive(Debug, Clone)]
pub struct PkceChallenge {
    pub verifier: String,
    pub challenge: String,
}

impl PkceChallenge {
    /// Generate a new S256 PKCE challenge pair.
    pub fn generate() -> Self {
        let mut verifier_bytes = [0u8; 32];
        rand::rng().fill_bytes(&mut verifier_bytes);
        let verifier = URL_SAFE_NO_PAD.encode(verifier_bytes);
        let challenge = Self::challenge_for(&verifier);

        Self {
            verifier,
            challenge,
        }
    }

    /// Compute the S256 challenge for a verifier.
    pub fn challenge_for(verifier: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(verifier.as_bytes());
        URL_SAFE_NO_PAD.encode(hasher.finalize())
    }
}

/// Generate a random state string for CSRF protection.
pub fn generate_state() -> String {
    let mut state_bytes = [0u8; 32];
    rand::rng().fill_bytes(&mut state_bytes);
    URL_SAFE_NO_PAD.encode(state_bytes)
}

/// Everything the host must keep between redirecting the user and
/// handling the callback.
#[derive(Debug, Clone)]
pub struct AuthorizationRequest {
    pub url: String,
    pub state: String,
    pub pkce: PkceChallenge,
}

/// Build the authorization URL for the redirect flow.
pub fn build_authorization_url(
    config: &ProviderConfig,
    endpoints: &Endpoints,
    challenge: &str,
    state: &str,
) -> Result<String> {
    let redirect_uri = config
        .redirect_uri
        .as_deref()
        .ok_or_else(|| AuthError::Config("redirect_uri is required for the redirect flow".into()))?;
    let scope = config.scope();

    let params = [
        ("client_id", config.client_id.as_str()),
        ("redirect_uri", redirect_uri),
        ("response_type", "code"),
        ("response_mode", "query"),
        ("scope", scope.as_str()),
        ("code_challenge", challenge),
        ("code_challenge_method", "S256"),
        ("state", state),
    ];

    let query = params
        .iter()
        .map(|(k, v)| format!("{}={}", k, urlencoding::encode(v)))
        .collect::<Vec<_>>()
        .join("&");

    Ok(format!("{}?{}", endpoints.authorization, query))
}

/// Start a redirect login: fresh PKCE pair, fresh state, URL to open.
pub fn start_authorization(
    config: &ProviderConfig,
    endpoints: &Endpoints,
) -> Result<AuthorizationRequest> {
    let pkce = PkceChallenge::generate();
    let state = generate_state();
    let url = build_authorization_url(config, endpoints, &pkce.challenge, &state)?;
    Ok(AuthorizationRequest { url, state, pkce })
}

/// Extract the authorization code from the callback URL and check `state`.
///
/// Provider-reported errors (`?error=access_denied&error_description=...`)
/// are surfaced as [`AuthError::Provider`].
pub fn parse_callback(callback_url: &str, expected_state: &str) -> Result<String> {
    let url = Url::parse(callback_url.trim())
        .map_err(|e| AuthError::InvalidResponse(format!("invalid callback URL: {}", e)))?;

    let mut code = None;
    let mut state = None;
    let mut error = None;
    let mut description = String::new();
    for (key, value) in url.query_pairs() {
        match key.as_ref() {
            "code" => code = Some(value.into_owned()),
            "state" => state = Some(value.into_owned()),
            "error" => error = Some(value.into_owned()),
            "error_description" => description = value.into_owned(),
            _ => {}
        }
    }

    if let Some(error) = error {
        return Err(AuthError::Provider {
            status: None,
            error,
            description,
        });
    }

    match state {
        Some(s) if s == expected_state => {}
        _ => {
            return Err(AuthError::InvalidResponse(
                "state mismatch, possible CSRF attempt".into(),
            ));
        }
    }

    code.filter(|c| !c.is_empty())
        .ok_or_else(|| AuthError::InvalidResponse("callback is missing the code".into()))
}

/// Build the front-channel end-session URL for a browser logout.
pub fn build_end_session_url(
    endpoints: &Endpoints,
    client_id: &str,
    id_token_hint: Option<&str>,
    post_logout_redirect_uri: Option<&str>,
) -> String {
    let mut params = vec![("client_id", client_id)];
    if let Some(hint) = id_token_hint {
        params.push(("id_token_hint", hint));
    }
    if let Some(uri) = post_logout_redirect_uri {
        params.push(("post_logout_redirect_uri", uri));
    }

    let query = params
        .iter()
        .map(|(k, v)| format!("{}={}", k, urlencoding::encode(v)))
        .collect::<Vec<_>>()
        .join("&");

    format!("{}?{}", endpoints.end_session, query)
}

/// Grant submitted to the token endpoint to start a session.
#[derive(Clone)]
pub enum Grant {
    /// Resource-owner password credentials (the login form).
    Password { username: String, password: String },
    /// Authorization code from the redirect flow, with its PKCE verifier.
    AuthorizationCode { code: String, code_verifier: String },
}

impl fmt::Debug for Grant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Grant::Password { username, .. } => f
                .debug_struct("Password")
                .field("username", username)
                .field("password", &"<redacted>")
                .finish(),
            Grant::AuthorizationCode { .. } => f
                .debug_struct("AuthorizationCode")
                .field("code", &"<redacted>")
                .finish(),
        }
    }
}

/// Credentials submitted by the host application.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub grant: Grant,
    /// Keep the session in durable storage between runs.
    pub remember_me: bool,
}

impl Credentials {
    /// Username/password credentials.
    pub fn password(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            grant: Grant::Password {
                username: username.into(),
                password: password.into(),
            },
            remember_me: false,
        }
    }

    /// Authorization code credentials from the redirect flow.
    pub fn authorization_code(code: impl Into<String>, code_verifier: impl Into<String>) -> Self {
        Self {
            grant: Grant::AuthorizationCode {
                code: code.into(),
                code_verifier: code_verifier.into(),
            },
            remember_me: false,
        }
    }

    /// Set the remember-me flag.
    pub fn remember(mut self, remember_me: bool) -> Self {
        self.remember_me = remember_me;
        self
    }
}

/// Tokens returned by the token endpoint.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenSet {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    pub expires_in: u64,
    #[serde(default)]
    pub refresh_expires_in: Option<u64>,
    #[serde(default = "default_token_type")]
    pub token_type: String,
    #[serde(default)]
    pub scope: String,
    #[serde(default)]
    pub id_token: Option<String>,
}

fn default_token_type() -> String {
    "Bearer".to_string()
}

impl fmt::Debug for TokenSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenSet")
            .field("expires_in", &self.expires_in)
            .field("has_refresh_token", &self.refresh_token.is_some())
            .field("token_type", &self.token_type)
            .field("scope", &self.scope)
            .finish_non_exhaustive()
    }
}

impl TokenSet {
    /// Create an access-only token set.
    pub fn new(access_token: impl Into<String>, expires_in: u64) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token: None,
            expires_in,
            refresh_expires_in: None,
            token_type: default_token_type(),
            scope: String::new(),
            id_token: None,
        }
    }

    /// Attach a refresh token.
    pub fn with_refresh_token(mut self, refresh_token: impl Into<String>) -> Self {
        self.refresh_token = Some(refresh_token.into());
        self
    }

    /// Absolute expiry relative to `issued_at`.
    pub fn expires_at(&self, issued_at: DateTime<Utc>) -> DateTime<Utc> {
        issued_at + Duration::seconds(self.expires_in.min(i64::MAX as u64) as i64)
    }
}
