//! Auth gateway: the network contract with the identity provider.
//!
//! [`AuthGateway`] is what the session machine depends on. [`KeycloakGateway`]
//! implements it over the realm's OIDC endpoints.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;

use crate::error::{AuthError, Result};
use crate::oauth::{Credentials, Endpoints, Grant, ProviderConfig, TokenSet};
use crate::profile::Profile;

/// Network operations against the identity provider.
///
/// Every call may suspend and may fail. Callers apply their own timeout
/// and may drop the future to cancel.
#[async_trait]
pub trait AuthGateway: Send + Sync {
    /// Exchange credentials for tokens.
    async fn login(&self, credentials: &Credentials) -> Result<TokenSet>;

    /// Exchange a refresh token for new tokens.
    async fn refresh(&self, refresh_token: &str) -> Result<TokenSet>;

    /// End the provider-side session.
    async fn logout(&self, tokens: &TokenSet) -> Result<()>;

    /// Fetch the user's profile.
    async fn fetch_profile(&self, access_token: &str) -> Result<Profile>;
}

/// Shared gateway handle owned by the host application.
pub type SharedGateway = Arc<dyn AuthGateway>;

/// Which token grant produced an error response; decides how
/// `invalid_grant` is classified.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GrantKind {
    Login,
    Refresh,
}

/// OAuth2 error body (RFC 6749 §5.2).
#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

/// Keycloak implementation of [`AuthGateway`].
#[derive(Debug, Clone)]
pub struct KeycloakGateway {
    config: ProviderConfig,
    endpoints: Endpoints,
    http: reqwest::Client,
}

impl KeycloakGateway {
    /// Create a gateway using the standard realm endpoint layout.
    pub fn new(config: ProviderConfig) -> Self {
        let endpoints = Endpoints::for_realm(&config);
        Self {
            config,
            endpoints,
            http: reqwest::Client::new(),
        }
    }

    /// Create a gateway with endpoints read from the realm's discovery document.
    pub async fn discover(config: ProviderConfig, http: reqwest::Client) -> Result<Self> {
        let url = config.discovery_url();
        tracing::debug!(url = %url, "Fetching OIDC discovery document");

        let response = http.get(&url).send().await?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            return Err(AuthError::Provider {
                status: Some(status),
                error: "discovery_failed".to_string(),
                description: format!("GET {} returned {}", url, status),
            });
        }

        let endpoints: Endpoints = response.json().await.map_err(|e| {
            AuthError::InvalidResponse(format!("Failed to parse discovery document: {}", e))
        })?;

        Ok(Self {
            config,
            endpoints,
            http,
        })
    }

    /// Use a custom HTTP client (for connection pool reuse or testing).
    pub fn with_http_client(mut self, client: reqwest::Client) -> Self {
        self.http = client;
        self
    }

    /// Override the endpoints.
    pub fn with_endpoints(mut self, endpoints: Endpoints) -> Self {
        self.endpoints = endpoints;
        self
    }

    /// Provider configuration.
    pub fn config(&self) -> &ProviderConfig {
        &self.config
    }

    /// Resolved provider endpoints.
    pub fn endpoints(&self) -> &Endpoints {
        &self.endpoints
    }

    /// Client authentication parameters shared by every token-endpoint call.
    fn client_params(&self) -> Vec<(&'static str, String)> {
        let mut params = vec![("client_id", self.config.client_id.clone())];
        if let Some(secret) = &self.config.client_secret {
            params.push(("client_secret", secret.clone()));
        }
        params
    }

    async fn token_request(
        &self,
        params: Vec<(&'static str, String)>,
        kind: GrantKind,
    ) -> Result<TokenSet> {
        let response = self
            .http
            .post(&self.endpoints.token)
            .form(&params)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_token_error(status.as_u16(), &body, kind));
        }

        response
            .json::<TokenSet>()
            .await
            .map_err(|e| AuthError::InvalidResponse(format!("Failed to parse token response: {}", e)))
    }
}

#[async_trait]
impl AuthGateway for KeycloakGateway {
    async fn login(&self, credentials: &Credentials) -> Result<TokenSet> {
        let mut params = self.client_params();
        params.push(("scope", self.config.scope()));

        match &credentials.grant {
            Grant::Password { username, password } => {
                params.push(("grant_type", "password".to_string()));
                params.push(("username", username.clone()));
                params.push(("password", password.clone()));
            }
            Grant::AuthorizationCode {
                code,
                code_verifier,
            } => {
                let redirect_uri = self.config.redirect_uri.clone().ok_or_else(|| {
                    AuthError::Config("redirect_uri is required for the code grant".into())
                })?;
                params.push(("grant_type", "authorization_code".to_string()));
                params.push(("code", code.clone()));
                params.push(("code_verifier", code_verifier.clone()));
                params.push(("redirect_uri", redirect_uri));
            }
        }

        self.token_request(params, GrantKind::Login).await
    }

    async fn refresh(&self, refresh_token: &str) -> Result<TokenSet> {
        let mut params = self.client_params();
        params.push(("grant_type", "refresh_token".to_string()));
        params.push(("refresh_token", refresh_token.to_string()));

        let mut tokens = self.token_request(params, GrantKind::Refresh).await?;
        // Providers may omit the refresh token when it is not rotated.
        if tokens.refresh_token.is_none() {
            tokens.refresh_token = Some(refresh_token.to_string());
        }
        Ok(tokens)
    }

    async fn logout(&self, tokens: &TokenSet) -> Result<()> {
        let Some(refresh_token) = tokens.refresh_token.as_deref() else {
            // Access-only sessions have nothing to revoke server-side.
            return Ok(());
        };

        let mut params = self.client_params();
        params.push(("refresh_token", refresh_token.to_string()));

        let response = self
            .http
            .post(&self.endpoints.end_session)
            .form(&params)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(provider_error(status.as_u16(), &body))
    }

    async fn fetch_profile(&self, access_token: &str) -> Result<Profile> {
        let response = self
            .http
            .get(&self.endpoints.userinfo)
            .bearer_auth(access_token)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(provider_error(status.as_u16(), &body));
        }

        let claims: serde_json::Value = response
            .json()
            .await
            .map_err(|e| AuthError::InvalidResponse(format!("Failed to parse userinfo: {}", e)))?;
        Profile::from_claims(&claims)
    }
}

/// Map a failed token-endpoint response onto the error taxonomy.
fn classify_token_error(status: u16, body: &str, kind: GrantKind) -> AuthError {
    let parsed = serde_json::from_str::<ErrorBody>(body).ok();
    let description = parsed
        .as_ref()
        .and_then(|b| b.error_description.clone())
        .unwrap_or_default();

    match (parsed.as_ref().map(|b| b.error.as_str()), kind) {
        (Some("invalid_grant"), GrantKind::Login) => AuthError::InvalidCredentials(description),
        (Some("invalid_grant"), GrantKind::Refresh) => AuthError::RefreshExpired(description),
        _ => provider_error(status, body),
    }
}

fn provider_error(status: u16, body: &str) -> AuthError {
    match serde_json::from_str::<ErrorBody>(body) {
        Ok(parsed) => AuthError::Provider {
            status: Some(status),
            error: parsed.error,
            description: parsed.error_description.unwrap_or_default(),
        },
        Err(_) => AuthError::Provider {
            status: Some(status),
            error: "http_error".to_string(),
            description: body.chars().take(200).collect(),
        },
    }
}
