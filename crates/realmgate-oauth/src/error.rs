//! Error types for talking to the identity provider.

use std::time::Duration;

/// Result type alias for this crate.
pub type Result<T> = std::result::Result<T, AuthError>;

/// Errors surfaced by the gateway, the token store and the session machine.
///
/// Every variant carries only owned strings so a single outcome can be
/// handed to all callers waiting on the same refresh and kept as the
/// session's `last_error`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    /// The provider rejected the submitted credentials.
    #[error("Invalid credentials: {0}")]
    InvalidCredentials(String),

    /// The provider could not be reached.
    #[error("Network error: {0}")]
    Network(String),

    /// The provider answered with an unexpected non-2xx response.
    #[error("Provider error ({}): {error}: {description}", status.map(|s| s.to_string()).unwrap_or_else(|| "-".to_string()))]
    Provider {
        status: Option<u16>,
        error: String,
        description: String,
    },

    /// The refresh token is no longer valid; a full login is required.
    #[error("Refresh token expired: {0}")]
    RefreshExpired(String),

    /// A gateway call did not complete within the caller's timeout.
    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    /// The session lacks every capability the resource requires.
    #[error("Insufficient capability: requires one of [{}]", required.join(", "))]
    InsufficientCapability { required: Vec<String> },

    /// No authenticated session.
    #[error("Not authenticated")]
    NotAuthenticated,

    /// Token persistence failed.
    #[error("Token storage error: {0}")]
    Storage(String),

    /// The provider returned a payload we could not interpret.
    #[error("Invalid provider response: {0}")]
    InvalidResponse(String),

    /// The operation was cancelled before it completed.
    #[error("Operation cancelled")]
    Cancelled,

    /// Invalid client configuration.
    #[error("Config error: {0}")]
    Config(String),
}

impl AuthError {
    /// Whether a retry with backoff may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, AuthError::Network(_) | AuthError::Timeout(_))
            || matches!(self, AuthError::Provider { status: Some(s), .. } if *s >= 500)
    }

    /// Whether the user must log in again to recover.
    pub fn requires_login(&self) -> bool {
        matches!(
            self,
            AuthError::RefreshExpired(_) | AuthError::NotAuthenticated
        )
    }
}

impl From<reqwest::Error> for AuthError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            AuthError::InvalidResponse(e.to_string())
        } else {
            AuthError::Network(e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(AuthError::Network("down".into()).is_transient());
        assert!(AuthError::Timeout(Duration::from_secs(1)).is_transient());
        assert!(
            AuthError::Provider {
                status: Some(503),
                error: "unavailable".into(),
                description: String::new(),
            }
            .is_transient()
        );
        assert!(
            !AuthError::Provider {
                status: Some(400),
                error: "invalid_request".into(),
                description: String::new(),
            }
            .is_transient()
        );
        assert!(!AuthError::InvalidCredentials("bad".into()).is_transient());
        assert!(!AuthError::RefreshExpired("gone".into()).is_transient());
    }

    #[test]
    fn test_requires_login() {
        assert!(AuthError::RefreshExpired("x".into()).requires_login());
        assert!(AuthError::NotAuthenticated.requires_login());
        assert!(!AuthError::Network("x".into()).requires_login());
    }

    #[test]
    fn test_display() {
        let err = AuthError::Provider {
            status: Some(401),
            error: "unauthorized_client".into(),
            description: "Invalid client secret".into(),
        };
        assert_eq!(
            err.to_string(),
            "Provider error (401): unauthorized_client: Invalid client secret"
        );

        let err = AuthError::InsufficientCapability {
            required: vec!["admin".into(), "manager".into()],
        };
        assert!(err.to_string().contains("admin, manager"));
    }
}
