//! OIDC client plumbing for realmgate.
//!
//! # Components
//!
//! - [`oauth`] - realm endpoints, PKCE, redirect/callback URLs, credentials and token sets
//! - [`gateway`] - the [`AuthGateway`] contract and its Keycloak implementation
//! - [`profile`] - mapping provider claims onto a fixed [`Profile`]
//! - [`token_store`] - optional durable token storage

pub mod error;
pub mod gateway;
pub mod oauth;
pub mod profile;
pub mod token_store;

pub use error::{AuthError, Result};
pub use gateway::{AuthGateway, KeycloakGateway, SharedGateway};
pub use oauth::{
    AuthorizationRequest, Credentials, Endpoints, Grant, PkceChallenge, ProviderConfig, TokenSet,
};
pub use profile::Profile;
pub use token_store::{
    FileTokenStore, InMemoryTokenStore, SharedTokenStore, StoredTokens, TokenStore,
};
