//! Session states and read-only session snapshots.

use std::fmt;

use chrono::{DateTime, Utc};
use realmgate_oauth::{AuthError, Profile};
use serde::Serialize;
use uuid::Uuid;

/// Authentication lifecycle state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Unauthenticated,
    Authenticating,
    Authenticated,
    Refreshing,
    Failed(String),
}

impl SessionState {
    /// Whether tokens are held in this state.
    pub fn holds_tokens(&self) -> bool {
        matches!(self, SessionState::Authenticated | SessionState::Refreshing)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Unauthenticated => write!(f, "unauthenticated"),
            SessionState::Authenticating => write!(f, "authenticating"),
            SessionState::Authenticated => write!(f, "authenticated"),
            SessionState::Refreshing => write!(f, "refreshing"),
            SessionState::Failed(reason) => write!(f, "failed: {}", reason),
        }
    }
}

/// Read-only snapshot of a session.
#[derive(Clone, PartialEq, Eq)]
pub struct Session {
    /// Identifier of the logical user context, new for every login.
    pub session_id: Option<Uuid>,
    pub state: SessionState,
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub id_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub profile: Option<Profile>,
    pub last_error: Option<AuthError>,
}

impl Session {
    /// A fresh, unauthenticated session.
    pub fn unauthenticated() -> Self {
        Self {
            session_id: None,
            state: SessionState::Unauthenticated,
            access_token: None,
            refresh_token: None,
            id_token: None,
            expires_at: None,
            profile: None,
            last_error: None,
        }
    }

    /// Whether the session is authenticated.
    pub fn is_authenticated(&self) -> bool {
        self.state == SessionState::Authenticated
    }

    /// Whether the access token has expired at `now`.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_none_or(|exp| now >= exp)
    }

    /// Seconds until the access token expires at `now` (zero once expired).
    pub fn expires_in_secs(&self, now: DateTime<Utc>) -> u64 {
        self.expires_at
            .map(|exp| (exp - now).num_seconds().max(0) as u64)
            .unwrap_or(0)
    }

    /// Realm roles of the current profile.
    pub fn roles(&self) -> impl Iterator<Item = &str> {
        self.profile
            .iter()
            .flat_map(|p| p.roles.iter().map(String::as_str))
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::unauthenticated()
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("session_id", &self.session_id)
            .field("state", &self.state)
            .field("has_access_token", &self.access_token.is_some())
            .field("has_refresh_token", &self.refresh_token.is_some())
            .field("expires_at", &self.expires_at)
            .field("profile", &self.profile.as_ref().map(|p| &p.subject))
            .field("last_error", &self.last_error)
            .finish()
    }
}

/// A committed state transition, delivered to subscribers.
#[derive(Debug, Clone)]
pub struct StateChange {
    pub from: SessionState,
    pub to: SessionState,
    /// Snapshot taken right after the transition.
    pub session: Session,
}
