//! Capability checks for protected resources.
//!
//! Capabilities use the notation of Keycloak's `protect()` helpers:
//!
//! | Capability      | Matches                                  |
//! |-----------------|------------------------------------------|
//! | `admin`         | realm role `admin`                       |
//! | `realm:admin`   | realm role `admin`                       |
//! | `my-app:editor` | client role `editor` of client `my-app`  |
//!
//! A non-empty requirement list is satisfied when the profile holds at least
//! one of the listed capabilities.

use chrono::{DateTime, Utc};
use realmgate_oauth::{AuthError, Profile, Result};
use serde::Serialize;

use crate::state::{Session, SessionState};

/// Why access was refused.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum DenyReason {
    NotAuthenticated,
    InsufficientCapability { required: Vec<String> },
}

/// Outcome of [`authorize`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "decision", content = "detail", rename_all = "snake_case")]
pub enum Decision {
    Allow,
    Deny(DenyReason),
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allow)
    }

    /// Convert a denial into the matching [`AuthError`].
    pub fn into_result(self) -> Result<()> {
        match self {
            Decision::Allow => Ok(()),
            Decision::Deny(DenyReason::NotAuthenticated) => Err(AuthError::NotAuthenticated),
            Decision::Deny(DenyReason::InsufficientCapability { required }) => {
                Err(AuthError::InsufficientCapability { required })
            }
        }
    }
}

/// A parsed capability requirement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability<'a> {
    RealmRole(&'a str),
    ClientRole { client: &'a str, role: &'a str },
}

impl<'a> Capability<'a> {
    pub fn parse(capability: &'a str) -> Self {
        match capability.split_once(':') {
            Some(("realm", role)) => Capability::RealmRole(role),
            Some((client, role)) if !client.is_empty() => Capability::ClientRole { client, role },
            _ => Capability::RealmRole(capability),
        }
    }

    /// Whether `profile` holds this capability.
    pub fn held_by(&self, profile: &Profile) -> bool {
        match *self {
            Capability::RealmRole(role) => profile.has_role(role),
            Capability::ClientRole { client, role } => profile.has_client_role(client, role),
        }
    }
}

/// Decide whether `session` may use a resource requiring any of `required`.
///
/// An empty requirement list admits any authenticated session.
pub fn authorize<I, S>(session: &Session, required: I) -> Decision
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    authorize_at(session, required, Utc::now())
}

/// [`authorize`] against an explicit clock.
pub fn authorize_at<I, S>(session: &Session, required: I, now: DateTime<Utc>) -> Decision
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let profile = match (&session.state, &session.profile) {
        (SessionState::Authenticated, Some(profile)) if !session.is_expired_at(now) => profile,
        _ => return Decision::Deny(DenyReason::NotAuthenticated),
    };

    let required: Vec<String> = required
        .into_iter()
        .map(|c| c.as_ref().to_string())
        .collect();

    if required.is_empty() || required.iter().any(|c| Capability::parse(c).held_by(profile)) {
        Decision::Allow
    } else {
        tracing::debug!(
            subject = %profile.subject,
            required = ?required,
            "Capability check denied"
        );
        Decision::Deny(DenyReason::InsufficientCapability { required })
    }
}
