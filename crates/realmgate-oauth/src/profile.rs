//! User profile mapped from userinfo / token claims.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{AuthError, Result};

/// Claims mapped onto named [`Profile`] fields; never copied into `extra_claims`.
const MODELED_CLAIMS: &[&str] = &[
    "sub",
    "preferred_username",
    "name",
    "given_name",
    "family_name",
    "email",
    "email_verified",
    "realm_access",
    "resource_access",
    "roles",
];

/// Identity attributes of the authenticated user.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    /// Subject identifier (`sub`).
    pub subject: String,
    pub username: Option<String>,
    pub name: Option<String>,
    pub given_name: Option<String>,
    pub family_name: Option<String>,
    pub email: Option<String>,
    pub email_verified: Option<bool>,
    /// Realm roles.
    pub roles: BTreeSet<String>,
    /// Client roles keyed by client ID.
    pub client_roles: BTreeMap<String, BTreeSet<String>>,
    /// Every other scalar claim, stringified.
    pub extra_claims: BTreeMap<String, String>,
}

impl Profile {
    /// Create a profile with only a subject.
    pub fn new(subject: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            ..Default::default()
        }
    }

    /// Set realm roles.
    pub fn with_roles<I, S>(mut self, roles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.roles = roles.into_iter().map(Into::into).collect();
        self
    }

    /// Add roles for a client.
    pub fn with_client_roles<I, S>(mut self, client_id: impl Into<String>, roles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.client_roles
            .entry(client_id.into())
            .or_default()
            .extend(roles.into_iter().map(Into::into));
        self
    }

    /// Set the email.
    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }

    /// Map a claims object onto a profile.
    ///
    /// Roles come from `realm_access.roles` and a top-level `roles` array;
    /// client roles from `resource_access.<client>.roles`. Other scalar
    /// claims land in `extra_claims`; arrays and objects are dropped.
    pub fn from_claims(claims: &Value) -> Result<Self> {
        let object = claims
            .as_object()
            .ok_or_else(|| AuthError::InvalidResponse("claims must be a JSON object".into()))?;

        let subject = object
            .get("sub")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| AuthError::InvalidResponse("missing claim: sub".into()))?
            .to_string();

        let text = |key: &str| object.get(key).and_then(Value::as_str).map(str::to_string);

        let mut roles = string_array(claims.pointer("/realm_access/roles"));
        roles.extend(string_array(object.get("roles")));

        let mut client_roles = BTreeMap::new();
        if let Some(resources) = object.get("resource_access").and_then(Value::as_object) {
            for (client_id, access) in resources {
                let set = string_array(access.get("roles"));
                if !set.is_empty() {
                    client_roles.insert(client_id.clone(), set);
                }
            }
        }

        let extra_claims = object
            .iter()
            .filter(|(key, _)| !MODELED_CLAIMS.contains(&key.as_str()))
            .filter_map(|(key, value)| match value {
                Value::String(s) => Some((key.clone(), s.clone())),
                Value::Bool(_) | Value::Number(_) => Some((key.clone(), value.to_string())),
                Value::Null | Value::Array(_) | Value::Object(_) => None,
            })
            .collect();

        Ok(Self {
            subject,
            username: text("preferred_username"),
            name: text("name"),
            given_name: text("given_name"),
            family_name: text("family_name"),
            email: text("email"),
            email_verified: object.get("email_verified").and_then(Value::as_bool),
            roles,
            client_roles,
            extra_claims,
        })
    }

    /// Best human-readable name available.
    pub fn display_name(&self) -> String {
        if let Some(name) = self.name.as_deref().filter(|n| !n.is_empty()) {
            return name.to_string();
        }
        match (self.given_name.as_deref(), self.family_name.as_deref()) {
            (Some(given), Some(family)) => return format!("{} {}", given, family),
            (Some(given), None) => return given.to_string(),
            _ => {}
        }
        self.username
            .clone()
            .or_else(|| self.email.clone())
            .unwrap_or_else(|| self.subject.clone())
    }

    /// Whether the user holds a realm role.
    pub fn has_role(&self, role: &str) -> bool {
        self.roles.contains(role)
    }

    /// Whether the user holds a role on a specific client.
    pub fn has_client_role(&self, client_id: &str, role: &str) -> bool {
        self.client_roles
            .get(client_id)
            .is_some_and(|roles| roles.contains(role))
    }
}

fn string_array(value: Option<&Value>) -> BTreeSet<String> {
    value
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}
