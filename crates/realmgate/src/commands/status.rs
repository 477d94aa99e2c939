//! Status command - shows the current session.

use std::collections::{BTreeMap, BTreeSet};

use anyhow::Result;
use chrono::{DateTime, Utc};
use realmgate_session::{Session, SessionState};
use serde::Serialize;

use super::Context;
use crate::session;

/// Status response for JSON output.
#[derive(Debug, Serialize)]
struct StatusOutput {
    state: SessionState,
    authenticated: bool,
    session_id: Option<String>,
    expires_at: Option<DateTime<Utc>>,
    expires_in: u64,
    subject: Option<String>,
    username: Option<String>,
    email: Option<String>,
    roles: BTreeSet<String>,
    client_roles: BTreeMap<String, BTreeSet<String>>,
    last_error: Option<String>,
}

impl StatusOutput {
    fn from_session(session: &Session, now: DateTime<Utc>) -> Self {
        let profile = session.profile.as_ref();
        Self {
            state: session.state.clone(),
            authenticated: session.is_authenticated(),
            session_id: session.session_id.map(|id| id.to_string()),
            expires_at: session.expires_at,
            expires_in: session.expires_in_secs(now),
            subject: profile.map(|p| p.subject.clone()),
            username: profile.and_then(|p| p.username.clone()),
            email: profile.and_then(|p| p.email.clone()),
            roles: profile.map(|p| p.roles.clone()).unwrap_or_default(),
            client_roles: profile.map(|p| p.client_roles.clone()).unwrap_or_default(),
            last_error: session.last_error.as_ref().map(|e| e.to_string()),
        }
    }
}

/// Format a duration in seconds as e.g. `4m 10s`.
fn format_expiry(secs: u64) -> String {
    match secs {
        0 => "expired".to_string(),
        s if s < 60 => format!("{}s", s),
        s if s < 3600 => format!("{}m {}s", s / 60, s % 60),
        s => format!("{}h {}m", s / 3600, (s % 3600) / 60),
    }
}

/// Run the status command.
pub async fn run(ctx: &Context) -> Result<()> {
    let realm = session::open(ctx).await?;
    let output = StatusOutput::from_session(&realm.machine.snapshot(), Utc::now());

    if ctx.json_output {
        return ctx.print_json(&output);
    }

    println!("Session Status");
    println!("--------------");
    println!("State: {}", output.state);

    if !output.authenticated {
        if let Some(error) = &output.last_error {
            println!("Last error: {}", error);
        }
        println!("  Run 'realmgate login' to authenticate");
        return Ok(());
    }

    if let Some(username) = output.username.as_ref().or(output.subject.as_ref()) {
        println!("User: {}", username);
    }
    if let Some(email) = &output.email {
        println!("Email: {}", email);
    }
    println!("Expires in: {}", format_expiry(output.expires_in));
    if !output.roles.is_empty() {
        let roles: Vec<&str> = output.roles.iter().map(String::as_str).collect();
        println!("Roles: {}", roles.join(", "));
    }
    for (client, roles) in &output.client_roles {
        let roles: Vec<&str> = roles.iter().map(String::as_str).collect();
        println!("Client roles ({}): {}", client, roles.join(", "));
    }
    if ctx.verbose
        && let Some(id) = &output.session_id
    {
        println!("Session ID: {}", id);
    }

    Ok(())
}
