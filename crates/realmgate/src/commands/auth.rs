//! Login, token and logout commands.

use std::io::{BufRead, Write};
use std::time::Duration;

use anyhow::Result;
use clap::Args;
use realmgate_oauth::{AuthError, Credentials, Profile, oauth};
use serde::Serialize;

use super::Context;
use crate::session;

/// Arguments for the login command.
#[derive(Args, Debug)]
pub struct LoginArgs {
    /// Username (prompted for when omitted)
    #[arg(short, long)]
    pub username: Option<String>,

    /// Read the password from the first line of stdin
    #[arg(long)]
    pub password_stdin: bool,

    /// Keep the session between runs
    #[arg(long)]
    pub remember: bool,

    /// Log in through the browser (authorization code + PKCE)
    #[arg(long, conflicts_with_all = ["username", "password_stdin"])]
    pub browser: bool,
}

/// Arguments for the token command.
#[derive(Args, Debug)]
pub struct TokenArgs {
    /// Minimum remaining validity in seconds; refresh first if less remains
    #[arg(long, default_value_t = 30)]
    pub min_validity: u64,
}

#[derive(Debug, Serialize)]
struct LoginOutput<'a> {
    authenticated: bool,
    remembered: bool,
    profile: &'a Profile,
}

/// Run the login command.
pub async fn login(args: LoginArgs, ctx: &Context) -> Result<()> {
    let realm = session::open(ctx).await?;

    let snapshot = realm.machine.snapshot();
    if snapshot.is_authenticated()
        && let Some(profile) = &snapshot.profile
    {
        if ctx.json_output {
            return ctx.print_json(&LoginOutput {
                authenticated: true,
                remembered: true,
                profile,
            });
        }
        println!("Already authenticated as {}", profile.display_name());
        println!("Run 'realmgate logout' first to log in as someone else.");
        return Ok(());
    }

    let credentials = if args.browser {
        browser_credentials(&realm)?
    } else {
        password_credentials(&args)?
    }
    .remember(args.remember);

    let profile = match realm.machine.submit_login(&credentials).await {
        Ok(profile) => profile,
        Err(AuthError::InvalidCredentials(_)) => {
            anyhow::bail!("Invalid username or password");
        }
        Err(e) => return Err(e.into()),
    };

    if ctx.json_output {
        return ctx.print_json(&LoginOutput {
            authenticated: true,
            remembered: args.remember,
            profile: &profile,
        });
    }

    println!("Authenticated as {}", profile.display_name());
    if !profile.roles.is_empty() {
        let roles: Vec<&str> = profile.roles.iter().map(String::as_str).collect();
        println!("Roles: {}", roles.join(", "));
    }
    if !args.remember {
        println!("Session not remembered; pass --remember to keep it between runs.");
    }
    Ok(())
}

fn password_credentials(args: &LoginArgs) -> Result<Credentials> {
    let stdin = std::io::stdin();

    let username = match &args.username {
        Some(username) => username.clone(),
        None => {
            print!("Username: ");
            std::io::stdout().flush()?;
            let mut line = String::new();
            stdin.lock().read_line(&mut line)?;
            line.trim().to_string()
        }
    };
    if username.is_empty() {
        anyhow::bail!("Username is required");
    }

    let password = if args.password_stdin {
        let mut line = String::new();
        stdin.lock().read_line(&mut line)?;
        line.trim_end_matches(['\r', '\n']).to_string()
    } else {
        rpassword::prompt_password("Password: ")?
    };
    if password.is_empty() {
        anyhow::bail!("Password is required");
    }

    Ok(Credentials::password(username, password))
}

fn browser_credentials(realm: &session::Realm) -> Result<Credentials> {
    let request = oauth::start_authorization(realm.gateway.config(), realm.gateway.endpoints())?;

    println!("Open this URL in your browser:");
    println!();
    println!("  {}", request.url);
    println!();
    if open_url(&request.url).is_err() {
        println!("(Could not open browser automatically)");
        println!();
    }

    print!("Paste the URL you were redirected to: ");
    std::io::stdout().flush()?;
    let mut input = String::new();
    std::io::stdin().lock().read_line(&mut input)?;
    let input = input.trim();
    if input.is_empty() {
        anyhow::bail!("No callback URL provided");
    }

    let code = oauth::parse_callback(input, &request.state)?;
    Ok(Credentials::authorization_code(code, request.pkce.verifier))
}

/// Run the token command.
pub async fn token(args: TokenArgs, ctx: &Context) -> Result<()> {
    let realm = session::open(ctx).await?;

    let token = match realm
        .machine
        .valid_access_token(Duration::from_secs(args.min_validity))
        .await
    {
        Ok(token) => token,
        Err(e) if e.requires_login() => {
            anyhow::bail!("Not logged in. Run 'realmgate login' first.");
        }
        Err(e) => return Err(e.into()),
    };

    if ctx.json_output {
        let session = realm.machine.snapshot();
        return ctx.print_json(&serde_json::json!({
            "access_token": token,
            "expires_at": session.expires_at,
        }));
    }
    println!("{}", token);
    Ok(())
}

/// Run the logout command.
pub async fn logout(ctx: &Context) -> Result<()> {
    let realm = session::open(ctx).await?;
    let had_session = realm.machine.snapshot().is_authenticated();

    if let Err(e) = realm.machine.logout().await {
        eprintln!("Warning: the identity provider was not notified: {}", e);
    }

    if ctx.json_output {
        return ctx.print_json(&serde_json::json!({ "logged_out": had_session }));
    }
    if had_session {
        println!("Logged out.");
    } else {
        println!("No active session.");
    }
    Ok(())
}

/// Try to open a URL in the default browser.
fn open_url(url: &str) -> std::io::Result<()> {
    #[cfg(target_os = "macos")]
    {
        std::process::Command::new("open").arg(url).status()?;
    }
    #[cfg(target_os = "linux")]
    {
        std::process::Command::new("xdg-open").arg(url).status()?;
    }
    #[cfg(target_os = "windows")]
    {
        std::process::Command::new("cmd")
            .args(["/C", "start", url])
            .status()?;
    }
    Ok(())
}
