//! Config command - configuration management.

use std::path::PathBuf;

use anyhow::Result;
use clap::{Args, Subcommand};

use super::Context;

/// Arguments for the config command.
#[derive(Args, Debug)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommand,
}

#[derive(Subcommand, Debug)]
pub enum ConfigCommand {
    /// Show resolved configuration and where it was loaded from
    Show,

    /// Initialize a config file with defaults
    Init {
        /// Create project-local config (./realmgate.toml) instead of user config
        #[arg(long)]
        local: bool,
    },

    /// Show configuration file path
    Path,
}

/// Run the config command.
pub async fn run(args: ConfigArgs, ctx: &Context) -> Result<()> {
    match args.command {
        ConfigCommand::Show => cmd_show(ctx),
        ConfigCommand::Init { local } => cmd_init(local, ctx),
        ConfigCommand::Path => cmd_path(ctx),
    }
}

fn cmd_show(ctx: &Context) -> Result<()> {
    let loaded = ctx.load_config();
    let config = &loaded.config;

    if ctx.json_output {
        let mut redacted = config.clone();
        if let Some(provider) = redacted.provider.as_mut()
            && provider.client_secret.is_some()
        {
            provider.client_secret = Some("****".to_string());
        }
        return ctx.print_json(&serde_json::json!({
            "sources": loaded.files,
            "config": redacted,
            "warnings": loaded.warnings,
        }));
    }

    println!("# realmgate Configuration\n");

    if loaded.files.is_empty() {
        println!("No config files loaded (using defaults)\n");
    } else {
        println!("Config files:");
        for source in &loaded.files {
            println!("  {}", source.display());
        }
        println!();
    }

    match &config.provider {
        Some(provider) => {
            println!("Provider:");
            println!("  server_url: {}", provider.server_url);
            println!("  realm: {}", provider.realm);
            println!("  client_id: {}", provider.client_id);
            if provider.has_plaintext_secret() {
                println!("  client_secret: ****");
            }
            if let Some(uri) = &provider.redirect_uri {
                println!("  redirect_uri: {}", uri);
            }
            println!("  scopes: {}", provider.scopes.join(" "));
            if provider.discovery {
                println!("  discovery: enabled");
            }
            if let Err(e) = provider.validate() {
                println!("  ⚠ {}", e);
            }
            println!();
        }
        None => println!("No provider configured\n"),
    }

    let session = config.session();
    println!("Session:");
    println!("  refresh_leeway: {}s", session.refresh_leeway_secs);
    println!("  gateway_timeout: {}s", session.gateway_timeout_secs);
    println!(
        "  refresh retries: {} (backoff {}ms)",
        session.refresh_max_retries, session.refresh_backoff_ms
    );
    println!("  persist_tokens: {}", session.persist_tokens);
    println!();

    if !loaded.warnings.is_empty() {
        println!("Warnings:");
        for w in &loaded.warnings {
            println!("  ⚠ {}", w);
        }
        println!();
    }

    if ctx.verbose {
        println!("---\nRaw config:\n");
        if let Ok(toml_str) = config.to_toml() {
            println!("{}", toml_str);
        }
    }

    Ok(())
}

fn user_config_path(ctx: &Context) -> Result<PathBuf> {
    Ok(ctx.require_data_dir()?.join(realmgate_config::USER_CONFIG_FILE))
}

fn cmd_init(local: bool, ctx: &Context) -> Result<()> {
    let path = if local {
        PathBuf::from(realmgate_config::PROJECT_CONFIG_FILE)
    } else {
        let path = user_config_path(ctx)?;
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        path
    };

    if path.exists() {
        println!("Config file already exists: {}", path.display());
        return Ok(());
    }

    let template = r#"# realmgate Configuration

# Identity provider (Keycloak realm)
[provider]
server_url = "http://auth.localhost/"
realm = "my-organization"
client_id = "my-web-app"
# redirect_uri = "http://localhost:3000/auth/callback"   # required for --browser
# scopes = ["openid", "profile", "email"]
# discovery = false                                       # use .well-known/openid-configuration
# Confidential clients: prefer REALMGATE_CLIENT_SECRET over storing it here

# Session lifecycle
# [session]
# refresh_leeway_secs = 30
# gateway_timeout_secs = 10
# refresh_max_retries = 3
# refresh_backoff_ms = 250
# persist_tokens = true

# Logging
# [logging]
# level = "info"
# json_file = true
"#;

    std::fs::write(&path, template)?;
    println!("✓ Created config file: {}", path.display());
    println!();
    println!("Next steps:");
    println!("  edit the [provider] section for your realm");
    println!("  realmgate config show     # verify configuration");
    println!("  realmgate login           # log in");

    Ok(())
}

fn cmd_path(ctx: &Context) -> Result<()> {
    println!("{}", user_config_path(ctx)?.display());
    Ok(())
}
