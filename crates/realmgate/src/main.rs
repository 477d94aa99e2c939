//! realmgate - Keycloak session client for the command line
//!
//! Main entry point for the realmgate CLI.

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

mod commands;
mod session;

use commands::{auth, check, config, status};

// ─────────────────────────────────────────────────────────────────────────────
// CLI Structure
// ─────────────────────────────────────────────────────────────────────────────

/// realmgate - Keycloak session client for the command line
#[derive(Parser)]
#[command(name = "realmgate")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Output as JSON (for scripting)
    #[arg(long, global = true)]
    pub json: bool,

    /// Configuration and token directory
    #[arg(long, global = true, env = "REALMGATE_CONFIG_DIR")]
    pub config_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Log in to the configured realm
    Login(auth::LoginArgs),

    /// Show the current session
    Status,

    /// Print a valid access token, refreshing it first if needed
    Token(auth::TokenArgs),

    /// Check the session against required capabilities
    Check(check::CheckArgs),

    /// End the session
    Logout,

    /// Configuration management
    Config(config::ConfigArgs),
}

// ─────────────────────────────────────────────────────────────────────────────
// Main
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let ctx = commands::Context {
        config_dir: cli.config_dir.clone(),
        json_output: cli.json,
        verbose: cli.verbose,
    };

    // Broken config layers are skipped here; the command reports them.
    let logging = ctx.load_config().config.logging();

    // Initialize tracing: console (human-readable, stderr) + rotating JSON file
    let console_filter = if cli.verbose {
        "realmgate=debug,realmgate_session=debug,realmgate_oauth=debug,realmgate_config=debug,warn"
            .to_string()
    } else {
        format!(
            "realmgate={level},realmgate_session={level},realmgate_oauth={level},warn",
            level = logging.level
        )
    };

    use tracing_subscriber::prelude::*;
    let console = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_writer(std::io::stderr)
        .with_filter(tracing_subscriber::EnvFilter::new(console_filter));

    let (json_file, _guard) = match ctx.data_dir().filter(|_| logging.json_file) {
        Some(dir) => {
            let file_appender = tracing_appender::rolling::daily(dir.join("logs"), "realmgate.log");
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            let layer = tracing_subscriber::fmt::layer()
                .json()
                .with_writer(non_blocking)
                .with_filter(tracing_subscriber::EnvFilter::new(
                    "realmgate=trace,realmgate_session=trace,realmgate_oauth=trace,realmgate_config=trace,info",
                ));
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(console)
        .with(json_file)
        .init();

    // Dispatch to command handlers
    match cli.command {
        Commands::Login(args) => auth::login(args, &ctx).await,
        Commands::Status => status::run(&ctx).await,
        Commands::Token(args) => auth::token(args, &ctx).await,
        Commands::Check(args) => check::run(args, &ctx).await,
        Commands::Logout => auth::logout(&ctx).await,
        Commands::Config(args) => config::run(args, &ctx).await,
    }
}
