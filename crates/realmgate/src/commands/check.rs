//! Check command - capability guard for scripts.

use anyhow::Result;
use clap::Args;
use realmgate_session::{Decision, DenyReason, authorize};

use super::Context;
use crate::session;

/// Arguments for the check command.
#[derive(Args, Debug)]
pub struct CheckArgs {
    /// Required capabilities; any one suffices (`role`, `realm:role`, `client:role`).
    /// With none, any authenticated session passes.
    pub capabilities: Vec<String>,
}

/// Run the check command. Exits non-zero on deny.
pub async fn run(args: CheckArgs, ctx: &Context) -> Result<()> {
    let realm = session::open(ctx).await?;

    if let Err(e) = realm.machine.ensure_fresh().await {
        tracing::debug!(error = %e, "Could not refresh before capability check");
    }

    let decision = authorize(&realm.machine.snapshot(), &args.capabilities);

    if ctx.json_output {
        ctx.print_json(&decision)?;
    } else {
        match &decision {
            Decision::Allow => println!("allow"),
            Decision::Deny(DenyReason::NotAuthenticated) => println!("deny: not authenticated"),
            Decision::Deny(DenyReason::InsufficientCapability { required }) => {
                println!("deny: requires one of {}", required.join(", "))
            }
        }
    }

    decision.into_result()?;
    Ok(())
}
