//! Wiring from configuration to a live session.

use std::sync::Arc;

use anyhow::{Context as _, Result};
use realmgate_config::RealmgateConfig;
use realmgate_oauth::{KeycloakGateway, ProviderConfig, token_store};
use realmgate_session::{RetryPolicy, SessionConfig, SessionMachine};

use crate::commands::Context;

/// A session machine plus the gateway it was built on.
pub struct Realm {
    pub machine: SessionMachine,
    pub gateway: Arc<KeycloakGateway>,
}

/// Convert the `[provider]` section into gateway configuration.
fn provider_config(config: &RealmgateConfig) -> Result<ProviderConfig> {
    let section = config.provider()?;
    let mut provider = ProviderConfig::new(
        section.server_url.as_str(),
        section.realm.as_str(),
        section.client_id.as_str(),
    )
    .with_scopes(section.scopes.clone());

    if let Some(secret) = section.client_secret.as_deref().filter(|s| !s.is_empty()) {
        provider = provider.with_client_secret(secret);
    }
    if let Some(uri) = &section.redirect_uri {
        provider = provider.with_redirect_uri(uri.as_str());
    }
    Ok(provider)
}

/// Build the gateway and session machine, then resume any stored session.
pub async fn open(ctx: &Context) -> Result<Realm> {
    let loaded = ctx.load_config();
    for warning in &loaded.warnings {
        tracing::warn!("{}", warning);
    }
    let config = loaded.config;
    let provider = provider_config(&config)?;
    let section = config.session();

    let http = reqwest::Client::builder()
        .timeout(section.gateway_timeout())
        .build()
        .context("Failed to build HTTP client")?;

    let discovery = config.provider.as_ref().is_some_and(|p| p.discovery);
    let gateway = if discovery {
        KeycloakGateway::discover(provider, http).await?
    } else {
        KeycloakGateway::new(provider).with_http_client(http)
    };
    let gateway = Arc::new(gateway);

    let retry = RetryPolicy::default()
        .with_max_retries(section.refresh_max_retries)
        .with_base_delay(section.refresh_backoff());
    let session_config = SessionConfig::new(section.gateway_timeout())
        .with_refresh_leeway(section.refresh_leeway())
        .with_retry(retry)
        .with_persist_tokens(section.persist_tokens);

    let mut machine = SessionMachine::new(gateway.clone(), session_config);
    if section.persist_tokens {
        let store = token_store::create_token_store(&ctx.require_data_dir()?);
        machine = machine.with_token_store(store);
    }

    machine.subscribe(|change| {
        tracing::debug!(
            from = %change.from,
            to = %change.to,
            session_id = ?change.session.session_id,
            "Session transition"
        );
    });

    if let Err(e) = machine.restore().await {
        tracing::warn!(error = %e, "Could not restore stored session");
    }

    Ok(Realm { machine, gateway })
}
