use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::task::JoinHandle;
use tracing::info;

use crate::comms::edge_gate::{EdgeGate, RoutePolicy};
use crate::comms::local_api;
use crate::comms::proxy::Upstream;
use crate::config::{Config, LocalKeysConfig};
use crate::security::session_token::{AuthoritySettings, TokenAuthority};
use crate::security::token_refresh::{spawn_key_refresh, spawn_lease_refresh};
use crate::security::transit::{LocalTransit, TransitBackend, VaultTransit};
use crate::security::vault_client::VaultClient;

/// A ready token authority plus the background tasks keeping it current.
pub struct Authority {
    pub authority: Arc<TokenAuthority>,
    pub lease_refresh: Option<JoinHandle<()>>,
    pub key_refresh: JoinHandle<()>,
}

impl Drop for Authority {
    fn drop(&mut self) {
        if let Some(handle) = self.lease_refresh.take() {
            handle.abort();
        }
        self.key_refresh.abort();
    }
}

/// Connect to the signing backend and load the key set. Any failure here is
/// fatal for the process.
pub async fn build_authority(cfg: &Config) -> Result<Authority> {
    let (transit, lease_refresh) = match &cfg.local_keys {
        Some(local) => {
            info!(private_key = %local.private_key.display(), "Using local signing keys");
            let transit: Arc<dyn TransitBackend> = Arc::new(load_local_transit(local)?);
            (transit, None)
        }
        None => {
            let client = VaultClient::from_config(cfg)?
                .context("vault_address and role_id are required")?;
            client.login().await.context("logging in to Vault")?;
            info!(transit_key = %cfg.transit_key, "Vault login succeeded");
            let handle = spawn_lease_refresh(client.clone());
            let transit: Arc<dyn TransitBackend> =
                Arc::new(VaultTransit::new(client, cfg.transit_key.clone()));
            (transit, Some(handle))
        }
    };

    let authority = TokenAuthority::new(transit, AuthoritySettings::from_config(cfg));
    authority
        .refresh_keys()
        .await
        .context("loading signing keys")?;
    let versions = authority.key_cache().versions().await;
    info!(versions = ?versions, "Signing keys loaded");

    let authority = Arc::new(authority);
    let key_refresh = spawn_key_refresh(authority.clone(), cfg.key_refresh_interval);

    Ok(Authority {
        authority,
        lease_refresh,
        key_refresh,
    })
}

fn load_local_transit(local: &LocalKeysConfig) -> Result<LocalTransit> {
    let private_pem = std::fs::read(&local.private_key)
        .with_context(|| format!("reading {}", local.private_key.display()))?;
    let public_pem = std::fs::read_to_string(&local.public_key)
        .with_context(|| format!("reading {}", local.public_key.display()))?;
    Ok(LocalTransit::new(&private_pem, &public_pem)?)
}

pub async fn run(cfg: Config, port: u16) -> Result<()> {
    info!(upstream = %cfg.upstream_url, issuer = %cfg.issuer, "Edge gate starting");

    let authority = build_authority(&cfg).await?;
    let gate = Arc::new(EdgeGate::new(
        authority.authority.clone(),
        RoutePolicy::from_config(&cfg.routes),
    ));
    let upstream = Upstream::new(&cfg.upstream_url)?;

    tokio::select! {
        res = local_api::serve(gate, upstream, port) => res?,
        res = tokio::signal::ctrl_c() => {
            res?;
            info!("shutdown signal received, stopping gate");
        }
    }
    Ok(())
}
