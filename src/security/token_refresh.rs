use rand::Rng;
use std::sync::Arc;
use tokio::time::{sleep, Duration};
use tracing::{debug, info, warn};

use crate::security::lease::{Lease, MIN_SAFETY_MARGIN};
use crate::security::session_token::TokenAuthority;
use crate::security::vault_client::VaultClient;

/// Never spin faster than this, whatever the lease says.
const MIN_WAIT: Duration = Duration::from_secs(1);
const RETRY_BASE: Duration = Duration::from_secs(5);
const RETRY_MAX: Duration = Duration::from_secs(120);

/// Background task that keeps the Vault lease ahead of its safety margin.
///
/// Sleeps until the lease is about to cross the margin (minus 1-5s of jitter),
/// then forces a renewal through the client's single-flight path. Failures
/// back off exponentially and are retried; the task never exits on its own.
pub fn spawn_lease_refresh(client: VaultClient) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut failures: u32 = 0;
        loop {
            // Generate jitter outside the await so the future stays Send
            let jitter = Duration::from_secs(rand::thread_rng().gen_range(1..=5));
            let wait = if failures == 0 {
                let lease = client.lease_cache().get().await;
                next_refresh_in(lease.as_ref(), client.safety_margin(), jitter)
            } else {
                retry_backoff(failures)
            };

            debug!(wait_secs = wait.as_secs(), failures, "Next Vault lease refresh scheduled");
            sleep(wait).await;

            match client.ensure_fresh(true).await {
                Ok(lease) => {
                    if failures > 0 {
                        info!(after = failures, "Vault lease refresh recovered");
                    }
                    failures = 0;
                    let token_age_secs = client.lease_cache().age_seconds().await;
                    debug!(
                        remaining_secs = lease.remaining().as_secs(),
                        token_age_secs,
                        "Vault lease refreshed"
                    );
                }
                Err(err) => {
                    failures = failures.saturating_add(1);
                    warn!(
                        error = %err,
                        failures,
                        "Failed to refresh Vault lease (will retry)"
                    );
                }
            }
        }
    })
}

/// Background task that re-reads the signing key set every `interval`
/// (plus 1-5s of jitter) so signing follows custody-side rotations.
pub fn spawn_key_refresh(
    authority: Arc<TokenAuthority>,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let jitter = Duration::from_secs(rand::thread_rng().gen_range(1..=5));
            sleep(interval + jitter).await;

            let before = authority.key_cache().latest_version().await;
            match authority.refresh_keys().await {
                Ok(()) => {
                    let latest = authority.key_cache().latest_version().await;
                    if latest != before {
                        info!(previous = ?before, latest = ?latest, "Signing now uses rotated key version");
                    } else {
                        debug!(latest = ?latest, "Signing key set unchanged");
                    }
                }
                Err(err) => {
                    warn!(error = %err, "Failed to refresh signing keys (will retry)");
                }
            }
        }
    })
}

/// Time until `lease` should be renewed: the point it crosses the margin,
/// pulled forward by `jitter`. No lease means renew now.
fn next_refresh_in(lease: Option<&Lease>, margin: Duration, jitter: Duration) -> Duration {
    let Some(lease) = lease else {
        return MIN_WAIT;
    };
    lease
        .remaining()
        .saturating_sub(margin.max(MIN_SAFETY_MARGIN))
        .saturating_sub(jitter)
        .max(MIN_WAIT)
}

fn retry_backoff(failures: u32) -> Duration {
    let factor = 1u32 << failures.saturating_sub(1).min(6);
    (RETRY_BASE * factor).min(RETRY_MAX)
}
