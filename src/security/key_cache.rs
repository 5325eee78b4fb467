use jsonwebtoken::DecodingKey;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::security::error::TokenError;
use crate::security::single_flight::SingleFlight;
use crate::security::transit::{KeySet, TransitBackend};

/// One custody key version. Immutable once observed.
#[derive(Clone)]
pub struct KeyVersionEntry {
    pub version: u64,
    pub public_pem: String,
    pub decoding_key: DecodingKey,
}

#[derive(Default)]
struct KeyCacheState {
    keys: HashMap<u64, KeyVersionEntry>,
    latest: Option<u64>,
}

/// Public keys of every custody key version seen so far, plus the latest
/// version pointer.
///
/// Refreshes merge into the cache, so tokens signed under a version that has
/// since been rotated out of "latest" keep verifying. A lookup miss never
/// short-circuits: callers refresh and retry.
#[derive(Clone)]
pub struct KeyCache {
    transit: Arc<dyn TransitBackend>,
    state: Arc<RwLock<KeyCacheState>>,
    refresh: Arc<SingleFlight<Result<(), TokenError>>>,
}

impl KeyCache {
    pub fn new(transit: Arc<dyn TransitBackend>) -> Self {
        Self {
            transit,
            state: Arc::new(RwLock::new(KeyCacheState::default())),
            refresh: Arc::new(SingleFlight::new()),
        }
    }

    pub async fn get(&self, version: u64) -> Option<KeyVersionEntry> {
        self.state.read().await.keys.get(&version).cloned()
    }

    pub async fn latest_version(&self) -> Option<u64> {
        self.state.read().await.latest
    }

    /// Known versions in ascending order.
    pub async fn versions(&self) -> Vec<u64> {
        let mut versions: Vec<u64> = self.state.read().await.keys.keys().copied().collect();
        versions.sort_unstable();
        versions
    }

    /// Re-fetch the key set and merge it in. Concurrent callers share one fetch.
    pub async fn refresh_keys(&self) -> Result<(), TokenError> {
        let cache = self.clone();
        self.refresh
            .run(move || async move { cache.fetch_and_merge().await })
            .await
    }

    async fn fetch_and_merge(&self) -> Result<(), TokenError> {
        let set = self.transit.fetch_public_keys().await.map_err(|e| {
            warn!(error = %e, "Fetching custody public keys failed");
            e
        })?;
        let parsed = parse_key_set(&set)?;
        self.merge(set.latest_version, parsed).await;
        Ok(())
    }

    async fn merge(&self, latest: u64, parsed: Vec<KeyVersionEntry>) {
        let mut state = self.state.write().await;
        let mut added = 0usize;
        for entry in parsed {
            match state.keys.get(&entry.version) {
                Some(existing) if existing.public_pem != entry.public_pem => {
                    warn!(
                        version = entry.version,
                        "Custody reported a different public key for a known version; keeping the cached one"
                    );
                }
                Some(_) => {}
                None => {
                    state.keys.insert(entry.version, entry);
                    added += 1;
                }
            }
        }
        if state.latest != Some(latest) {
            info!(previous = ?state.latest, latest, "Signing key latest version changed");
        }
        state.latest = Some(latest);
        debug!(added, total = state.keys.len(), latest, "Key cache refreshed");
    }
}

/// Validate a fetched key set completely before anything touches the cache.
fn parse_key_set(set: &KeySet) -> Result<Vec<KeyVersionEntry>, TokenError> {
    if set.keys.is_empty() {
        return Err(TokenError::malformed_key_set("no key versions"));
    }
    if !set.keys.contains_key(&set.latest_version) {
        return Err(TokenError::malformed_key_set(format!(
            "latest_version {} not among keys",
            set.latest_version
        )));
    }
    set.keys
        .iter()
        .map(|(version, pem)| {
            let decoding_key = DecodingKey::from_ec_pem(pem.as_bytes()).map_err(|e| {
                TokenError::malformed_key_set(format!(
                    "public key for version {} is not a P-256 PEM: {}",
                    version, e
                ))
            })?;
            Ok(KeyVersionEntry {
                version: *version,
                public_pem: pem.clone(),
                decoding_key,
            })
        })
        .collect()
}
