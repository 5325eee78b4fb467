use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::debug;

/// Lower bound applied to any configured renewal safety margin.
pub const MIN_SAFETY_MARGIN: Duration = Duration::from_secs(5);

/// The backend's own credential at the custody service.
#[derive(Clone, PartialEq, Eq)]
pub struct Lease {
    pub token: String,
    pub expires_at: Instant,
    pub renewable: bool,
}

impl Lease {
    pub fn new(token: String, lease_duration: Duration, renewable: bool) -> Self {
        Self {
            token,
            expires_at: Instant::now() + lease_duration,
            renewable,
        }
    }

    pub fn remaining(&self) -> Duration {
        self.expires_at.saturating_duration_since(Instant::now())
    }

    /// True while more than `margin` (never less than [`MIN_SAFETY_MARGIN`])
    /// of life is left.
    pub fn is_fresh(&self, margin: Duration) -> bool {
        self.remaining() > margin.max(MIN_SAFETY_MARGIN)
    }
}

impl fmt::Debug for Lease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lease")
            .field("token", &"<redacted>")
            .field("remaining", &self.remaining())
            .field("renewable", &self.renewable)
            .finish()
    }
}

/// Holds at most one lease, swapped atomically on refresh.
#[derive(Debug, Clone, Default)]
pub struct LeaseCache {
    lease: Arc<RwLock<Option<Lease>>>,
    last_rotated: Arc<RwLock<Option<DateTime<Utc>>>>,
}

impl LeaseCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self) -> Option<Lease> {
        self.lease.read().await.clone()
    }

    /// Current token, or an empty string before the first login.
    pub async fn token(&self) -> String {
        self.lease
            .read()
            .await
            .as_ref()
            .map(|l| l.token.clone())
            .unwrap_or_default()
    }

    /// Replace the held lease; rotation time is only bumped when the token changes.
    pub async fn swap(&self, new_lease: Lease) {
        let mut lease = self.lease.write().await;
        let rotated = lease.as_ref().map(|l| l.token != new_lease.token).unwrap_or(true);
        *lease = Some(new_lease);
        drop(lease);

        if rotated {
            let mut last_rotated = self.last_rotated.write().await;
            *last_rotated = Some(Utc::now());
            debug!("Custody lease rotated at {:?}", last_rotated);
        }
    }

    pub async fn last_rotated(&self) -> Option<DateTime<Utc>> {
        *self.last_rotated.read().await
    }

    /// Seconds since the token last changed.
    pub async fn age_seconds(&self) -> u64 {
        if let Some(rotated) = self.last_rotated().await {
            let age = Utc::now() - rotated;
            age.num_seconds().max(0) as u64
        } else {
            0
        }
    }
}
