use reqwest::{Client, Method};
use serde::Deserialize;
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::security::error::CustodyError;
use crate::security::lease::{Lease, LeaseCache};
use crate::security::single_flight::SingleFlight;

pub const VAULT_TOKEN_HEADER: &str = "X-Vault-Token";

/// Vault auth response envelope shared by login and renew-self.
#[derive(Debug, Deserialize)]
struct VaultAuthResponse {
    auth: Option<VaultAuthData>,
}

#[derive(Debug, Deserialize)]
struct VaultAuthData {
    client_token: Option<String>,
    lease_duration: Option<u64>,
    #[serde(default)]
    renewable: bool,
}

/// Vault client holding the backend's own AppRole lease.
///
/// Cloning is cheap; clones share the lease and the in-flight refresh.
#[derive(Clone)]
pub struct VaultClient {
    base_url: String,
    role_id: String,
    secret_id_path: PathBuf,
    safety_margin: Duration,
    http_client: Client,
    lease: LeaseCache,
    refresh: Arc<SingleFlight<Result<Lease, CustodyError>>>,
}

impl VaultClient {
    pub fn new(
        base_url: &str,
        role_id: &str,
        secret_id_path: PathBuf,
        safety_margin: Duration,
    ) -> Result<Self, CustodyError> {
        let http_client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| CustodyError::CustodyUnavailable(format!("creating HTTP client: {}", e)))?;

        debug!("Vault client initialized with base_url={}", base_url);

        Ok(VaultClient {
            base_url: base_url.trim_end_matches('/').to_string(),
            role_id: role_id.to_string(),
            secret_id_path,
            safety_margin,
            http_client,
            lease: LeaseCache::new(),
            refresh: Arc::new(SingleFlight::new()),
        })
    }

    /// Build a client from config; `None` when no custody address is set.
    pub fn from_config(cfg: &Config) -> Result<Option<Self>, CustodyError> {
        match (cfg.vault_address.as_deref(), cfg.role_id.as_deref()) {
            (Some(base), Some(role)) if !base.is_empty() && !role.is_empty() => Ok(Some(
                Self::new(base, role, cfg.secret_id_path.clone(), cfg.lease_safety_margin)?,
            )),
            _ => {
                debug!("Vault not configured (missing vault_address or role_id)");
                Ok(None)
            }
        }
    }

    pub fn lease_cache(&self) -> &LeaseCache {
        &self.lease
    }

    pub fn safety_margin(&self) -> Duration {
        self.safety_margin
    }

    async fn read_secret_id(&self) -> Result<String, CustodyError> {
        let raw = tokio::fs::read_to_string(&self.secret_id_path)
            .await
            .map_err(|e| {
                CustodyError::MissingCredentials(format!(
                    "reading secret id from {}: {}",
                    self.secret_id_path.display(),
                    e
                ))
            })?;
        let secret_id = raw.trim().to_string();
        if secret_id.is_empty() {
            return Err(CustodyError::MissingCredentials(format!(
                "secret id file {} is empty",
                self.secret_id_path.display()
            )));
        }
        Ok(secret_id)
    }

    /// Exchange the role id and secret id for a fresh lease.
    ///
    /// Path: POST {base_url}/v1/auth/approle/login
    pub async fn login(&self) -> Result<Lease, CustodyError> {
        let secret_id = self.read_secret_id().await?;
        let url = format!("{}/v1/auth/approle/login", self.base_url);

        debug!("Logging in to Vault: {}", url);

        let payload = serde_json::json!({
            "role_id": self.role_id,
            "secret_id": secret_id,
        });

        let response = self
            .http_client
            .post(&url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| CustodyError::CustodyUnavailable(format!("sending login request: {}", e)))?;

        if !response.status().is_success() {
            return Err(CustodyError::CustodyUnavailable(format!(
                "login failed with status {}",
                response.status()
            )));
        }

        let auth = parse_auth(response).await?;
        let token = auth
            .client_token
            .filter(|t| !t.is_empty())
            .ok_or_else(|| CustodyError::MalformedLeaseResponse("client_token missing".into()))?;
        let lease_duration = auth
            .lease_duration
            .ok_or_else(|| CustodyError::MalformedLeaseResponse("lease_duration missing".into()))?;

        let lease = Lease::new(token, Duration::from_secs(lease_duration), auth.renewable);
        self.lease.swap(lease.clone()).await;

        info!(
            lease_secs = lease_duration,
            renewable = auth.renewable,
            "Logged in to Vault"
        );
        Ok(lease)
    }

    /// Path: POST {base_url}/v1/auth/token/renew-self
    async fn renew_self(&self) -> Result<Lease, CustodyError> {
        let current = self
            .lease
            .get()
            .await
            .filter(|l| l.renewable)
            .ok_or(CustodyError::NotRenewable)?;
        let url = format!("{}/v1/auth/token/renew-self", self.base_url);

        debug!("Renewing Vault lease: {}", url);

        let response = self
            .http_client
            .post(&url)
            .header(VAULT_TOKEN_HEADER, &current.token)
            .json(&serde_json::json!({}))
            .send()
            .await
            .map_err(|e| CustodyError::CustodyUnavailable(format!("sending renew request: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(CustodyError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        let auth = parse_auth(response).await?;
        let lease_duration = auth
            .lease_duration
            .ok_or_else(|| CustodyError::MalformedLeaseResponse("lease_duration missing".into()))?;
        let token = auth
            .client_token
            .filter(|t| !t.is_empty())
            .unwrap_or(current.token);

        let lease = Lease::new(token, Duration::from_secs(lease_duration), auth.renewable);
        self.lease.swap(lease.clone()).await;

        debug!(lease_secs = lease_duration, "Vault lease renewed");
        Ok(lease)
    }

    /// Extend the current lease, falling back to a fresh login on any failure
    /// (including a lease that is not renewable). Only the login's failure
    /// reaches the caller.
    pub async fn renew(&self) -> Result<Lease, CustodyError> {
        if self.lease.get().await.is_none() {
            return self.login().await;
        }
        match self.renew_self().await {
            Ok(lease) => Ok(lease),
            Err(err) => {
                warn!(error = %err, "Vault lease renewal failed, logging in again");
                self.login().await
            }
        }
    }

    /// Return the held lease if it outlives the safety margin, otherwise
    /// renew it. Concurrent callers share one outstanding renewal.
    pub async fn ensure_fresh(&self, force: bool) -> Result<Lease, CustodyError> {
        if !force {
            if let Some(lease) = self.lease.get().await {
                if lease.is_fresh(self.safety_margin) {
                    return Ok(lease);
                }
            }
        }
        let client = self.clone();
        self.refresh
            .run(move || async move { client.renew_unless_fresh(force).await })
            .await
    }

    /// Body of a refresh flight. The freshness check is repeated here because
    /// another flight may have landed between the caller's check and this one.
    async fn renew_unless_fresh(&self, force: bool) -> Result<Lease, CustodyError> {
        if !force {
            if let Some(lease) = self.lease.get().await {
                if lease.is_fresh(self.safety_margin) {
                    debug!("Vault lease refreshed by an earlier flight");
                    return Ok(lease);
                }
            }
        }
        self.renew().await
    }

    /// Kick off a renewal without waiting for it when the lease is stale.
    async fn refresh_in_background(&self) {
        let stale = match self.lease.get().await {
            Some(lease) => !lease.is_fresh(self.safety_margin),
            None => true,
        };
        if stale && !self.refresh.in_flight() {
            let client = self.clone();
            tokio::spawn(async move {
                if let Err(err) = client.ensure_fresh(false).await {
                    warn!(error = %err, "Background Vault lease refresh failed (will retry)");
                }
            });
        }
    }

    /// Send a request to Vault with the lease currently held.
    ///
    /// Does not wait for a renewal: a stale lease triggers a background
    /// refresh and this request goes out with whatever token is held. A
    /// rejection is returned as [`CustodyError::Rejected`] without retrying.
    pub async fn call(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<Value, CustodyError> {
        self.refresh_in_background().await;

        let token = self.lease.token().await;
        let url = format!("{}/v1/{}", self.base_url, path.trim_start_matches('/'));

        debug!("Calling Vault: {} {}", method, url);

        let mut request = self
            .http_client
            .request(method, &url)
            .header(VAULT_TOKEN_HEADER, token);
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request
            .send()
            .await
            .map_err(|e| CustodyError::CustodyUnavailable(format!("sending Vault request: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(CustodyError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        response
            .json()
            .await
            .map_err(|e| CustodyError::MalformedResponse(format!("parsing Vault response: {}", e)))
    }
}

async fn parse_auth(response: reqwest::Response) -> Result<VaultAuthData, CustodyError> {
    let body: VaultAuthResponse = response
        .json()
        .await
        .map_err(|e| CustodyError::MalformedLeaseResponse(format!("parsing auth response: {}", e)))?;
    body.auth
        .ok_or_else(|| CustodyError::MalformedLeaseResponse("auth block missing".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::{Matcher, Server};
    use serde_json::json;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn secret_file() -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "secret-123").unwrap();
        file
    }

    fn client_for(server: &Server, secret: &NamedTempFile) -> VaultClient {
        VaultClient::new(
            &server.url(),
            "gate-role",
            secret.path().to_path_buf(),
            Duration::from_secs(30),
        )
        .unwrap()
    }

    fn login_body(token: &str, lease_duration: u64, renewable: bool) -> String {
        json!({
            "auth": {
                "client_token": token,
                "lease_duration": lease_duration,
                "renewable": renewable
            }
        })
        .to_string()
    }

    #[tokio::test]
    async fn login_stores_lease() {
        let mut server = Server::new_async().await;
        let secret = secret_file();
        let mock = server
            .mock("POST", "/v1/auth/approle/login")
            .match_body(Matcher::Json(json!({
                "role_id": "gate-role",
                "secret_id": "secret-123"
            })))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(login_body("s.lease-1", 3600, true))
            .create_async()
            .await;

        let client = client_for(&server, &secret);
        let lease = client.login().await.unwrap();

        mock.assert_async().await;
        assert_eq!(lease.token, "s.lease-1");
        assert!(lease.renewable);
        assert_eq!(client.lease_cache().token().await, "s.lease-1");
    }

    #[tokio::test]
    async fn login_without_lease_duration_is_malformed() {
        let mut server = Server::new_async().await;
        let secret = secret_file();
        server
            .mock("POST", "/v1/auth/approle/login")
            .with_status(200)
            .with_body(json!({"auth": {"client_token": "s.x"}}).to_string())
            .create_async()
            .await;

        let client = client_for(&server, &secret);
        let err = client.login().await.unwrap_err();
        assert!(matches!(err, CustodyError::MalformedLeaseResponse(_)));
        assert!(client.lease_cache().get().await.is_none());
    }

    #[tokio::test]
    async fn login_failure_status_is_unavailable() {
        let mut server = Server::new_async().await;
        let secret = secret_file();
        server
            .mock("POST", "/v1/auth/approle/login")
            .with_status(500)
            .create_async()
            .await;

        let client = client_for(&server, &secret);
        let err = client.login().await.unwrap_err();
        assert!(matches!(err, CustodyError::CustodyUnavailable(_)));
    }

    #[tokio::test]
    async fn login_without_secret_file_fails() {
        let server = Server::new_async().await;
        let client = VaultClient::new(
            &server.url(),
            "gate-role",
            PathBuf::from("/nonexistent/secret_id"),
            Duration::from_secs(30),
        )
        .unwrap();
        let err = client.login().await.unwrap_err();
        assert!(matches!(err, CustodyError::MissingCredentials(_)));
    }

    #[tokio::test]
    async fn renew_falls_back_to_login_when_rejected() {
        let mut server = Server::new_async().await;
        let secret = secret_file();
        let first_login = server
            .mock("POST", "/v1/auth/approle/login")
            .with_status(200)
            .with_body(login_body("s.first", 3600, true))
            .expect(1)
            .create_async()
            .await;

        let client = client_for(&server, &secret);
        client.login().await.unwrap();
        first_login.assert_async().await;
        first_login.remove_async().await;

        let renew = server
            .mock("POST", "/v1/auth/token/renew-self")
            .match_header(VAULT_TOKEN_HEADER, "s.first")
            .with_status(403)
            .with_body(r#"{"errors":["permission denied"]}"#)
            .expect(1)
            .create_async()
            .await;
        let relogin = server
            .mock("POST", "/v1/auth/approle/login")
            .with_status(200)
            .with_body(login_body("s.second", 3600, true))
            .expect(1)
            .create_async()
            .await;

        let lease = client.renew().await.unwrap();
        renew.assert_async().await;
        relogin.assert_async().await;
        assert_eq!(lease.token, "s.second");
    }

    #[tokio::test]
    async fn renew_keeps_token_when_response_omits_it() {
        let mut server = Server::new_async().await;
        let secret = secret_file();
        server
            .mock("POST", "/v1/auth/approle/login")
            .with_status(200)
            .with_body(login_body("s.keep", 60, true))
            .expect(1)
            .create_async()
            .await;
        let renew = server
            .mock("POST", "/v1/auth/token/renew-self")
            .with_status(200)
            .with_body(json!({"auth": {"lease_duration": 7200, "renewable": true}}).to_string())
            .expect(1)
            .create_async()
            .await;

        let client = client_for(&server, &secret);
        client.login().await.unwrap();
        let lease = client.renew().await.unwrap();

        renew.assert_async().await;
        assert_eq!(lease.token, "s.keep");
        assert!(lease.remaining() > Duration::from_secs(3600));
    }

    #[tokio::test]
    async fn non_renewable_lease_logs_in_again() {
        let mut server = Server::new_async().await;
        let secret = secret_file();
        let login = server
            .mock("POST", "/v1/auth/approle/login")
            .with_status(200)
            .with_body(login_body("s.static", 3600, false))
            .expect(2)
            .create_async()
            .await;
        let renew = server
            .mock("POST", "/v1/auth/token/renew-self")
            .expect(0)
            .create_async()
            .await;

        let client = client_for(&server, &secret);
        client.login().await.unwrap();
        client.renew().await.unwrap();

        login.assert_async().await;
        renew.assert_async().await;
    }

    #[tokio::test]
    async fn ensure_fresh_skips_refresh_for_fresh_lease() {
        let mut server = Server::new_async().await;
        let secret = secret_file();
        let login = server
            .mock("POST", "/v1/auth/approle/login")
            .with_status(200)
            .with_body(login_body("s.fresh", 3600, true))
            .expect(1)
            .create_async()
            .await;

        let client = client_for(&server, &secret);
        let first = client.ensure_fresh(false).await.unwrap();
        let second = client.ensure_fresh(false).await.unwrap();

        login.assert_async().await;
        assert_eq!(first.token, second.token);
    }

    #[tokio::test]
    async fn refresh_flight_rechecks_freshness() {
        let mut server = Server::new_async().await;
        let secret = secret_file();
        let login = server
            .mock("POST", "/v1/auth/approle/login")
            .with_status(200)
            .with_body(login_body("s.fresh", 3600, true))
            .expect(1)
            .create_async()
            .await;
        let renew = server
            .mock("POST", "/v1/auth/token/renew-self")
            .with_status(200)
            .with_body(json!({"auth": {"lease_duration": 3600, "renewable": true}}).to_string())
            .expect(1)
            .create_async()
            .await;

        let client = client_for(&server, &secret);
        client.login().await.unwrap();

        // A caller that saw a stale lease joins after another flight renewed it.
        let lease = client.renew_unless_fresh(false).await.unwrap();
        assert_eq!(lease.token, "s.fresh");
        login.assert_async().await;

        // Forced flights always reach the custody service.
        client.renew_unless_fresh(true).await.unwrap();
        renew.assert_async().await;
    }

    #[tokio::test]
    async fn ensure_fresh_force_renews() {
        let mut server = Server::new_async().await;
        let secret = secret_file();
        server
            .mock("POST", "/v1/auth/approle/login")
            .with_status(200)
            .with_body(login_body("s.fresh", 3600, true))
            .expect(1)
            .create_async()
            .await;
        let renew = server
            .mock("POST", "/v1/auth/token/renew-self")
            .with_status(200)
            .with_body(json!({"auth": {"lease_duration": 3600, "renewable": true}}).to_string())
            .expect(1)
            .create_async()
            .await;

        let client = client_for(&server, &secret);
        client.ensure_fresh(false).await.unwrap();
        client.ensure_fresh(true).await.unwrap();
        renew.assert_async().await;
    }

    #[tokio::test]
    async fn concurrent_ensure_fresh_logs_in_once() {
        let mut server = Server::new_async().await;
        let secret = secret_file();
        let login = server
            .mock("POST", "/v1/auth/approle/login")
            .with_status(200)
            .with_body(login_body("s.shared", 3600, true))
            .expect(1)
            .create_async()
            .await;

        let client = client_for(&server, &secret);
        let results =
            futures_util::future::join_all((0..8).map(|_| client.ensure_fresh(false))).await;

        login.assert_async().await;
        for result in results {
            assert_eq!(result.unwrap().token, "s.shared");
        }
    }

    #[tokio::test]
    async fn concurrent_ensure_fresh_share_failure() {
        let mut server = Server::new_async().await;
        let secret = secret_file();
        let login = server
            .mock("POST", "/v1/auth/approle/login")
            .with_status(503)
            .expect(1)
            .create_async()
            .await;

        let client = client_for(&server, &secret);
        let results =
            futures_util::future::join_all((0..4).map(|_| client.ensure_fresh(false))).await;

        login.assert_async().await;
        for result in results {
            assert!(matches!(result, Err(CustodyError::CustodyUnavailable(_))));
        }
    }

    #[tokio::test]
    async fn call_attaches_lease_and_surfaces_rejection() {
        let mut server = Server::new_async().await;
        let secret = secret_file();
        server
            .mock("POST", "/v1/auth/approle/login")
            .with_status(200)
            .with_body(login_body("s.call", 3600, true))
            .create_async()
            .await;
        let ok = server
            .mock("GET", "/v1/transit/keys/session")
            .match_header(VAULT_TOKEN_HEADER, "s.call")
            .with_status(200)
            .with_body(r#"{"data":{"latest_version":1}}"#)
            .expect(1)
            .create_async()
            .await;
        let denied = server
            .mock("POST", "/v1/transit/sign/session")
            .with_status(403)
            .with_body(r#"{"errors":["permission denied"]}"#)
            .create_async()
            .await;

        let client = client_for(&server, &secret);
        client.login().await.unwrap();

        let value = client
            .call(Method::GET, "transit/keys/session", None)
            .await
            .unwrap();
        assert_eq!(value["data"]["latest_version"], 1);
        ok.assert_async().await;

        let err = client
            .call(Method::POST, "transit/sign/session", Some(&json!({"input": ""})))
            .await
            .unwrap_err();
        denied.assert_async().await;
        assert!(matches!(err, CustodyError::Rejected { status: 403, .. }));
    }
}
