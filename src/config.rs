use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Route policy evaluated by the edge gate, in precedence order:
/// public, then protected, then default-allow.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RoutesConfig {
    pub public: Vec<String>,
    pub protected: Vec<String>,
    /// Real-time upgrade routes that may carry the token in the query string.
    pub upgrade: Vec<String>,
    pub nickname_path: String,
    pub second_factor_path: String,
    pub token_query_param: String,
}

impl Default for RoutesConfig {
    fn default() -> Self {
        Self {
            public: vec![
                "/health".to_string(),
                "/api/auth/login".to_string(),
                "/api/auth/register".to_string(),
            ],
            protected: vec!["/api/".to_string(), "/ws".to_string()],
            upgrade: vec!["/ws".to_string()],
            nickname_path: "/api/users/me/nickname".to_string(),
            second_factor_path: "/api/auth/2fa/verify".to_string(),
            token_query_param: "token".to_string(),
        }
    }
}

/// Local P-256 key pair used instead of the custody service (development).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LocalKeysConfig {
    pub private_key: PathBuf,
    pub public_key: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub vault_address: Option<String>,
    pub role_id: Option<String>,
    /// File holding the role's secret id. Read on every login, never logged.
    pub secret_id_path: PathBuf,
    pub transit_key: String,
    pub issuer: String,
    #[serde(with = "humantime_serde")]
    pub token_lifetime: Duration,
    #[serde(with = "humantime_serde")]
    pub clock_tolerance: Duration,
    #[serde(with = "humantime_serde")]
    pub lease_safety_margin: Duration,
    /// How often the signing key set is re-read to pick up rotations.
    #[serde(with = "humantime_serde")]
    pub key_refresh_interval: Duration,
    pub upstream_url: String,
    pub port: u16,
    pub routes: RoutesConfig,
    pub local_keys: Option<LocalKeysConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            vault_address: None,
            role_id: None,
            secret_id_path: PathBuf::from("/run/secrets/vault_secret_id"),
            transit_key: "session".to_string(),
            issuer: "session-gate".to_string(),
            token_lifetime: Duration::from_secs(3600),
            clock_tolerance: Duration::from_secs(30),
            lease_safety_margin: Duration::from_secs(30),
            key_refresh_interval: Duration::from_secs(300),
            upstream_url: "http://127.0.0.1:3000".to_string(),
            port: 8080,
            routes: RoutesConfig::default(),
            local_keys: None,
        }
    }
}

impl Config {
    pub fn from_file(path: &str) -> Result<Self> {
        let raw = fs::read_to_string(path).context("reading config file")?;
        serde_json::from_str(&raw).context("parsing config JSON")
    }

    /// Load `path` when it exists (defaults otherwise), apply environment
    /// overrides and validate.
    pub fn load(path: &str) -> Result<Self> {
        let mut cfg = if Path::new(path).exists() {
            Self::from_file(path)?
        } else {
            Self::default()
        };
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Environment variables win over file values.
    pub fn apply_env(&mut self) -> Result<()> {
        if let Ok(v) = std::env::var("VAULT_ADDRESS") {
            self.vault_address = Some(v);
        }
        if let Ok(v) = std::env::var("VAULT_ROLE_ID") {
            self.role_id = Some(v);
        }
        if let Ok(v) = std::env::var("VAULT_SECRET_ID_FILE") {
            self.secret_id_path = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("VAULT_TRANSIT_KEY") {
            self.transit_key = v;
        }
        if let Ok(v) = std::env::var("SESSION_ISSUER") {
            self.issuer = v;
        }
        if let Ok(v) = std::env::var("UPSTREAM_URL") {
            self.upstream_url = v;
        }
        if let Ok(v) = std::env::var("SESSION_LIFETIME") {
            self.token_lifetime = parse_duration_var("SESSION_LIFETIME", &v)?;
        }
        if let Ok(v) = std::env::var("SESSION_CLOCK_TOLERANCE") {
            self.clock_tolerance = parse_duration_var("SESSION_CLOCK_TOLERANCE", &v)?;
        }
        if let Ok(v) = std::env::var("LEASE_SAFETY_MARGIN") {
            self.lease_safety_margin = parse_duration_var("LEASE_SAFETY_MARGIN", &v)?;
        }
        if let Ok(v) = std::env::var("KEY_REFRESH_INTERVAL") {
            self.key_refresh_interval = parse_duration_var("KEY_REFRESH_INTERVAL", &v)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.local_keys.is_none() {
            if self.vault_address.as_deref().unwrap_or("").is_empty() {
                bail!("vault_address is required unless local_keys is configured");
            }
            if self.role_id.as_deref().unwrap_or("").is_empty() {
                bail!("role_id is required unless local_keys is configured");
            }
        }
        if self.token_lifetime.is_zero() {
            bail!("token_lifetime must be positive");
        }
        if self.key_refresh_interval.is_zero() {
            bail!("key_refresh_interval must be positive");
        }
        for step_up in [&self.routes.nickname_path, &self.routes.second_factor_path] {
            if !self.routes.protected.iter().any(|p| step_up.starts_with(p.as_str())) {
                bail!("step-up path {} is not covered by a protected route", step_up);
            }
        }
        Ok(())
    }
}

fn parse_duration_var(name: &str, raw: &str) -> Result<Duration> {
    humantime::parse_duration(raw).with_context(|| format!("parsing {} as a duration", name))
}

mod humantime_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}
