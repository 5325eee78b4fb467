//! Remote signing capability.
//!
//! The private key never leaves the custody service: the token authority
//! hands it a signing input and a key version and gets a signature back, and
//! it fetches the public half of every key version for local verification.

use async_trait::async_trait;
use base64::{engine::general_purpose, Engine};
use jsonwebtoken::{Algorithm, EncodingKey};
use reqwest::Method;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::{PoisonError, RwLock};
use tracing::debug;

use crate::security::error::{CustodyError, TokenError};
use crate::security::vault_client::VaultClient;

pub const HASH_ALGORITHM: &str = "sha2-256";
/// Vault's default; only consulted for RSA keys.
pub const SIGNATURE_ALGORITHM: &str = "pkcs1v15";
/// Raw r||s, the JOSE encoding of an ES256 signature.
pub const MARSHALING_ALGORITHM: &str = "jws";

/// Public key material for every version the custody service reports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySet {
    pub latest_version: u64,
    /// Version -> PEM-encoded public key.
    pub keys: BTreeMap<u64, String>,
}

/// A signature together with the key version that actually produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitSignature {
    pub key_version: u64,
    /// Base64 in whatever alphabet the backend returned.
    pub signature: String,
}

#[async_trait]
pub trait TransitBackend: Send + Sync {
    async fn sign(&self, input: &[u8], key_version: u64) -> Result<TransitSignature, TokenError>;
    async fn fetch_public_keys(&self) -> Result<KeySet, TokenError>;
}

#[derive(Debug, Deserialize)]
struct SignResponse {
    data: Option<SignData>,
}

#[derive(Debug, Deserialize)]
struct SignData {
    signature: Option<String>,
}

#[derive(Debug, Deserialize)]
struct KeysResponse {
    data: Option<KeysData>,
}

#[derive(Debug, Deserialize)]
struct KeysData {
    latest_version: Option<u64>,
    keys: Option<HashMap<String, KeyVersionData>>,
}

#[derive(Debug, Deserialize)]
struct KeyVersionData {
    public_key: Option<String>,
}

/// Vault transit engine behind the custody client.
#[derive(Clone)]
pub struct VaultTransit {
    client: VaultClient,
    key_name: String,
}

impl VaultTransit {
    pub fn new(client: VaultClient, key_name: impl Into<String>) -> Self {
        Self {
            client,
            key_name: key_name.into(),
        }
    }
}

#[async_trait]
impl TransitBackend for VaultTransit {
    /// Path: POST {base_url}/v1/transit/sign/{key_name}
    /// Expects response: {"data":{"signature":"vault:v<version>:<base64>"}}
    async fn sign(&self, input: &[u8], key_version: u64) -> Result<TransitSignature, TokenError> {
        let payload = serde_json::json!({
            "input": general_purpose::STANDARD.encode(input),
            "key_version": key_version,
            "signature_algorithm": SIGNATURE_ALGORITHM,
            "hash_algorithm": HASH_ALGORITHM,
            "marshaling_algorithm": MARSHALING_ALGORITHM,
        });
        let path = format!("transit/sign/{}", self.key_name);
        let value = self.client.call(Method::POST, &path, Some(&payload)).await?;

        let response: SignResponse = serde_json::from_value(value).map_err(|e| {
            CustodyError::MalformedResponse(format!("parsing sign response: {}", e))
        })?;
        let signature = response
            .data
            .and_then(|d| d.signature)
            .ok_or_else(|| CustodyError::MalformedResponse("signature missing".into()))?;

        Ok(parse_versioned_signature(&signature)?)
    }

    /// Path: GET {base_url}/v1/transit/keys/{key_name}
    async fn fetch_public_keys(&self) -> Result<KeySet, TokenError> {
        let path = format!("transit/keys/{}", self.key_name);
        let value = self.client.call(Method::GET, &path, None).await?;

        let response: KeysResponse = serde_json::from_value(value)
            .map_err(|e| TokenError::malformed_key_set(format!("parsing key listing: {}", e)))?;
        let data = response
            .data
            .ok_or_else(|| TokenError::malformed_key_set("data missing"))?;
        let latest_version = data
            .latest_version
            .ok_or_else(|| TokenError::malformed_key_set("latest_version missing"))?;
        let raw_keys = data
            .keys
            .ok_or_else(|| TokenError::malformed_key_set("keys missing"))?;

        let mut keys = BTreeMap::new();
        for (version, entry) in raw_keys {
            let version: u64 = version.parse().map_err(|_| {
                TokenError::malformed_key_set(format!("key version '{}' is not a number", version))
            })?;
            let pem = entry.public_key.filter(|p| !p.is_empty()).ok_or_else(|| {
                TokenError::malformed_key_set(format!("public_key missing for version {}", version))
            })?;
            keys.insert(version, pem);
        }

        debug!(
            key = %self.key_name,
            latest_version,
            versions = keys.len(),
            "Fetched transit public keys"
        );
        Ok(KeySet {
            latest_version,
            keys,
        })
    }
}

/// Split `vault:v<version>:<signature>` into its parts.
pub fn parse_versioned_signature(raw: &str) -> Result<TransitSignature, CustodyError> {
    let malformed = || CustodyError::MalformedResponse(format!("unexpected signature format: {}", raw));
    let mut parts = raw.splitn(3, ':');
    let (Some("vault"), Some(version), Some(signature)) = (parts.next(), parts.next(), parts.next())
    else {
        return Err(malformed());
    };
    let key_version = version
        .strip_prefix('v')
        .and_then(|v| v.parse::<u64>().ok())
        .ok_or_else(malformed)?;
    if signature.is_empty() {
        return Err(malformed());
    }
    Ok(TransitSignature {
        key_version,
        signature: signature.to_string(),
    })
}

struct LocalKey {
    encoding_key: EncodingKey,
    public_pem: String,
}

struct LocalKeyRing {
    latest_version: u64,
    keys: BTreeMap<u64, LocalKey>,
}

/// Signing backend over local P-256 key pairs.
///
/// Stands in for the custody service in development and in tests; versions
/// can be rotated in to simulate custody-side key rotation.
pub struct LocalTransit {
    ring: RwLock<LocalKeyRing>,
}

impl LocalTransit {
    /// Start with version 1 from a PKCS#8 private key and its SPKI public key.
    pub fn new(private_pem: &[u8], public_pem: &str) -> Result<Self, TokenError> {
        let first = local_key(private_pem, public_pem)?;
        let mut keys = BTreeMap::new();
        keys.insert(1, first);
        Ok(Self {
            ring: RwLock::new(LocalKeyRing {
                latest_version: 1,
                keys,
            }),
        })
    }

    /// Add the next key version and make it the latest. Returns the new version.
    pub fn rotate(&self, private_pem: &[u8], public_pem: &str) -> Result<u64, TokenError> {
        let key = local_key(private_pem, public_pem)?;
        let mut ring = self.ring.write().unwrap_or_else(PoisonError::into_inner);
        let version = ring.latest_version + 1;
        ring.keys.insert(version, key);
        ring.latest_version = version;
        Ok(version)
    }

    pub fn latest_version(&self) -> u64 {
        self.ring
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .latest_version
    }
}

fn local_key(private_pem: &[u8], public_pem: &str) -> Result<LocalKey, TokenError> {
    let encoding_key = EncodingKey::from_ec_pem(private_pem)
        .map_err(|e| CustodyError::MissingCredentials(format!("invalid local signing key: {}", e)))?;
    Ok(LocalKey {
        encoding_key,
        public_pem: public_pem.to_string(),
    })
}

#[async_trait]
impl TransitBackend for LocalTransit {
    async fn sign(&self, input: &[u8], key_version: u64) -> Result<TransitSignature, TokenError> {
        let ring = self.ring.read().unwrap_or_else(PoisonError::into_inner);
        let key = ring.keys.get(&key_version).ok_or_else(|| CustodyError::Rejected {
            status: 400,
            body: format!("key version {} does not exist", key_version),
        })?;
        let signature = jsonwebtoken::crypto::sign(input, &key.encoding_key, Algorithm::ES256)
            .map_err(|e| CustodyError::MalformedResponse(format!("local signing failed: {}", e)))?;
        Ok(TransitSignature {
            key_version,
            signature,
        })
    }

    async fn fetch_public_keys(&self) -> Result<KeySet, TokenError> {
        let ring = self.ring.read().unwrap_or_else(PoisonError::into_inner);
        Ok(KeySet {
            latest_version: ring.latest_version,
            keys: ring
                .keys
                .iter()
                .map(|(version, key)| (*version, key.public_pem.clone()))
                .collect(),
        })
    }
}
