//! Session tokens: compact ES256 JWTs signed by the custody service.
//!
//! Signing goes through a [`TransitBackend`]; verification is local, against
//! the public keys held in the [`KeyCache`].

use base64::{
    engine::general_purpose::{STANDARD, URL_SAFE, URL_SAFE_NO_PAD},
    Engine,
};
use chrono::Utc;
use jsonwebtoken::Algorithm;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::Config;
use crate::security::error::TokenError;
use crate::security::key_cache::KeyCache;
use crate::security::transit::TransitBackend;

pub const TOKEN_ALGORITHM: &str = "ES256";
pub const TOKEN_TYPE: &str = "JWT";

/// How far through the login flow the token holder is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AuthPhase {
    /// Fully authenticated.
    Full,
    /// Identity proven but no nickname chosen yet.
    PendingNickname,
    /// Password accepted, second factor outstanding.
    PendingSecondFactor,
}

impl AuthPhase {
    /// On the wire a phase travels as the `nickname_required` /
    /// `totp_required` markers. A pending second factor wins when both are set.
    pub fn from_markers(nickname_required: bool, totp_required: bool) -> Self {
        if totp_required {
            AuthPhase::PendingSecondFactor
        } else if nickname_required {
            AuthPhase::PendingNickname
        } else {
            AuthPhase::Full
        }
    }

    fn markers(self) -> (Option<bool>, Option<bool>) {
        match self {
            AuthPhase::Full => (None, None),
            AuthPhase::PendingNickname => (Some(true), None),
            AuthPhase::PendingSecondFactor => (None, Some(true)),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct TokenHeader {
    alg: String,
    typ: String,
    kid: String,
}

/// What the caller asks to be signed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewSession {
    pub sub: String,
    pub nickname: String,
    pub phase: AuthPhase,
}

impl NewSession {
    pub fn full(sub: impl Into<String>, nickname: impl Into<String>) -> Self {
        Self {
            sub: sub.into(),
            nickname: nickname.into(),
            phase: AuthPhase::Full,
        }
    }
}

/// Verified token payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "WireClaims", from = "WireClaims")]
pub struct SessionClaims {
    pub sub: String,
    pub nickname: String,
    pub iss: String,
    pub iat: i64,
    pub exp: i64,
    pub phase: AuthPhase,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WireClaims {
    sub: String,
    nickname: String,
    iat: i64,
    exp: i64,
    iss: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    nickname_required: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    totp_required: Option<bool>,
}

impl From<SessionClaims> for WireClaims {
    fn from(c: SessionClaims) -> Self {
        let (nickname_required, totp_required) = c.phase.markers();
        WireClaims {
            sub: c.sub,
            nickname: c.nickname,
            iat: c.iat,
            exp: c.exp,
            iss: c.iss,
            nickname_required,
            totp_required,
        }
    }
}

impl From<WireClaims> for SessionClaims {
    fn from(w: WireClaims) -> Self {
        SessionClaims {
            phase: AuthPhase::from_markers(
                w.nickname_required.unwrap_or(false),
                w.totp_required.unwrap_or(false),
            ),
            sub: w.sub,
            nickname: w.nickname,
            iss: w.iss,
            iat: w.iat,
            exp: w.exp,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AuthoritySettings {
    pub issuer: String,
    pub token_lifetime: Duration,
    pub clock_tolerance: Duration,
}

impl Default for AuthoritySettings {
    fn default() -> Self {
        Self {
            issuer: "session-gate".to_string(),
            token_lifetime: Duration::from_secs(3600),
            clock_tolerance: Duration::from_secs(30),
        }
    }
}

impl AuthoritySettings {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            issuer: cfg.issuer.clone(),
            token_lifetime: cfg.token_lifetime,
            clock_tolerance: cfg.clock_tolerance,
        }
    }
}

/// Issues and verifies session tokens.
#[derive(Clone)]
pub struct TokenAuthority {
    transit: Arc<dyn TransitBackend>,
    keys: KeyCache,
    settings: AuthoritySettings,
}

impl TokenAuthority {
    pub fn new(transit: Arc<dyn TransitBackend>, settings: AuthoritySettings) -> Self {
        Self {
            keys: KeyCache::new(transit.clone()),
            transit,
            settings,
        }
    }

    pub fn key_cache(&self) -> &KeyCache {
        &self.keys
    }

    pub fn settings(&self) -> &AuthoritySettings {
        &self.settings
    }

    pub async fn refresh_keys(&self) -> Result<(), TokenError> {
        self.keys.refresh_keys().await
    }

    /// Sign `session` with the latest custody key version.
    #[tracing::instrument(skip(self, session), fields(sub = %session.sub))]
    pub async fn sign(&self, session: &NewSession) -> Result<String, TokenError> {
        if session.sub.trim().is_empty() {
            return Err(TokenError::InvalidClaims("sub must not be empty".into()));
        }
        if session.nickname.trim().is_empty() {
            return Err(TokenError::InvalidClaims("nickname must not be empty".into()));
        }

        let kid = match self.keys.latest_version().await {
            Some(v) => v,
            None => {
                self.keys.refresh_keys().await?;
                self.keys
                    .latest_version()
                    .await
                    .ok_or_else(|| TokenError::malformed_key_set("no latest version"))?
            }
        };

        let now = Utc::now().timestamp();
        let claims = SessionClaims {
            sub: session.sub.clone(),
            nickname: session.nickname.clone(),
            iss: self.settings.issuer.clone(),
            iat: now,
            exp: now + self.settings.token_lifetime.as_secs() as i64,
            phase: session.phase,
        };
        let header = TokenHeader {
            alg: TOKEN_ALGORITHM.to_string(),
            typ: TOKEN_TYPE.to_string(),
            kid: kid.to_string(),
        };

        let signing_input = format!("{}.{}", encode_segment(&header)?, encode_segment(&claims)?);
        let signed = self.transit.sign(signing_input.as_bytes(), kid).await?;
        if signed.key_version != kid {
            warn!(
                requested = kid,
                signed_with = signed.key_version,
                "Custody signed with a different key version than requested"
            );
            if let Err(err) = self.keys.refresh_keys().await {
                warn!(error = %err, "Key refresh after version mismatch failed");
            }
        }

        let signature = to_url_safe(&signed.signature)?;
        debug!(kid, "Session token signed");
        Ok(format!("{}.{}", signing_input, signature))
    }

    pub async fn verify(&self, token: &str) -> Result<SessionClaims, TokenError> {
        self.verify_at(token, Utc::now().timestamp()).await
    }

    /// Verify as if the current time were `now` (seconds since epoch).
    pub async fn verify_at(&self, token: &str, now: i64) -> Result<SessionClaims, TokenError> {
        let parts: Vec<&str> = token.split('.').collect();
        let &[header_b64, payload_b64, signature_b64] = parts.as_slice() else {
            return Err(TokenError::malformed("token must have 3 parts separated by dots"));
        };

        let header: Value = decode_segment(header_b64, "header")?;
        let payload: Value = decode_segment(payload_b64, "payload")?;
        URL_SAFE_NO_PAD
            .decode(signature_b64)
            .map_err(|e| TokenError::malformed(format!("failed to decode signature: {}", e)))?;

        let kid = validate_header(&header)?;
        let version: u64 = kid
            .parse()
            .map_err(|_| TokenError::UnknownSigningKey(kid.to_string()))?;

        let entry = match self.keys.get(version).await {
            Some(entry) => entry,
            None => {
                debug!(kid = %kid, "Signing key not cached, refreshing");
                self.keys.refresh_keys().await?;
                self.keys
                    .get(version)
                    .await
                    .ok_or_else(|| TokenError::UnknownSigningKey(kid.to_string()))?
            }
        };

        let message = format!("{}.{}", header_b64, payload_b64);
        let valid = jsonwebtoken::crypto::verify(
            signature_b64,
            message.as_bytes(),
            &entry.decoding_key,
            Algorithm::ES256,
        )
        .unwrap_or(false);
        if !valid {
            return Err(TokenError::SignatureInvalid);
        }

        let claims = required_claims(payload)?;
        self.validate_claims(&claims, now)?;
        Ok(claims)
    }

    fn validate_claims(&self, claims: &SessionClaims, now: i64) -> Result<(), TokenError> {
        if claims.iss != self.settings.issuer {
            return Err(TokenError::IssuerMismatch(format!(
                "expected '{}', got '{}'",
                self.settings.issuer, claims.iss
            )));
        }
        let tolerance = self.settings.clock_tolerance.as_secs() as i64;
        if now < claims.iat - tolerance {
            return Err(TokenError::TokenNotYetValid);
        }
        if now >= claims.exp + tolerance {
            return Err(TokenError::TokenExpired);
        }
        Ok(())
    }
}

fn encode_segment<T: Serialize>(value: &T) -> Result<String, TokenError> {
    let json = serde_json::to_vec(value)
        .map_err(|e| TokenError::InvalidClaims(format!("serializing token segment: {}", e)))?;
    Ok(URL_SAFE_NO_PAD.encode(json))
}

fn decode_segment(segment: &str, what: &str) -> Result<Value, TokenError> {
    let bytes = URL_SAFE_NO_PAD
        .decode(segment)
        .map_err(|e| TokenError::malformed(format!("failed to decode {}: {}", what, e)))?;
    let value: Value = serde_json::from_slice(&bytes)
        .map_err(|e| TokenError::malformed(format!("failed to parse {}: {}", what, e)))?;
    if !value.is_object() {
        return Err(TokenError::malformed(format!("{} is not a JSON object", what)));
    }
    Ok(value)
}

fn validate_header(header: &Value) -> Result<&str, TokenError> {
    let field = |name: &str| header.get(name).and_then(Value::as_str);
    if field("alg") != Some(TOKEN_ALGORITHM) {
        return Err(TokenError::malformed(format!(
            "unsupported algorithm {:?}",
            header.get("alg")
        )));
    }
    if field("typ") != Some(TOKEN_TYPE) {
        return Err(TokenError::malformed(format!(
            "unsupported token type {:?}",
            header.get("typ")
        )));
    }
    match field("kid") {
        Some(kid) if !kid.is_empty() => Ok(kid),
        _ => Err(TokenError::malformed("header missing 'kid'")),
    }
}

/// Check presence and type of every required claim before typing the payload.
fn required_claims(payload: Value) -> Result<SessionClaims, TokenError> {
    let obj: &Map<String, Value> = payload
        .as_object()
        .ok_or_else(|| TokenError::malformed("payload is not a JSON object"))?;

    for name in ["sub", "nickname", "iss"] {
        match obj.get(name).and_then(Value::as_str) {
            Some(s) if !s.is_empty() => {}
            _ => return Err(TokenError::missing_claim(name)),
        }
    }
    for name in ["iat", "exp"] {
        if obj.get(name).and_then(Value::as_i64).is_none() {
            return Err(TokenError::missing_claim(name));
        }
    }
    for name in ["nickname_required", "totp_required"] {
        if obj.get(name).is_some_and(|v| !v.is_boolean() && !v.is_null()) {
            return Err(TokenError::missing_claim(name));
        }
    }

    serde_json::from_value(payload).map_err(|e| TokenError::malformed(format!("claims: {}", e)))
}

/// Normalize a base64 signature of any alphabet to unpadded base64url.
fn to_url_safe(signature: &str) -> Result<String, TokenError> {
    let bytes = URL_SAFE_NO_PAD
        .decode(signature)
        .or_else(|_| URL_SAFE.decode(signature))
        .or_else(|_| STANDARD.decode(signature))
        .map_err(|e| {
            TokenError::Custody(crate::security::error::CustodyError::MalformedResponse(
                format!("signature is not base64: {}", e),
            ))
        })?;
    Ok(URL_SAFE_NO_PAD.encode(bytes))
}
