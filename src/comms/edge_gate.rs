use axum::extract::{Request, State};
use axum::http::{header::AUTHORIZATION, request::Parts, HeaderMap, HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::RoutesConfig;
use crate::security::error::TokenError;
use crate::security::session_token::{AuthPhase, SessionClaims, TokenAuthority};

pub const USER_ID_HEADER: &str = "x-user-id";
pub const USER_NICKNAME_HEADER: &str = "x-user-nickname";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteClass {
    Public,
    Protected,
    /// Neither list: forwarded without authentication.
    Unlisted,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GateError {
    #[error("no session token supplied")]
    TokenMissing,
    #[error("invalid token")]
    Rejected(#[source] TokenError),
    #[error("token phase {phase:?} is not allowed on {path}")]
    PolicyViolation { phase: AuthPhase, path: String },
    #[error("path {0} has dot segments or encoded separators")]
    AmbiguousPath(String),
}

#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

impl IntoResponse for GateError {
    fn into_response(self) -> Response {
        let (status, error, message) = match &self {
            GateError::TokenMissing => (
                StatusCode::UNAUTHORIZED,
                "token_missing",
                "Authentication token required",
            ),
            GateError::Rejected(_) => (StatusCode::UNAUTHORIZED, "invalid_token", "Invalid token"),
            GateError::PolicyViolation { .. } => (
                StatusCode::UNAUTHORIZED,
                "policy_violation",
                "Authentication must be completed before accessing this resource",
            ),
            GateError::AmbiguousPath(_) => (
                StatusCode::BAD_REQUEST,
                "bad_request",
                "Request path must be in canonical form",
            ),
        };
        (
            status,
            Json(ErrorResponse {
                error: error.to_string(),
                message: message.to_string(),
            }),
        )
            .into_response()
    }
}

/// Ordered route tables and the one completion endpoint per pending phase.
#[derive(Debug, Clone)]
pub struct RoutePolicy {
    public: Vec<String>,
    protected: Vec<String>,
    upgrade: Vec<String>,
    step_up: Vec<(AuthPhase, String)>,
    token_query_param: String,
}

impl RoutePolicy {
    pub fn from_config(routes: &RoutesConfig) -> Self {
        Self {
            public: routes.public.clone(),
            protected: routes.protected.clone(),
            upgrade: routes.upgrade.clone(),
            step_up: vec![
                (AuthPhase::PendingNickname, routes.nickname_path.clone()),
                (AuthPhase::PendingSecondFactor, routes.second_factor_path.clone()),
            ],
            token_query_param: routes.token_query_param.clone(),
        }
    }

    /// Public wins over protected; anything else is unlisted.
    pub fn classify(&self, path: &str) -> RouteClass {
        if matches_prefix(&self.public, path) {
            RouteClass::Public
        } else if matches_prefix(&self.protected, path) {
            RouteClass::Protected
        } else {
            RouteClass::Unlisted
        }
    }

    pub fn is_upgrade_route(&self, path: &str) -> bool {
        matches_prefix(&self.upgrade, path)
    }

    /// A pending phase is confined to exactly its completion path.
    pub fn allows(&self, phase: AuthPhase, path: &str) -> bool {
        match phase {
            AuthPhase::Full => true,
            pending => self
                .step_up
                .iter()
                .any(|(p, allowed)| *p == pending && allowed == path),
        }
    }

    /// Bearer header first; upgrade routes may fall back to the query string.
    pub fn extract_token(&self, headers: &HeaderMap, path: &str, query: Option<&str>) -> Option<String> {
        if let Some(token) = bearer_token(headers) {
            return Some(token);
        }
        if !self.is_upgrade_route(path) {
            return None;
        }
        query?.split('&').find_map(|pair| {
            let (key, value) = pair.split_once('=')?;
            (key == self.token_query_param && !value.is_empty()).then(|| value.to_string())
        })
    }
}

/// True when the upstream could resolve `path` to something other than what
/// was classified: `.`/`..` segments (plain or percent-encoded), encoded
/// slashes or backslashes.
pub fn is_ambiguous_path(path: &str) -> bool {
    let lowered = path.to_ascii_lowercase();
    if lowered.contains("%2f") || lowered.contains("%5c") || lowered.contains('\\') {
        return true;
    }
    lowered.split('/').any(|segment| {
        let decoded = segment.replace("%2e", ".");
        decoded == "." || decoded == ".."
    })
}

fn matches_prefix(prefixes: &[String], path: &str) -> bool {
    prefixes.iter().any(|prefix| path.starts_with(prefix.as_str()))
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let token = value.strip_prefix("Bearer ")?.trim();
    (!token.is_empty()).then(|| token.to_string())
}

/// Classifies, verifies and annotates inbound requests.
#[derive(Clone)]
pub struct EdgeGate {
    authority: Arc<TokenAuthority>,
    policy: RoutePolicy,
}

impl EdgeGate {
    pub fn new(authority: Arc<TokenAuthority>, policy: RoutePolicy) -> Self {
        Self { authority, policy }
    }

    pub fn policy(&self) -> &RoutePolicy {
        &self.policy
    }

    /// Decide whether `req` may go upstream. `Ok(None)` means it passes
    /// without an identity; `Ok(Some(claims))` carries the verified one.
    pub async fn authorize(&self, parts: &Parts) -> Result<Option<SessionClaims>, GateError> {
        let path = parts.uri.path();
        if is_ambiguous_path(path) {
            warn!(path = %path, "Rejecting non-canonical request path");
            return Err(GateError::AmbiguousPath(path.to_string()));
        }
        if self.policy.classify(path) != RouteClass::Protected {
            return Ok(None);
        }

        let token = self
            .policy
            .extract_token(&parts.headers, path, parts.uri.query())
            .ok_or(GateError::TokenMissing)?;

        let claims = self.authority.verify(&token).await.map_err(|err| {
            warn!(path = %path, error = %err, "Token verification failed");
            GateError::Rejected(err)
        })?;

        if !self.policy.allows(claims.phase, path) {
            warn!(
                path = %path,
                sub = %claims.sub,
                phase = ?claims.phase,
                "Pre-authenticated token used outside its completion path"
            );
            return Err(GateError::PolicyViolation {
                phase: claims.phase,
                path: path.to_string(),
            });
        }

        Ok(Some(claims))
    }
}

/// Axum middleware wrapping whatever forwards to the upstream.
pub async fn authorize_request(
    State(gate): State<Arc<EdgeGate>>,
    req: Request,
    next: Next,
) -> Response {
    let (mut parts, body) = req.into_parts();
    // Only the gate ever sets identity headers, whatever the route class.
    parts.headers.remove(USER_ID_HEADER);
    parts.headers.remove(USER_NICKNAME_HEADER);

    let claims = match gate.authorize(&parts).await {
        Ok(claims) => claims,
        Err(err) => return err.into_response(),
    };

    let headers = &mut parts.headers;

    if let Some(claims) = claims {
        match identity_headers(&claims) {
            Some((id, nickname)) => {
                headers.insert(USER_ID_HEADER, id);
                headers.insert(USER_NICKNAME_HEADER, nickname);
            }
            None => {
                warn!(sub = %claims.sub, "Verified identity is not a valid header value");
                return GateError::Rejected(TokenError::InvalidClaims(
                    "identity not representable as a header".into(),
                ))
                .into_response();
            }
        }
        debug!(sub = %claims.sub, "Request authorized");
    }

    next.run(Request::from_parts(parts, body)).await
}

fn identity_headers(claims: &SessionClaims) -> Option<(HeaderValue, HeaderValue)> {
    Some((
        HeaderValue::from_str(&claims.sub).ok()?,
        HeaderValue::from_str(&claims.nickname).ok()?,
    ))
}
