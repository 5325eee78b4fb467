use thiserror::Error;

/// Failures talking to the custody service or holding a lease on it.
///
/// Cloneable so a single in-flight refresh can hand the same outcome to every
/// waiter.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CustodyError {
    #[error("custody service unavailable: {0}")]
    CustodyUnavailable(String),
    #[error("malformed lease response: {0}")]
    MalformedLeaseResponse(String),
    #[error("lease is not renewable")]
    NotRenewable,
    #[error("custody call rejected with status {status}: {body}")]
    Rejected { status: u16, body: String },
    #[error("malformed custody response: {0}")]
    MalformedResponse(String),
    #[error("credential material unavailable: {0}")]
    MissingCredentials(String),
}

/// Failures building or verifying session tokens.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TokenError {
    #[error("invalid claims: {0}")]
    InvalidClaims(String),
    #[error("malformed token: {0}")]
    MalformedToken(String),
    #[error("unknown signing key: {0}")]
    UnknownSigningKey(String),
    #[error("signature invalid")]
    SignatureInvalid,
    #[error("missing claim: {0}")]
    MissingClaim(String),
    #[error("issuer mismatch: {0}")]
    IssuerMismatch(String),
    #[error("token not yet valid")]
    TokenNotYetValid,
    #[error("token expired")]
    TokenExpired,
    #[error("malformed key set: {0}")]
    MalformedKeySet(String),
    #[error(transparent)]
    Custody(#[from] CustodyError),
}

impl TokenError {
    pub(crate) fn malformed(msg: impl Into<String>) -> Self {
        TokenError::MalformedToken(msg.into())
    }

    pub(crate) fn missing_claim(name: &str) -> Self {
        TokenError::MissingClaim(name.to_string())
    }

    pub(crate) fn malformed_key_set(msg: impl Into<String>) -> Self {
        TokenError::MalformedKeySet(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_variants() {
        let err = TokenError::MissingClaim("nickname".to_string());
        assert_eq!(err.to_string(), "missing claim: nickname");

        let err = TokenError::from(CustodyError::Rejected {
            status: 403,
            body: "permission denied".to_string(),
        });
        assert_eq!(
            err.to_string(),
            "custody call rejected with status 403: permission denied"
        );

        let errors = vec![
            TokenError::InvalidClaims("sub".to_string()),
            TokenError::UnknownSigningKey("7".to_string()),
            TokenError::SignatureInvalid,
            TokenError::TokenNotYetValid,
            TokenError::TokenExpired,
            TokenError::malformed_key_set("keys missing"),
        ];
        for error in errors {
            assert!(!error.to_string().is_empty());
        }
    }
}
