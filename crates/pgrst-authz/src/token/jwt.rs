//! HMAC JWT validation.
//!
//! PostgREST tokens are signed with a symmetric secret. A token is accepted
//! when its signature verifies with one of the HS256/HS384/HS512 algorithms
//! and its `exp`/`nbf` claims, if present, are satisfied. No claim is
//! required.
//!
//! ## Example
//!
//! ```ignore
//! use pgrst_authz::token::{extract_identity, mint_token, MintClaims};
//!
//! let token = mint_token(b"secret", &MintClaims::new("bar", "admin"))?;
//! headers.insert("authorization".into(), format!("Bearer {token}"));
//!
//! let claims = extract_identity(&headers, b"secret");
//! ```

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::Serialize;

/// Claim set of a verified token.
pub type Claims = serde_json::Map<String, serde_json::Value>;

const HMAC_ALGORITHMS: [Algorithm; 3] = [Algorithm::HS256, Algorithm::HS384, Algorithm::HS512];

// ============================================================================
// Error Types
// ============================================================================

/// Errors that can occur while verifying a token.
#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    /// The token has expired.
    #[error("Token expired")]
    Expired,

    /// The token is not valid yet (`nbf` in the future).
    #[error("Token not yet valid")]
    Immature,

    /// The token signature is invalid.
    #[error("Invalid signature")]
    InvalidSignature,

    /// The token is signed with a non-HMAC algorithm.
    #[error("Unsupported signing algorithm")]
    UnsupportedAlgorithm,

    /// The token could not be parsed.
    #[error("Malformed token: {message}")]
    Malformed {
        /// Description of the parse failure.
        message: String,
    },

    /// A token could not be signed.
    #[error("Failed to encode token: {message}")]
    Encoding {
        /// Description of the encoding error.
        message: String,
    },
}

impl TokenError {
    /// Creates a new `Malformed` error.
    #[must_use]
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::Malformed {
            message: message.into(),
        }
    }
}

impl From<jsonwebtoken::errors::Error> for TokenError {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        use jsonwebtoken::errors::ErrorKind;

        match err.kind() {
            ErrorKind::ExpiredSignature => Self::Expired,
            ErrorKind::ImmatureSignature => Self::Immature,
            ErrorKind::InvalidSignature => Self::InvalidSignature,
            ErrorKind::InvalidAlgorithm
            | ErrorKind::InvalidAlgorithmName
            | ErrorKind::MissingAlgorithm
            | ErrorKind::InvalidKeyFormat => Self::UnsupportedAlgorithm,
            _ => Self::malformed(err.to_string()),
        }
    }
}

// ============================================================================
// Validation
// ============================================================================

/// Verify an `authorization` header value and return its claims.
///
/// An optional scheme (`Bearer`) in front of the credential is stripped: if
/// the value splits into exactly two space-separated parts, the second one
/// is the token.
///
/// # Errors
///
/// Returns an error if the signature does not verify with `secret`, the
/// algorithm is not HMAC, or a time-based claim is not satisfied.
pub fn validate_token(header_value: &str, secret: &[u8]) -> Result<Claims, TokenError> {
    let token = match header_value.split(' ').collect::<Vec<_>>().as_slice() {
        [_, token] => *token,
        _ => header_value,
    };

    let mut validation = Validation::new(Algorithm::HS256);
    validation.algorithms = HMAC_ALGORITHMS.to_vec();
    validation.required_spec_claims.clear();
    validation.validate_exp = true;
    validation.validate_nbf = true;
    validation.validate_aud = false;

    let data = decode::<Claims>(token, &DecodingKey::from_secret(secret), &validation)?;
    Ok(data.claims)
}

/// Extract the verified identity from request headers.
///
/// `headers` must be keyed by lower-case header name. A missing, invalid or
/// expired token yields `None`; authentication failures are never errors.
#[must_use]
pub fn extract_identity(headers: &HashMap<String, String>, secret: &[u8]) -> Option<Claims> {
    let value = headers.get("authorization")?;
    match validate_token(value, secret) {
        Ok(claims) => Some(claims),
        Err(e) => {
            tracing::debug!(error = %e, "Bearer token rejected, continuing without identity");
            None
        }
    }
}

// ============================================================================
// Minting
// ============================================================================

/// Claims of a locally minted test token.
#[derive(Debug, Clone, Serialize)]
pub struct MintClaims {
    /// Principal id.
    pub id: String,
    /// PostgREST role.
    pub role: String,
    /// Not-before, seconds since the epoch.
    pub nbf: u64,
    /// Expiry, seconds since the epoch.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exp: Option<u64>,
}

impl MintClaims {
    /// Claims valid from now on, without expiry.
    #[must_use]
    pub fn new(id: impl Into<String>, role: impl Into<String>) -> Self {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();
        Self {
            id: id.into(),
            role: role.into(),
            nbf: now,
            exp: None,
        }
    }

    /// Expire the token `secs` seconds after `nbf`.
    #[must_use]
    pub fn expires_in(mut self, secs: u64) -> Self {
        self.exp = Some(self.nbf + secs);
        self
    }
}

/// Sign `claims` with HS256.
///
/// # Errors
///
/// Returns `TokenError::Encoding` if the claims cannot be serialized.
pub fn mint_token(secret: &[u8], claims: &MintClaims) -> Result<String, TokenError> {
    encode(
        &Header::new(Algorithm::HS256),
        claims,
        &EncodingKey::from_secret(secret),
    )
    .map_err(|e| TokenError::Encoding {
        message: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const SECRET: &[u8] = b"reallyreallyreallyreallyverysafe";

    fn sign_with(alg: Algorithm, claims: serde_json::Value) -> String {
        encode(&Header::new(alg), &claims, &EncodingKey::from_secret(SECRET)).unwrap()
    }

    #[test]
    fn test_valid_token_with_bearer_prefix() {
        let token = mint_token(SECRET, &MintClaims::new("bar", "admin")).unwrap();
        let claims = validate_token(&format!("Bearer {token}"), SECRET).unwrap();
        assert_eq!(claims["id"], "bar");
        assert_eq!(claims["role"], "admin");
    }

    #[test]
    fn test_valid_token_without_prefix() {
        let token = mint_token(SECRET, &MintClaims::new("bar", "anon")).unwrap();
        let claims = validate_token(&token, SECRET).unwrap();
        assert_eq!(claims["role"], "anon");
    }

    #[test]
    fn test_all_hmac_algorithms_accepted() {
        for alg in HMAC_ALGORITHMS {
            let token = sign_with(alg, json!({"id": "bar"}));
            assert!(validate_token(&token, SECRET).is_ok(), "{alg:?} rejected");
        }
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let token = mint_token(b"another-secret", &MintClaims::new("bar", "admin")).unwrap();
        let err = validate_token(&token, SECRET).unwrap_err();
        assert!(matches!(err, TokenError::InvalidSignature));
    }

    #[test]
    fn test_expired_token_rejected() {
        let token = sign_with(Algorithm::HS256, json!({"id": "bar", "exp": 1_000_000}));
        let err = validate_token(&token, SECRET).unwrap_err();
        assert!(matches!(err, TokenError::Expired));
    }

    #[test]
    fn test_future_nbf_rejected() {
        let future = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs()
            + 3600;
        let token = sign_with(Algorithm::HS256, json!({"id": "bar", "nbf": future}));
        let err = validate_token(&token, SECRET).unwrap_err();
        assert!(matches!(err, TokenError::Immature));
    }

    #[test]
    fn test_garbage_rejected() {
        assert!(validate_token("Bearer not-a-token", SECRET).is_err());
        assert!(validate_token("", SECRET).is_err());
    }

    #[test]
    fn test_extract_identity() {
        let token = mint_token(SECRET, &MintClaims::new("bar", "admin").expires_in(60)).unwrap();
        let mut headers = HashMap::new();
        assert!(extract_identity(&headers, SECRET).is_none());

        headers.insert("authorization".to_string(), format!("Bearer {token}"));
        let claims = extract_identity(&headers, SECRET).unwrap();
        assert_eq!(claims["id"], "bar");
        assert!(claims.contains_key("exp"));

        headers.insert("authorization".to_string(), "Bearer broken".to_string());
        assert!(extract_identity(&headers, SECRET).is_none());
    }
}
