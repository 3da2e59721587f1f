#![forbid(unsafe_code)]

use crate::ApiError;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde_json::Value;
use std::collections::HashSet;
use tracing::warn;

pub const MISSING_HEADER: &str = "Authorization header isn't set";
pub const INVALID_TOKEN: &str = "Invalid token";

/// HS256 verification against the shared API secret.
///
/// With `enforce` off a missing or bad token is logged and the request proceeds
/// unauthenticated. Production deployments must enforce.
#[derive(Clone)]
pub struct Authenticator {
    decoding: DecodingKey,
    encoding: EncodingKey,
    validation: Validation,
    enforce: bool,
}

impl std::fmt::Debug for Authenticator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Authenticator")
            .field("enforce", &self.enforce)
            .finish_non_exhaustive()
    }
}

impl Authenticator {
    pub fn new(secret: &str, enforce: bool) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.required_spec_claims = HashSet::new();
        Self {
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            validation,
            enforce,
        }
    }

    pub fn enforced(&self) -> bool {
        self.enforce
    }

    /// Verifies an `Authorization` value (raw token or `Bearer <token>`) and returns its claims.
    pub fn check(&self, authorization: Option<&str>) -> Result<Option<Value>, ApiError> {
        let token = authorization
            .map(str::trim)
            .map(|raw| raw.strip_prefix("Bearer ").unwrap_or(raw).trim())
            .filter(|token| !token.is_empty());

        let Some(token) = token else {
            if self.enforce {
                return Err(ApiError::Forbidden(MISSING_HEADER.to_string()));
            }
            return Ok(None);
        };

        match decode::<Value>(token, &self.decoding, &self.validation) {
            Ok(data) => Ok(Some(data.claims)),
            Err(_) if self.enforce => Err(ApiError::Forbidden(INVALID_TOKEN.to_string())),
            Err(err) => {
                warn!(error = %err, "Invalid token, continuing unauthenticated");
                Ok(None)
            }
        }
    }

    pub fn sign(&self, claims: &Value) -> Result<String, ApiError> {
        encode(&Header::new(Algorithm::HS256), claims, &self.encoding)
            .map_err(|err| ApiError::Internal(format!("failed to sign token: {err}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn enforced_rejects_missing_and_invalid_tokens() {
        let auth = Authenticator::new("secret", true);
        let missing = auth.check(None).expect_err("missing");
        assert_eq!(missing.to_string(), MISSING_HEADER);
        assert_eq!(missing.status().as_u16(), 403);

        let forged = Authenticator::new("other", true)
            .sign(&json!({"u": {"id": 1}}))
            .expect("sign");
        let invalid = auth.check(Some(&forged)).expect_err("invalid");
        assert_eq!(invalid.to_string(), INVALID_TOKEN);
    }

    #[test]
    fn valid_token_yields_claims_with_or_without_bearer() {
        let auth = Authenticator::new("secret", true);
        let token = auth.sign(&json!({"u": {"id": 1}})).expect("sign");
        assert_eq!(auth.check(Some(&token)).expect("raw"), Some(json!({"u": {"id": 1}})));
        let bearer = format!("Bearer {token}");
        assert!(auth.check(Some(&bearer)).expect("bearer").is_some());
    }

    #[test]
    fn unenforced_lets_bad_tokens_through() {
        let auth = Authenticator::new("secret", false);
        assert_eq!(auth.check(None).expect("missing"), None);
        assert_eq!(auth.check(Some("garbage")).expect("garbage"), None);
    }
}
