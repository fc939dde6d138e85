//! JWT authentication gate and role-based authorization.
//!
//! Tokens are HMAC-SHA256 signed claim envelopes. The validation pins the
//! accepted algorithm, so a token whose `alg` header differs (including
//! `none`) fails before any signature comparison.

use crate::error::ApiError;
use crate::routes::AppState;
use axum::extract::{Request, State};
use axum::http::header;
use axum::middleware::Next;
use axum::response::Response;
use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::warn;

/// Issuer stamped into generated tokens.
pub const TOKEN_ISSUER: &str = "api-gateway";

/// Claims carried in a bearer token. Embedding the role saves a user lookup
/// per request; the tradeoff is that role changes need re-issuance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserClaims {
    pub user_id: String,
    pub username: String,
    pub role: String,
    pub exp: i64,
    pub iat: i64,
    pub iss: String,
}

/// Authenticated identity attached to the request.
#[derive(Debug, Clone)]
pub struct Principal {
    pub user_id: String,
    pub username: String,
    pub role: String,
}

/// Issues and validates bearer tokens.
pub struct TokenService {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    expiration: Duration,
}

impl TokenService {
    pub fn new(secret: &str, expiration_minutes: i64) -> Self {
        Self {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            expiration: Duration::minutes(expiration_minutes),
        }
    }

    /// Generate a signed token for a user. Returns the token and its expiry.
    pub fn generate(
        &self,
        user_id: &str,
        username: &str,
        role: &str,
    ) -> Result<(String, DateTime<Utc>), ApiError> {
        let now = Utc::now();
        let expires_at = now + self.expiration;

        let claims = UserClaims {
            user_id: user_id.to_string(),
            username: username.to_string(),
            role: role.to_string(),
            exp: expires_at.timestamp(),
            iat: now.timestamp(),
            iss: TOKEN_ISSUER.to_string(),
        };

        let token = encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &self.encoding_key,
        )
        .map_err(|e| ApiError::Internal(format!("failed to sign token: {}", e)))?;

        Ok((token, expires_at))
    }

    /// Validate a token and extract the principal.
    pub fn verify(&self, token: &str) -> Result<Principal, ApiError> {
        // Only HS256 is accepted; algorithm-substitution tokens fail here
        // independent of their signature.
        let validation = Validation::new(Algorithm::HS256);

        let data = decode::<UserClaims>(token, &self.decoding_key, &validation).map_err(|e| {
            match e.kind() {
                ErrorKind::ExpiredSignature => ApiError::Unauthorized("token has expired"),
                ErrorKind::InvalidAlgorithm | ErrorKind::InvalidAlgorithmName => {
                    warn!("token rejected for unexpected signing algorithm");
                    ApiError::Unauthorized("invalid token")
                }
                _ => ApiError::Unauthorized("invalid token"),
            }
        })?;

        Ok(Principal {
            user_id: data.claims.user_id,
            username: data.claims.username,
            role: data.claims.role,
        })
    }
}

/// Whether `role` satisfies `required`. Admin is a superset of every role.
pub fn role_allows(role: &str, required: &str) -> bool {
    role == required || role == "admin"
}

/// Middleware validating the bearer token and attaching the [`Principal`]
/// to the request.
pub async fn require_auth(
    State(state): State<Arc<AppState>>,
    mut req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let auth_header = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .ok_or(ApiError::Unauthorized("no token provided"))?;

    let token = auth_header
        .strip_prefix("Bearer ")
        .filter(|t| !t.is_empty())
        .ok_or(ApiError::Unauthorized("invalid token format"))?;

    let principal = state.tokens.verify(token)?;
    req.extensions_mut().insert(principal);

    Ok(next.run(req).await)
}

/// Middleware enforcing a role on an already-authenticated request.
pub async fn require_role(
    required: &'static str,
    req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let role = req
        .extensions()
        .get::<Principal>()
        .map(|p| p.role.as_str())
        .ok_or(ApiError::Forbidden)?;

    if !role_allows(role, required) {
        return Err(ApiError::Forbidden);
    }

    Ok(next.run(req).await)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> TokenService {
        TokenService::new("test-secret", 60)
    }

    #[test]
    fn test_generate_verify_roundtrip() {
        let tokens = service();
        let (token, expires_at) = tokens.generate("1", "admin", "admin").unwrap();
        assert!(expires_at > Utc::now());

        let principal = tokens.verify(&token).unwrap();
        assert_eq!(principal.user_id, "1");
        assert_eq!(principal.username, "admin");
        assert_eq!(principal.role, "admin");
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let (token, _) = service().generate("1", "admin", "admin").unwrap();
        let other = TokenService::new("other-secret", 60);
        assert!(matches!(
            other.verify(&token),
            Err(ApiError::Unauthorized("invalid token"))
        ));
    }

    #[test]
    fn test_expired_token_rejected() {
        // Negative expiration puts `exp` far enough in the past to clear the
        // validator's leeway.
        let tokens = TokenService::new("test-secret", -10);
        let (token, _) = tokens.generate("1", "user", "user").unwrap();
        assert!(matches!(
            tokens.verify(&token),
            Err(ApiError::Unauthorized("token has expired"))
        ));
    }

    #[test]
    fn test_alg_none_rejected_even_with_empty_signature() {
        let tokens = service();
        let exp = (Utc::now() + Duration::hours(1)).timestamp();
        let header = b64url(br#"{"alg":"none","typ":"JWT"}"#);
        let payload = b64url(
            format!(
                r#"{{"user_id":"1","username":"admin","role":"admin","exp":{},"iat":0,"iss":"api-gateway"}}"#,
                exp
            )
            .as_bytes(),
        );
        let token = format!("{}.{}.", header, payload);

        assert!(matches!(
            tokens.verify(&token),
            Err(ApiError::Unauthorized(_))
        ));
    }

    #[test]
    fn test_tampered_token_rejected() {
        let tokens = service();
        let (token, _) = tokens.generate("1", "user", "user").unwrap();
        let mut tampered = token.clone();
        tampered.pop();
        assert!(tokens.verify(&tampered).is_err());
    }

    #[test]
    fn test_role_allows() {
        assert!(role_allows("admin", "admin"));
        assert!(role_allows("admin", "user"));
        assert!(role_allows("user", "user"));
        assert!(!role_allows("user", "admin"));
        assert!(!role_allows("", "user"));
    }

    // Minimal unpadded base64url, enough to craft malformed tokens.
    fn b64url(data: &[u8]) -> String {
        const ALPHABET: &[u8] =
            b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789-_";
        let mut out = String::new();
        for chunk in data.chunks(3) {
            let b = [
                chunk[0],
                chunk.get(1).copied().unwrap_or(0),
                chunk.get(2).copied().unwrap_or(0),
            ];
            let n = u32::from(b[0]) << 16 | u32::from(b[1]) << 8 | u32::from(b[2]);
            out.push(ALPHABET[(n >> 18) as usize & 63] as char);
            out.push(ALPHABET[(n >> 12) as usize & 63] as char);
            if chunk.len() > 1 {
                out.push(ALPHABET[(n >> 6) as usize & 63] as char);
            }
            if chunk.len() > 2 {
                out.push(ALPHABET[n as usize & 63] as char);
            }
        }
        out
    }
}
