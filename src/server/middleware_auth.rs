//! Bearer-token authentication for the call API and the agent socket.
//!
//! Tokens are HS256 JWTs whose `sub` is the CRM user id. When no secret is
//! configured the token is decoded without signature checks (development
//! mode) so a local UI can connect with any well-formed token.

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

use super::AppState;

#[derive(Debug, Deserialize)]
struct Claims {
    sub: String,
    #[serde(default)]
    email: Option<String>,
}

/// Authenticated user, resolved from the bearer token.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuthUser {
    pub user_id: String,
    pub email: Option<String>,
}

/// Resolves a bearer token to a user. `None` means reject.
pub trait TokenVerifier: Send + Sync {
    fn verify(&self, token: &str) -> Option<AuthUser>;
}

pub struct JwtVerifier {
    secret: Option<String>,
    audience: Option<String>,
}

impl JwtVerifier {
    pub fn new(secret: Option<String>, audience: Option<String>) -> Self {
        JwtVerifier { secret, audience }
    }

    fn decode_claims(&self, token: &str) -> Result<Claims, jsonwebtoken::errors::Error> {
        let mut validation = Validation::new(Algorithm::HS256);
        match &self.audience {
            Some(aud) => validation.set_audience(&[aud.as_str()]),
            None => validation.validate_aud = false,
        }
        match &self.secret {
            Some(secret) => {
                let key = DecodingKey::from_secret(secret.as_bytes());
                Ok(decode::<Claims>(token, &key, &validation)?.claims)
            }
            None => {
                // Development mode: decode without verification
                validation.insecure_disable_signature_validation();
                validation.validate_exp = false;
                validation.required_spec_claims.clear();
                Ok(decode::<Claims>(token, &DecodingKey::from_secret(b""), &validation)?.claims)
            }
        }
    }
}

impl TokenVerifier for JwtVerifier {
    fn verify(&self, token: &str) -> Option<AuthUser> {
        match self.decode_claims(token) {
            Ok(claims) if !claims.sub.is_empty() => Some(AuthUser {
                user_id: claims.sub,
                email: claims.email,
            }),
            Ok(_) => None,
            Err(e) => {
                debug!(error = %e, "bearer token rejected");
                None
            }
        }
    }
}

/// `Authorization: Bearer <token>`, if present.
pub(crate) fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

fn unauthorized() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(serde_json::json!({"error": "Authentication required"})),
    )
        .into_response()
}

/// Axum extractor that requires any authenticated user.
///
/// Returns 401 if no valid bearer token is present.
pub struct RequireAuth(pub AuthUser);

impl FromRequestParts<Arc<AppState>> for RequireAuth {
    type Rejection = Response;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let token = bearer_token(&parts.headers).ok_or_else(unauthorized)?;
        let user = state.verifier.verify(token).ok_or_else(unauthorized)?;
        Ok(RequireAuth(user))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};

    fn token(secret: &str, claims: serde_json::Value) -> String {
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    fn exp() -> i64 {
        chrono::Utc::now().timestamp() + 600
    }

    #[test]
    fn verifies_signed_token() {
        let v = JwtVerifier::new(Some("s3cret".into()), None);
        let user = v
            .verify(&token(
                "s3cret",
                serde_json::json!({"sub": "42", "email": "a@b.c", "exp": exp()}),
            ))
            .unwrap();
        assert_eq!(user.user_id, "42");
        assert_eq!(user.email.as_deref(), Some("a@b.c"));
    }

    #[test]
    fn rejects_wrong_secret_and_expired() {
        let v = JwtVerifier::new(Some("s3cret".into()), None);
        assert!(v
            .verify(&token("other", serde_json::json!({"sub": "42", "exp": exp()})))
            .is_none());
        assert!(v
            .verify(&token("s3cret", serde_json::json!({"sub": "42", "exp": 1000})))
            .is_none());
        assert!(v.verify("garbage").is_none());
    }

    #[test]
    fn audience_enforced_when_configured() {
        let v = JwtVerifier::new(Some("k".into()), Some("authenticated".into()));
        assert!(v
            .verify(&token("k", serde_json::json!({"sub": "1", "exp": exp()})))
            .is_none());
        assert!(v
            .verify(&token(
                "k",
                serde_json::json!({"sub": "1", "exp": exp(), "aud": "authenticated"})
            ))
            .is_some());
    }

    #[test]
    fn dev_mode_accepts_unsigned_claims() {
        let v = JwtVerifier::new(None, None);
        let user = v
            .verify(&token("anything", serde_json::json!({"sub": "7"})))
            .unwrap();
        assert_eq!(user.user_id, "7");
    }

    #[test]
    fn empty_subject_rejected() {
        let v = JwtVerifier::new(None, None);
        assert!(v.verify(&token("x", serde_json::json!({"sub": ""}))).is_none());
    }

    #[test]
    fn bearer_token_parsing() {
        let mut headers = HeaderMap::new();
        assert!(bearer_token(&headers).is_none());
        headers.insert(header::AUTHORIZATION, "Basic abc".parse().unwrap());
        assert!(bearer_token(&headers).is_none());
        headers.insert(header::AUTHORIZATION, "Bearer abc.def".parse().unwrap());
        assert_eq!(bearer_token(&headers), Some("abc.def"));
    }
}
