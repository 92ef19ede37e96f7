//! # Session Authentication
//!
//! Requests carry `Authorization: Bearer <user_id>.<signature>` where the
//! signature is the hex HMAC-SHA256 of the user id under the session secret.
//! Browser navigations (OAuth callbacks) cannot set headers, so the same token
//! is also accepted from the [`SESSION_COOKIE`] cookie. Credential management
//! itself belongs to the auth service that mints these tokens; this module
//! only verifies them.

use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    extract::{FromRef, FromRequestParts, OptionalFromRequestParts},
    http::{HeaderMap, header::AUTHORIZATION, request::Parts},
};
use axum_extra::headers::{Cookie, HeaderMapExt};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::config::AppConfig;
use crate::error::{ApiError, Surface};

type HmacSha256 = Hmac<Sha256>;

/// Cookie holding the session token for browser requests
pub const SESSION_COOKIE: &str = "session";

/// Authenticated user identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UserId(pub String);

impl UserId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

fn signature(secret: &[u8], user_id: &str) -> Vec<u8> {
    // HMAC accepts keys of any length
    let mut mac = match HmacSha256::new_from_slice(secret) {
        Ok(mac) => mac,
        Err(_) => return Vec::new(),
    };
    mac.update(user_id.as_bytes());
    mac.finalize().into_bytes().to_vec()
}

/// Mint a session token for `user_id`.
pub fn sign_session(secret: &[u8], user_id: &str) -> String {
    format!("{}.{}", user_id, hex::encode(signature(secret, user_id)))
}

/// Verify a session token, returning the user it names.
pub fn verify_session(secret: &[u8], token: &str) -> Option<UserId> {
    let (user_id, signature_hex) = token.rsplit_once('.')?;
    if user_id.is_empty() {
        return None;
    }
    let provided = hex::decode(signature_hex).ok()?;
    let expected = signature(secret, user_id);
    if expected.is_empty() || !bool::from(provided.ct_eq(&expected)) {
        return None;
    }
    Some(UserId(user_id.to_string()))
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let token = headers
        .get(AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")?
        .trim();
    Some(token.to_string())
}

fn cookie_token(headers: &HeaderMap) -> Option<String> {
    headers
        .typed_get::<Cookie>()?
        .get(SESSION_COOKIE)
        .map(str::to_string)
}

/// The bearer header wins; the session cookie is the fallback.
fn user_from_headers(headers: &HeaderMap, config: &AppConfig) -> Option<UserId> {
    let token = bearer_token(headers).or_else(|| cookie_token(headers))?;
    verify_session(config.session_key(), &token)
}

impl<S> FromRequestParts<S> for UserId
where
    Arc<AppConfig>: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let config = Arc::<AppConfig>::from_ref(state);
        user_from_headers(&parts.headers, &config).ok_or_else(|| {
            tracing::debug!("Rejecting request without a valid session");
            ApiError::unauthorized(Surface::Auth)
        })
    }
}

impl<S> OptionalFromRequestParts<S> for UserId
where
    Arc<AppConfig>: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &S,
    ) -> Result<Option<Self>, Self::Rejection> {
        let config = Arc::<AppConfig>::from_ref(state);
        Ok(user_from_headers(&parts.headers, &config))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        Router,
        body::Body,
        http::{Request, StatusCode},
        routing::get,
    };
    use tower::ServiceExt;

    const SECRET: &[u8] = b"test-session-secret";

    fn test_config() -> Arc<AppConfig> {
        Arc::new(AppConfig {
            session_secret: Some("test-session-secret".to_string()),
            ..Default::default()
        })
    }

    async fn call(request: Request<Body>) -> (StatusCode, String) {
        async fn required(user: UserId) -> String {
            user.0
        }
        async fn optional(user: Option<UserId>) -> String {
            user.map(|u| u.0).unwrap_or_else(|| "anonymous".to_string())
        }

        let response = Router::new()
            .route("/required", get(required))
            .route("/optional", get(optional))
            .with_state(test_config())
            .oneshot(request)
            .await
            .unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, String::from_utf8(body.to_vec()).unwrap())
    }

    #[test]
    fn test_sign_and_verify() {
        let token = sign_session(SECRET, "user-1");
        assert_eq!(verify_session(SECRET, &token), Some(UserId("user-1".into())));
        assert!(verify_session(b"other-secret", &token).is_none());
        assert!(verify_session(SECRET, "user-1").is_none());
        assert!(verify_session(SECRET, "user-1.zz").is_none());
        assert!(verify_session(SECRET, &token.replace("user-1", "user-2")).is_none());
    }

    #[test]
    fn test_user_ids_containing_dots() {
        let token = sign_session(SECRET, "first.last@example.com");
        assert_eq!(
            verify_session(SECRET, &token).unwrap().as_str(),
            "first.last@example.com"
        );
    }

    #[tokio::test]
    async fn test_missing_session_rejected() {
        let request = Request::builder()
            .uri("/required")
            .body(Body::empty())
            .unwrap();
        let (status, body) = call(request).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert!(body.contains("unauthorized:auth"));
    }

    #[tokio::test]
    async fn test_valid_session_accepted() {
        let request = Request::builder()
            .uri("/required")
            .header("Authorization", format!("Bearer {}", sign_session(SECRET, "u-42")))
            .body(Body::empty())
            .unwrap();
        let (status, body) = call(request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "u-42");
    }

    #[tokio::test]
    async fn test_optional_extractor() {
        let request = Request::builder()
            .uri("/optional")
            .header("Authorization", "Bearer forged.00")
            .body(Body::empty())
            .unwrap();
        let (status, body) = call(request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "anonymous");
    }

    #[tokio::test]
    async fn test_session_cookie_accepted() {
        let request = Request::builder()
            .uri("/required")
            .header(
                "Cookie",
                format!("theme=dark; {}={}", SESSION_COOKIE, sign_session(SECRET, "u-7")),
            )
            .body(Body::empty())
            .unwrap();
        let (status, body) = call(request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "u-7");

        let request = Request::builder()
            .uri("/optional")
            .header("Cookie", format!("{}=u-7.00", SESSION_COOKIE))
            .body(Body::empty())
            .unwrap();
        let (_, body) = call(request).await;
        assert_eq!(body, "anonymous");
    }
}
