//! Test utilities shared by the integration tests.
//!
//! Every test gets its own in-memory SQLite database with all migrations
//! applied, and an application state wired to local doubles: wiremock for
//! the OAuth providers, the echo model and an in-memory stream store.

#![allow(dead_code)]

use std::sync::Arc;

use anyhow::Result;
use axum::body::Body;
use axum::http::{HeaderMap, HeaderValue, Request, Response, header};
use chatlink::auth::{SESSION_COOKIE, sign_session};
use chatlink::chat::{EchoModelInvoker, MemoryStreamStore, ModelInvoker, StreamContext};
use chatlink::config::AppConfig;
use chatlink::connectors::{GoogleClient, GoogleEndpoints, ProviderClients, SlackClient};
use chatlink::server::{AppState, create_app};
use migration::{Migrator, MigratorTrait};
use sea_orm::{Database, DatabaseConnection};
use tower::ServiceExt;

pub const TEST_SESSION_SECRET: &str = "integration-test-session-secret";
pub const TEST_ENCRYPTION_KEY: &str =
    "000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f";
pub const TEST_APP_URL: &str = "https://app.example.com";

/// Sets up an in-memory SQLite database with all migrations applied.
pub async fn setup_test_db() -> Result<DatabaseConnection> {
    let db = Database::connect("sqlite::memory:").await?;
    Migrator::up(&db, None).await?;
    Ok(db)
}

/// Same as [`setup_test_db`], wrapped for sharing with repositories.
pub async fn setup_test_db_arc() -> Result<Arc<DatabaseConnection>> {
    Ok(Arc::new(setup_test_db().await?))
}

/// Configuration used by the router tests
pub fn test_config() -> AppConfig {
    AppConfig {
        profile: "test".to_string(),
        app_url: TEST_APP_URL.to_string(),
        encryption_key: Some(TEST_ENCRYPTION_KEY.to_string()),
        session_secret: Some(TEST_SESSION_SECRET.to_string()),
        ..AppConfig::default()
    }
}

/// Provider clients pointed at a wiremock server
pub fn mock_clients(provider_base: &str) -> ProviderClients {
    ProviderClients::new()
        .with_google(Arc::new(GoogleClient::with_endpoints(
            "google-client".to_string(),
            "google-secret".to_string(),
            TEST_APP_URL,
            GoogleEndpoints::with_base(provider_base),
        )))
        .with_slack(Arc::new(SlackClient::with_api_base(
            "slack-client".to_string(),
            "slack-secret".to_string(),
            TEST_APP_URL,
            provider_base,
        )))
}

/// Application state backed by the given database and provider mock
pub fn test_state(db: Arc<DatabaseConnection>, provider_base: &str) -> AppState {
    test_state_with_streams(
        db,
        provider_base,
        StreamContext::with_store(Arc::new(MemoryStreamStore::default())),
    )
}

pub fn test_state_with_streams(
    db: Arc<DatabaseConnection>,
    provider_base: &str,
    stream_context: StreamContext,
) -> AppState {
    test_state_with_invoker(db, provider_base, stream_context, Arc::new(EchoModelInvoker))
}

pub fn test_state_with_invoker(
    db: Arc<DatabaseConnection>,
    provider_base: &str,
    stream_context: StreamContext,
    invoker: Arc<dyn ModelInvoker>,
) -> AppState {
    AppState::from_parts(
        Arc::new(test_config()),
        db,
        mock_clients(provider_base),
        invoker,
        stream_context,
    )
}

/// `Authorization` value for a signed session
pub fn bearer(user_id: &str) -> String {
    format!(
        "Bearer {}",
        sign_session(TEST_SESSION_SECRET.as_bytes(), user_id)
    )
}

/// `name=value` pair of the session cookie a browser would carry
pub fn session_cookie(user_id: &str) -> String {
    format!(
        "{}={}",
        SESSION_COOKIE,
        sign_session(TEST_SESSION_SECRET.as_bytes(), user_id)
    )
}

/// Sends one request through a freshly built router.
pub async fn send(state: &AppState, request: Request<Body>) -> Response<Body> {
    create_app(state.clone())
        .oneshot(request)
        .await
        .expect("router is infallible")
}

pub async fn body_string(response: Response<Body>) -> String {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body collects");
    String::from_utf8(bytes.to_vec()).expect("utf-8 body")
}

pub async fn body_json(response: Response<Body>) -> serde_json::Value {
    serde_json::from_str(&body_string(response).await).expect("json body")
}

/// Turns `Set-Cookie` headers into a `Cookie` header for the next request.
pub fn cookies_from(headers: &HeaderMap) -> HeaderValue {
    let pairs: Vec<&str> = headers
        .get_all(header::SET_COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .filter_map(|v| v.split(';').next())
        .collect();
    HeaderValue::from_str(&pairs.join("; ")).expect("cookie header")
}

/// `data:` payloads of an SSE body, in order
pub fn sse_data(body: &str) -> Vec<String> {
    body.lines()
        .filter_map(|line| line.strip_prefix("data:"))
        .map(|data| data.trim_start().to_string())
        .collect()
}
