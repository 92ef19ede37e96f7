//! # Tests for Handlers
//!
//! Router-level checks that need no database rows.

use std::sync::Arc;

use axum::{
    body::{Body, to_bytes},
    http::{Request, StatusCode},
};
use sea_orm::{Database, DatabaseConnection};
use serde_json::Value;
use tower::ServiceExt;
use utoipa::OpenApi;

use crate::chat::{EchoModelInvoker, StreamContext};
use crate::config::AppConfig;
use crate::connectors::ProviderClients;
use crate::server::{ApiDoc, AppState, create_app};

fn state_with(db: DatabaseConnection) -> AppState {
    AppState::from_parts(
        Arc::new(AppConfig::default()),
        Arc::new(db),
        ProviderClients::new(),
        Arc::new(EchoModelInvoker),
        StreamContext::disabled(),
    )
}

async fn get(state: AppState, uri: &str) -> (StatusCode, Vec<u8>) {
    let response = create_app(state)
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, body.to_vec())
}

#[tokio::test]
async fn test_ping() {
    let (status, body) = get(state_with(DatabaseConnection::Disconnected), "/ping").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, b"pong");
}

#[tokio::test]
async fn test_healthz_reports_database_state() {
    let db = Database::connect("sqlite::memory:").await.unwrap();
    let (status, body) = get(state_with(db), "/healthz").await;
    assert_eq!(status, StatusCode::OK);
    let json: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["status"], "ok");
    assert_eq!(json["version"], env!("CARGO_PKG_VERSION"));

    let (status, body) = get(state_with(DatabaseConnection::Disconnected), "/healthz").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    let json: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["status"], "unavailable");
}

#[tokio::test]
async fn test_unconfigured_provider_is_a_bad_request() {
    let state = state_with(DatabaseConnection::Disconnected);
    let token = crate::auth::sign_session(state.config.session_key(), "user-1");
    let response = create_app(state)
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/connections/slack/initiate")
                .header("authorization", format!("Bearer {token}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let json: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["code"], "bad_request:connections");
}

#[tokio::test]
async fn test_openapi_document_is_served() {
    let (status, body) = get(state_with(DatabaseConnection::Disconnected), "/openapi.json").await;
    assert_eq!(status, StatusCode::OK);
    let json: Value = serde_json::from_slice(&body).unwrap();
    assert!(json["paths"]["/api/chat"].is_object());
    assert!(json["paths"]["/api/connections/{provider}"].is_object());
    assert!(json["components"]["securitySchemes"]["bearer_auth"].is_object());
}

#[test]
fn test_openapi_lists_every_route() {
    let doc = ApiDoc::openapi();
    let paths: Vec<&String> = doc.paths.paths.keys().collect();
    for expected in [
        "/api/connections",
        "/api/connections/initiate",
        "/api/connections/callback",
        "/api/connections/slack/initiate",
        "/api/connections/slack/callback",
        "/api/chat/{id}/stream",
        "/healthz",
        "/ping",
    ] {
        assert!(paths.iter().any(|p| p.as_str() == expected), "missing {expected}");
    }
}

#[test]
fn test_connection_error_mapping() {
    use crate::connection_manager::ConnectionError;
    use crate::connectors::{Provider, ProviderError};
    use crate::error::ApiError;

    let api: ApiError = ConnectionError::Provider(ProviderError::Network("reset".into())).into();
    assert_eq!(api.status, StatusCode::BAD_GATEWAY);
    assert_eq!(&*api.code, "provider:connections");

    let api: ApiError = ConnectionError::Refresh(ProviderError::Refresh {
        error_code: Some("invalid_grant".into()),
        details: "revoked".into(),
    })
    .into();
    assert_eq!(&*api.code, "provider:connections");

    let api: ApiError = ConnectionError::NotConnected(Provider::Slack).into();
    assert_eq!(&*api.code, "not_found:connections");
}
