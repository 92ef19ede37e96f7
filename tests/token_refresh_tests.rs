//! Token refresh and access-token retrieval against a mocked Google token
//! endpoint.

use std::sync::Arc;

use chatlink::auth::UserId;
use chatlink::connection_manager::{CallbackParams, ConnectionError, ConnectionManager};
use chatlink::connectors::{Provider, ProviderFamily};
use chatlink::crypto::TokenCipher;
use chatlink::models::connection::ConnectionStatus;
use chatlink::oauth_state::{MemoryTransactionState, OAUTH_STATE_KEY, TransactionState};
use chatlink::repositories::{ConnectionRepository, NewConnection};
use chrono::{Duration, Utc};
use serde_json::json;
use wiremock::matchers::{body_string_contains, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[path = "test_utils/mod.rs"]
mod test_utils;

use test_utils::{TEST_ENCRYPTION_KEY, mock_clients};

struct Fixture {
    server: MockServer,
    manager: ConnectionManager,
    repo: ConnectionRepository,
    cipher: TokenCipher,
    user: UserId,
}

async fn fixture() -> Fixture {
    let server = MockServer::start().await;
    let db = test_utils::setup_test_db_arc()
        .await
        .expect("Failed to set up test database");
    let repo = ConnectionRepository::new(db);
    let cipher = TokenCipher::new(Some(TEST_ENCRYPTION_KEY.to_string()));
    let manager = ConnectionManager::new(repo.clone(), cipher.clone(), mock_clients(&server.uri()));
    Fixture {
        server,
        manager,
        repo,
        cipher,
        user: UserId("user-1".to_string()),
    }
}

/// Stores an active Gmail connection expiring `expires_in` from now.
async fn seed_gmail(f: &Fixture, expires_in: Duration, with_refresh: bool) {
    f.repo
        .upsert(NewConnection {
            user_id: f.user.to_string(),
            provider: Provider::Gmail,
            provider_account_id: "person@example.com".to_string(),
            provider_org_id: None,
            access_token: f.cipher.encrypt("old-access").unwrap(),
            refresh_token: with_refresh.then(|| f.cipher.encrypt("old-refresh").unwrap()),
            access_token_expires_at: Some(Utc::now() + expires_in),
            scope: "https://www.googleapis.com/auth/gmail.readonly".to_string(),
        })
        .await
        .expect("seed connection");
}

#[tokio::test]
async fn test_fresh_token_is_returned_without_refresh() {
    let f = fixture().await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&f.server)
        .await;
    seed_gmail(&f, Duration::hours(1), true).await;

    let token = f.manager.access_token(&f.user, Provider::Gmail).await.unwrap();
    assert_eq!(token, "old-access");

    let row = f.repo.find(f.user.as_str(), Provider::Gmail).await.unwrap().unwrap();
    assert!(row.last_synced_at.is_some());
}

#[tokio::test]
async fn test_expiring_token_is_refreshed_and_rotated() {
    let f = fixture().await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .and(body_string_contains("grant_type=refresh_token"))
        .and(body_string_contains("refresh_token=old-refresh"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "new-access",
            "refresh_token": "new-refresh",
            "expires_in": 3600
        })))
        .expect(1)
        .mount(&f.server)
        .await;
    seed_gmail(&f, Duration::minutes(2), true).await;

    let token = f.manager.access_token(&f.user, Provider::Gmail).await.unwrap();
    assert_eq!(token, "new-access");

    let row = f.repo.find(f.user.as_str(), Provider::Gmail).await.unwrap().unwrap();
    assert_eq!(f.cipher.decrypt(&row.access_token).unwrap(), "new-access");
    assert_eq!(
        f.cipher.decrypt(row.refresh_token.as_deref().unwrap()).unwrap(),
        "new-refresh"
    );
    let expires_at = row.access_token_expires_at.unwrap();
    assert!(expires_at.with_timezone(&Utc) > Utc::now() + Duration::minutes(50));
}

#[tokio::test]
async fn test_refresh_keeps_refresh_token_when_not_rotated() {
    let f = fixture().await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "new-access",
            "expires_in": 3600
        })))
        .mount(&f.server)
        .await;
    seed_gmail(&f, Duration::minutes(-10), true).await;

    f.manager.access_token(&f.user, Provider::Gmail).await.unwrap();

    let row = f.repo.find(f.user.as_str(), Provider::Gmail).await.unwrap().unwrap();
    assert_eq!(
        f.cipher.decrypt(row.refresh_token.as_deref().unwrap()).unwrap(),
        "old-refresh"
    );
}

#[tokio::test]
async fn test_invalid_grant_marks_connection_as_error() {
    let f = fixture().await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "error": "invalid_grant",
            "error_description": "Token has been expired or revoked."
        })))
        .mount(&f.server)
        .await;
    seed_gmail(&f, Duration::minutes(1), true).await;

    let err = f.manager.access_token(&f.user, Provider::Gmail).await.unwrap_err();
    assert!(matches!(err, ConnectionError::Refresh(_)));
    assert_eq!(err.code(), "refresh_failed");

    let row = f.repo.find(f.user.as_str(), Provider::Gmail).await.unwrap().unwrap();
    assert_eq!(row.status, ConnectionStatus::Error);
    assert!(!f.manager.status(&f.user, Provider::Gmail).await.unwrap().connected);

    // An errored connection no longer hands out tokens
    let err = f.manager.access_token(&f.user, Provider::Gmail).await.unwrap_err();
    assert!(matches!(err, ConnectionError::NotConnected(Provider::Gmail)));
}

#[tokio::test]
async fn test_transient_refresh_failure_keeps_connection_active() {
    let f = fixture().await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(ResponseTemplate::new(503).set_body_string("unavailable"))
        .mount(&f.server)
        .await;
    seed_gmail(&f, Duration::minutes(1), true).await;

    assert!(f.manager.access_token(&f.user, Provider::Gmail).await.is_err());
    let row = f.repo.find(f.user.as_str(), Provider::Gmail).await.unwrap().unwrap();
    assert_eq!(row.status, ConnectionStatus::Active);
}

#[tokio::test]
async fn test_expired_token_without_refresh_token_is_returned_as_is() {
    let f = fixture().await;
    seed_gmail(&f, Duration::minutes(-5), false).await;

    let token = f.manager.access_token(&f.user, Provider::Gmail).await.unwrap();
    assert_eq!(token, "old-access");
}

#[tokio::test]
async fn test_concurrent_callers_share_one_refresh() {
    let f = Arc::new(fixture().await);
    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"access_token": "new-access", "expires_in": 3600}))
                .set_delay(std::time::Duration::from_millis(100)),
        )
        .expect(1)
        .mount(&f.server)
        .await;
    seed_gmail(&f, Duration::minutes(1), true).await;

    let tasks: Vec<_> = (0..4)
        .map(|_| {
            let f = f.clone();
            tokio::spawn(async move { f.manager.access_token(&f.user, Provider::Gmail).await })
        })
        .collect();

    for task in tasks {
        assert_eq!(task.await.unwrap().unwrap(), "new-access");
    }
}

#[tokio::test]
async fn test_refresh_expiring_soon_sweeps_due_connections() {
    let f = fixture().await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "swept-access",
            "expires_in": 3600
        })))
        .expect(1)
        .mount(&f.server)
        .await;
    seed_gmail(&f, Duration::minutes(3), true).await;

    assert_eq!(f.manager.refresh_expiring_soon().await.unwrap(), 1);
    // Nothing is due any more
    assert_eq!(f.manager.refresh_expiring_soon().await.unwrap(), 0);
}

#[tokio::test]
async fn test_access_token_requires_connection() {
    let f = fixture().await;
    let err = f.manager.access_token(&f.user, Provider::Slack).await.unwrap_err();
    assert_eq!(err.code(), "not_connected");
}

#[tokio::test]
async fn test_manager_callback_consumes_transaction() {
    let f = fixture().await;
    let mut txn = MemoryTransactionState::new();

    let url = f
        .manager
        .initiate(&f.user, Provider::GoogleCalendar, ProviderFamily::Google, &mut txn)
        .unwrap();
    assert!(url.as_str().contains("calendar.readonly"));
    let state = txn.get(OAUTH_STATE_KEY).expect("state recorded");

    let err = f
        .manager
        .complete_callback(
            &f.user,
            CallbackParams {
                code: None,
                state: Some(state),
                error: None,
            },
            &mut txn,
            ProviderFamily::Google,
        )
        .await
        .unwrap_err();
    assert_eq!(err.code(), "missing_parameters");
    assert!(txn.get(OAUTH_STATE_KEY).is_none());
}

#[tokio::test]
async fn test_initiate_rejects_wrong_family() {
    let f = fixture().await;
    let mut txn = MemoryTransactionState::new();
    let err = f
        .manager
        .initiate(&f.user, Provider::Slack, ProviderFamily::Google, &mut txn)
        .unwrap_err();
    assert_eq!(err.code(), "invalid_provider");
    assert!(txn.get(OAUTH_STATE_KEY).is_none());
}
