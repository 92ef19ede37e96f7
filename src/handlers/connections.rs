//! # Connection Handlers
//!
//! OAuth initiation and callbacks, status and disconnect. Callbacks answer
//! with a redirect to the settings page carrying a short outcome code;
//! everything else answers JSON.

use std::collections::BTreeMap;

use axum::{
    extract::{Path, Query, State, rejection::JsonRejection},
    response::{IntoResponse, Json, Redirect, Response},
};
use axum_extra::{TypedHeader, headers::Cookie};
use serde::{Deserialize, Serialize};
use url::form_urlencoded::byte_serialize;
use utoipa::ToSchema;

use crate::auth::UserId;
use crate::connection_manager::{CallbackParams, ConnectionError};
use crate::connectors::{Provider, ProviderFamily};
use crate::error::{ApiError, ErrorType, Surface};
use crate::oauth_state::CookieTransactionState;
use crate::repositories::ProviderStatus;
use crate::server::AppState;

/// Body of `POST /api/connections/initiate`
#[derive(Debug, Deserialize, ToSchema)]
pub struct InitiateRequest {
    /// One of `gmail`, `google-calendar`, `google-drive`
    pub provider: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct InitiateResponse {
    /// Consent URL to send the browser to
    pub auth_url: String,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct DisconnectResponse {
    pub success: bool,
    /// Whether the provider confirmed the token revocation
    pub revoked_at_provider: bool,
}

impl From<ConnectionError> for ApiError {
    fn from(error: ConnectionError) -> Self {
        match error {
            ConnectionError::InvalidProvider(_) | ConnectionError::NotConfigured(_) => {
                ApiError::bad_request(Surface::Connections).with_cause(error.to_string())
            }
            ConnectionError::NotConnected(_) => ApiError::not_found(Surface::Connections),
            ConnectionError::Store(source) => ApiError::database(source),
            ConnectionError::Provider(_) | ConnectionError::Refresh(_) => {
                tracing::warn!(error = %error, "Provider call failed");
                ApiError::new(ErrorType::Provider, Surface::Connections)
            }
            other => {
                tracing::error!(error = %other, "Connection request failed");
                ApiError::offline(Surface::Connections)
            }
        }
    }
}

fn parse_provider(raw: &str) -> Result<Provider, ApiError> {
    raw.parse::<Provider>().map_err(|e| {
        ApiError::bad_request(Surface::Connections).with_cause(e.to_string())
    })
}

fn require_user(user: Option<UserId>) -> Result<UserId, ApiError> {
    user.ok_or_else(|| ApiError::unauthorized(Surface::Connections))
}

fn transaction_state(state: &AppState, cookies: Option<&Cookie>) -> CookieTransactionState {
    CookieTransactionState::from_cookies(
        cookies,
        state.config.session_key(),
        state.config.secure_cookies(),
    )
}

fn initiate_for(
    state: &AppState,
    user: &UserId,
    cookies: Option<&Cookie>,
    provider: Provider,
    family: ProviderFamily,
) -> Result<Response, ApiError> {
    let mut txn = transaction_state(state, cookies);
    let auth_url = state.connections.initiate(user, provider, family, &mut txn)?;

    let response = InitiateResponse {
        auth_url: auth_url.to_string(),
    };
    Ok((txn.response_headers(), Json(response)).into_response())
}

/// Start a Google authorization
///
/// Records the pending transaction in signed cookies and returns the consent URL.
#[utoipa::path(
    post,
    path = "/api/connections/initiate",
    request_body = InitiateRequest,
    security(("bearer_auth" = [])),
    responses(
        (status = 200, description = "Consent URL generated", body = InitiateResponse),
        (status = 400, description = "Unknown or unsupported provider", body = ApiError),
        (status = 401, description = "Missing or invalid session", body = ApiError)
    ),
    tag = "connections"
)]
pub async fn initiate(
    State(state): State<AppState>,
    user: Option<UserId>,
    cookies: Option<TypedHeader<Cookie>>,
    body: Result<Json<InitiateRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let user = require_user(user)?;
    let Json(body) = body.map_err(ApiError::from)?;
    let provider = parse_provider(body.provider.as_deref().unwrap_or_default())?;
    if provider.family() != ProviderFamily::Google {
        return Err(ApiError::bad_request(Surface::Connections)
            .with_cause("Must be one of: gmail, google-calendar, google-drive"));
    }
    initiate_for(&state, &user, cookies.as_deref(), provider, ProviderFamily::Google)
}

/// Start a Slack authorization
#[utoipa::path(
    post,
    path = "/api/connections/slack/initiate",
    security(("bearer_auth" = [])),
    responses(
        (status = 200, description = "Consent URL generated", body = InitiateResponse),
        (status = 401, description = "Missing or invalid session", body = ApiError)
    ),
    tag = "connections"
)]
pub async fn initiate_slack(
    State(state): State<AppState>,
    user: Option<UserId>,
    cookies: Option<TypedHeader<Cookie>>,
) -> Result<Response, ApiError> {
    let user = require_user(user)?;
    initiate_for(&state, &user, cookies.as_deref(), Provider::Slack, ProviderFamily::Slack)
}

fn settings_redirect(state: &AppState, outcome: &str, value: &str) -> String {
    let encoded: String = byte_serialize(value.as_bytes()).collect();
    format!("{}?{}={}#connections", state.config.settings_url(), outcome, encoded)
}

async fn callback_for(
    state: &AppState,
    user: Option<UserId>,
    cookies: Option<&Cookie>,
    params: CallbackParams,
    family: ProviderFamily,
) -> Response {
    let Some(user) = user else {
        // Provider errors and malformed callbacks are reported before asking for a login
        let url = if let Some(denied) = params.error.as_deref().filter(|e| !e.is_empty()) {
            settings_redirect(state, "error", denied)
        } else if params.code.is_none() || params.state.is_none() {
            settings_redirect(state, "error", "missing_parameters")
        } else {
            format!("{}/auth/login", state.config.app_url.trim_end_matches('/'))
        };
        return Redirect::to(&url).into_response();
    };

    let mut txn = transaction_state(state, cookies);
    let url = match state
        .connections
        .complete_callback(&user, params, &mut txn, family)
        .await
    {
        Ok(_) => settings_redirect(state, "success", "connected"),
        Err(error) => {
            tracing::warn!(?family, user_id = %user, code = error.code(), error = %error, "OAuth callback failed");
            settings_redirect(state, "error", error.code())
        }
    };

    (txn.response_headers(), Redirect::to(&url)).into_response()
}

/// Google OAuth callback
///
/// Always answers with a 303 redirect to the settings page.
#[utoipa::path(
    get,
    path = "/api/connections/callback",
    params(CallbackParams),
    responses(
        (status = 303, description = "Redirect to the settings page with the outcome")
    ),
    tag = "connections"
)]
pub async fn callback(
    State(state): State<AppState>,
    user: Option<UserId>,
    cookies: Option<TypedHeader<Cookie>>,
    Query(params): Query<CallbackParams>,
) -> Response {
    callback_for(&state, user, cookies.as_deref(), params, ProviderFamily::Google).await
}

/// Slack OAuth callback
#[utoipa::path(
    get,
    path = "/api/connections/slack/callback",
    params(CallbackParams),
    responses(
        (status = 303, description = "Redirect to the settings page with the outcome")
    ),
    tag = "connections"
)]
pub async fn slack_callback(
    State(state): State<AppState>,
    user: Option<UserId>,
    cookies: Option<TypedHeader<Cookie>>,
    Query(params): Query<CallbackParams>,
) -> Response {
    callback_for(&state, user, cookies.as_deref(), params, ProviderFamily::Slack).await
}

/// Connection status for every provider
#[utoipa::path(
    get,
    path = "/api/connections",
    security(("bearer_auth" = [])),
    responses(
        (status = 200, description = "Status keyed by provider", body = BTreeMap<String, ProviderStatus>),
        (status = 401, description = "Missing or invalid session", body = ApiError)
    ),
    tag = "connections"
)]
pub async fn list_connections(
    State(state): State<AppState>,
    user: Option<UserId>,
) -> Result<Json<BTreeMap<Provider, ProviderStatus>>, ApiError> {
    let user = require_user(user)?;
    Ok(Json(state.connections.statuses(&user).await))
}

/// Connection status for one provider
#[utoipa::path(
    get,
    path = "/api/connections/{provider}",
    security(("bearer_auth" = [])),
    params(
        ("provider" = String, Path, description = "Provider identifier, e.g. 'gmail' or 'slack'")
    ),
    responses(
        (status = 200, description = "Connection status", body = ProviderStatus),
        (status = 400, description = "Unknown provider", body = ApiError),
        (status = 401, description = "Missing or invalid session", body = ApiError)
    ),
    tag = "connections"
)]
pub async fn get_connection(
    State(state): State<AppState>,
    user: Option<UserId>,
    Path(provider): Path<String>,
) -> Result<Json<ProviderStatus>, ApiError> {
    let user = require_user(user)?;
    let provider = parse_provider(&provider)?;
    Ok(Json(state.connections.status(&user, provider).await?))
}

/// Disconnect a provider
///
/// Revokes the token at the provider when possible and soft-deletes the
/// connection. Repeating the call is harmless.
#[utoipa::path(
    delete,
    path = "/api/connections/{provider}",
    security(("bearer_auth" = [])),
    params(
        ("provider" = String, Path, description = "Provider identifier, e.g. 'gmail' or 'slack'")
    ),
    responses(
        (status = 200, description = "Connection revoked", body = DisconnectResponse),
        (status = 400, description = "Unknown provider", body = ApiError),
        (status = 401, description = "Missing or invalid session", body = ApiError)
    ),
    tag = "connections"
)]
pub async fn delete_connection(
    State(state): State<AppState>,
    user: Option<UserId>,
    Path(provider): Path<String>,
) -> Result<Json<DisconnectResponse>, ApiError> {
    let user = require_user(user)?;
    let provider = parse_provider(&provider)?;
    let outcome = state.connections.disconnect(&user, provider).await?;
    Ok(Json(DisconnectResponse {
        success: true,
        revoked_at_provider: outcome.revoked_at_provider,
    }))
}
