//! Slack OAuth client
//!
//! Implements the Slack v2 OAuth flow for workspace connections. Slack bot
//! tokens do not expire and no refresh token is issued.

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use url::Url;

use super::provider::{Provider, ProviderFamily};
use super::trait_::{
    OAuthProvider, ProviderError, RefreshedToken, ScopeCheck, TokenGrant, body_snippet,
};

/// Slack OAuth scopes
pub const SLACK_SCOPES: &[&str] = &["channels:read", "channels:history"];

const SLACK_API_BASE: &str = "https://slack.com";

/// Callback path registered with Slack
pub const SLACK_CALLBACK_PATH: &str = "/api/connections/slack/callback";

#[derive(Debug, Deserialize)]
struct SlackTeam {
    id: String,
    #[allow(dead_code)]
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SlackAuthedUser {
    id: String,
}

/// Response of `oauth.v2.access`
#[derive(Debug, Deserialize)]
struct SlackOAuthTokenResponse {
    ok: bool,
    access_token: Option<String>,
    scope: Option<String>,
    team: Option<SlackTeam>,
    authed_user: Option<SlackAuthedUser>,
    error: Option<String>,
}

/// Generic `{ok, error}` envelope used by `auth.test` and `auth.revoke`
#[derive(Debug, Deserialize)]
struct SlackOkResponse {
    ok: bool,
    error: Option<String>,
}

/// OAuth client for Slack workspaces
pub struct SlackClient {
    client_id: String,
    client_secret: String,
    redirect_uri: String,
    api_base: String,
    http_client: Client,
}

impl SlackClient {
    pub fn new(client_id: String, client_secret: String, app_url: &str) -> Self {
        Self::with_api_base(client_id, client_secret, app_url, SLACK_API_BASE)
    }

    /// Create a client that talks to `api_base` instead of slack.com (tests).
    pub fn with_api_base(
        client_id: String,
        client_secret: String,
        app_url: &str,
        api_base: &str,
    ) -> Self {
        Self {
            client_id,
            client_secret,
            redirect_uri: format!("{}{}", app_url.trim_end_matches('/'), SLACK_CALLBACK_PATH),
            api_base: api_base.trim_end_matches('/').to_string(),
            http_client: Client::builder()
                .timeout(std::time::Duration::from_secs(30))
                .build()
                .unwrap_or_else(|_| Client::new()),
        }
    }

    fn api_url(&self, method: &str) -> String {
        format!("{}/api/{}", self.api_base, method)
    }
}

#[async_trait]
impl OAuthProvider for SlackClient {
    fn family(&self) -> ProviderFamily {
        ProviderFamily::Slack
    }

    fn requested_scopes(&self, provider: Provider) -> Vec<String> {
        match provider {
            Provider::Slack => SLACK_SCOPES.iter().map(|s| s.to_string()).collect(),
            _ => Vec::new(),
        }
    }

    fn build_auth_url(&self, provider: Provider, state: &str) -> Result<Url, ProviderError> {
        if provider != Provider::Slack {
            return Err(ProviderError::Configuration(format!(
                "{} is not served by the Slack client",
                provider
            )));
        }

        let mut url = Url::parse(&format!("{}/oauth/v2/authorize", self.api_base))
            .map_err(|e| ProviderError::Configuration(format!("invalid auth URL: {}", e)))?;

        url.query_pairs_mut()
            .append_pair("client_id", &self.client_id)
            .append_pair("scope", &SLACK_SCOPES.join(","))
            .append_pair("redirect_uri", &self.redirect_uri)
            .append_pair("state", state);

        Ok(url)
    }

    async fn exchange_code_for_tokens(&self, code: &str) -> Result<TokenGrant, ProviderError> {
        let response = self
            .http_client
            .post(self.api_url("oauth.v2.access"))
            .form(&[
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
                ("code", code),
                ("redirect_uri", self.redirect_uri.as_str()),
            ])
            .send()
            .await
            .map_err(|e| ProviderError::Network(format!("oauth.v2.access failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::Exchange(format!(
                "Slack API error {}: {}",
                status,
                body_snippet(&body)
            )));
        }

        let data: SlackOAuthTokenResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::InvalidResponse(format!("oauth.v2.access: {}", e)))?;

        if !data.ok {
            return Err(ProviderError::Exchange(format!(
                "Slack OAuth error: {}",
                data.error.as_deref().unwrap_or("Unknown error")
            )));
        }

        let access_token = data
            .access_token
            .filter(|t| !t.is_empty())
            .ok_or(ProviderError::MissingAccessToken)?;

        let team = data
            .team
            .ok_or_else(|| ProviderError::InvalidResponse("missing team".to_string()))?;
        let authed_user = data
            .authed_user
            .ok_or_else(|| ProviderError::InvalidResponse("missing authed_user".to_string()))?;

        Ok(TokenGrant {
            access_token,
            refresh_token: None,
            expires_at: None,
            scope: data.scope.unwrap_or_default(),
            provider_account_id: authed_user.id,
            provider_org_id: Some(team.id),
        })
    }

    fn verify_scopes(&self, requested: &[String], granted: &str) -> ScopeCheck {
        ScopeCheck::compare(requested, granted.split(','))
    }

    async fn try_revoke_token(&self, token: &str) -> Result<(), ProviderError> {
        let response = self
            .http_client
            .post(self.api_url("auth.revoke"))
            .bearer_auth(token)
            .header("Content-Type", "application/x-www-form-urlencoded")
            .send()
            .await
            .map_err(|e| ProviderError::Network(format!("auth.revoke failed: {}", e)))?;

        let body: SlackOkResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::InvalidResponse(format!("auth.revoke: {}", e)))?;

        if !body.ok {
            return Err(ProviderError::Revoke(
                body.error.unwrap_or_else(|| "unknown_error".to_string()),
            ));
        }

        Ok(())
    }

    async fn refresh_access_token(
        &self,
        _refresh_token: &str,
    ) -> Result<RefreshedToken, ProviderError> {
        Err(ProviderError::RefreshUnsupported("slack"))
    }
}
