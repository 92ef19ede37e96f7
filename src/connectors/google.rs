//! Google OAuth client
//!
//! Serves Gmail, Google Calendar and Google Drive. All three share one OAuth
//! client and differ only in the read-only scope requested.

use async_trait::async_trait;
use chrono::{Duration, Utc};
use reqwest::Client;
use serde::Deserialize;
use url::Url;

use super::provider::{Provider, ProviderFamily};
use super::trait_::{
    OAuthProvider, ProviderError, RefreshedToken, ScopeCheck, TokenGrant, body_snippet,
};

/// Identity scopes requested alongside every provider scope
pub const DEFAULT_GOOGLE_SCOPES: &[&str] = &["openid", "email", "profile"];

const GMAIL_SCOPES: &[&str] = &["https://www.googleapis.com/auth/gmail.readonly"];
const CALENDAR_SCOPES: &[&str] = &["https://www.googleapis.com/auth/calendar.readonly"];
const DRIVE_SCOPES: &[&str] = &["https://www.googleapis.com/auth/drive.readonly"];

/// Google OAuth endpoints
const GOOGLE_AUTH_URL: &str = "https://accounts.google.com/o/oauth2/v2/auth";
const GOOGLE_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
const GOOGLE_USERINFO_URL: &str = "https://www.googleapis.com/oauth2/v2/userinfo";
const GOOGLE_REVOKE_URL: &str = "https://oauth2.googleapis.com/revoke";

/// Callback path registered with Google
pub const GOOGLE_CALLBACK_PATH: &str = "/api/connections/callback";

/// Provider-specific scopes for a Google provider
pub fn google_provider_scopes(provider: Provider) -> &'static [&'static str] {
    match provider {
        Provider::Gmail => GMAIL_SCOPES,
        Provider::GoogleCalendar => CALENDAR_SCOPES,
        Provider::GoogleDrive => DRIVE_SCOPES,
        Provider::Slack => &[],
    }
}

/// Google OAuth endpoints (overridable for tests)
#[derive(Debug, Clone)]
pub struct GoogleEndpoints {
    pub auth_url: String,
    pub token_url: String,
    pub userinfo_url: String,
    pub revoke_url: String,
}

impl Default for GoogleEndpoints {
    fn default() -> Self {
        Self {
            auth_url: GOOGLE_AUTH_URL.to_string(),
            token_url: GOOGLE_TOKEN_URL.to_string(),
            userinfo_url: GOOGLE_USERINFO_URL.to_string(),
            revoke_url: GOOGLE_REVOKE_URL.to_string(),
        }
    }
}

impl GoogleEndpoints {
    /// Point every endpoint at a single base URL (wiremock).
    pub fn with_base(base: &str) -> Self {
        let base = base.trim_end_matches('/');
        Self {
            auth_url: format!("{base}/o/oauth2/v2/auth"),
            token_url: format!("{base}/token"),
            userinfo_url: format!("{base}/oauth2/v2/userinfo"),
            revoke_url: format!("{base}/revoke"),
        }
    }
}

/// Google OAuth token response
#[derive(Debug, Deserialize)]
struct GoogleTokenResponse {
    access_token: Option<String>,
    expires_in: Option<i64>,
    refresh_token: Option<String>,
    scope: Option<String>,
}

/// Google OAuth error body
#[derive(Debug, Deserialize)]
struct GoogleErrorResponse {
    error: Option<String>,
    error_description: Option<String>,
}

/// Google userinfo response
#[derive(Debug, Deserialize)]
struct GoogleUserinfo {
    id: Option<String>,
    email: Option<String>,
}

/// OAuth client for the Google provider family
pub struct GoogleClient {
    client_id: String,
    client_secret: String,
    redirect_uri: String,
    endpoints: GoogleEndpoints,
    http_client: Client,
}

impl GoogleClient {
    fn build_http_client() -> Client {
        Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .unwrap_or_else(|_| Client::new())
    }

    /// Create a Google client whose redirect URI is derived from `app_url`.
    pub fn new(client_id: String, client_secret: String, app_url: &str) -> Self {
        Self::with_endpoints(client_id, client_secret, app_url, GoogleEndpoints::default())
    }

    pub fn with_endpoints(
        client_id: String,
        client_secret: String,
        app_url: &str,
        endpoints: GoogleEndpoints,
    ) -> Self {
        Self {
            client_id,
            client_secret,
            redirect_uri: format!("{}{}", app_url.trim_end_matches('/'), GOOGLE_CALLBACK_PATH),
            endpoints,
            http_client: Self::build_http_client(),
        }
    }

    /// Look up the account behind an access token.
    async fn get_user_info(&self, access_token: &str) -> Result<(String, String), ProviderError> {
        let response = self
            .http_client
            .get(&self.endpoints.userinfo_url)
            .bearer_auth(access_token)
            .send()
            .await
            .map_err(|e| ProviderError::Network(format!("userinfo request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::UserInfo(format!(
                "status {}: {}",
                status,
                body_snippet(&body)
            )));
        }

        let userinfo: GoogleUserinfo = response
            .json()
            .await
            .map_err(|e| ProviderError::InvalidResponse(format!("userinfo: {}", e)))?;

        match (userinfo.email, userinfo.id) {
            (Some(email), Some(id)) if !email.is_empty() => Ok((email, id)),
            _ => Err(ProviderError::UserInfo(
                "failed to get user email from Google".to_string(),
            )),
        }
    }

    async fn post_token_form(
        &self,
        params: Vec<(&str, &str)>,
    ) -> Result<GoogleTokenResponse, (Option<String>, String)> {
        let response = self
            .http_client
            .post(&self.endpoints.token_url)
            .header("Accept", "application/json")
            .form(&params)
            .send()
            .await
            .map_err(|e| (None, format!("token request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let parsed = serde_json::from_str::<GoogleErrorResponse>(&body).ok();
            let code = parsed.as_ref().and_then(|p| p.error.clone());
            let description = parsed
                .and_then(|p| p.error_description)
                .unwrap_or_else(|| body_snippet(&body));
            return Err((code, format!("status {}: {}", status, description)));
        }

        response
            .json::<GoogleTokenResponse>()
            .await
            .map_err(|e| (None, format!("failed to parse token response: {}", e)))
    }
}

#[async_trait]
impl OAuthProvider for GoogleClient {
    fn family(&self) -> ProviderFamily {
        ProviderFamily::Google
    }

    fn requested_scopes(&self, provider: Provider) -> Vec<String> {
        google_provider_scopes(provider)
            .iter()
            .map(|s| s.to_string())
            .collect()
    }

    fn build_auth_url(&self, provider: Provider, state: &str) -> Result<Url, ProviderError> {
        if provider.family() != ProviderFamily::Google {
            return Err(ProviderError::Configuration(format!(
                "{} is not a Google provider",
                provider
            )));
        }

        let mut url = Url::parse(&self.endpoints.auth_url)
            .map_err(|e| ProviderError::Configuration(format!("invalid auth URL: {}", e)))?;

        let scopes: Vec<&str> = DEFAULT_GOOGLE_SCOPES
            .iter()
            .chain(google_provider_scopes(provider))
            .copied()
            .collect();

        url.query_pairs_mut()
            .append_pair("client_id", &self.client_id)
            .append_pair("redirect_uri", &self.redirect_uri)
            .append_pair("response_type", "code")
            .append_pair("scope", &scopes.join(" "))
            .append_pair("access_type", "offline")
            .append_pair("prompt", "consent")
            .append_pair("state", state);

        Ok(url)
    }

    async fn exchange_code_for_tokens(&self, code: &str) -> Result<TokenGrant, ProviderError> {
        let token = self
            .post_token_form(vec![
                ("code", code),
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
                ("redirect_uri", self.redirect_uri.as_str()),
                ("grant_type", "authorization_code"),
            ])
            .await
            .map_err(|(_, details)| ProviderError::Exchange(details))?;

        let access_token = token
            .access_token
            .filter(|t| !t.is_empty())
            .ok_or(ProviderError::MissingAccessToken)?;

        Ok(TokenGrant {
            access_token,
            refresh_token: token.refresh_token.filter(|t| !t.is_empty()),
            expires_at: token
                .expires_in
                .map(|secs| Utc::now() + Duration::seconds(secs)),
            scope: token.scope.unwrap_or_default(),
            provider_account_id: String::new(),
            provider_org_id: None,
        })
    }

    async fn resolve_identity(&self, mut grant: TokenGrant) -> Result<TokenGrant, ProviderError> {
        let (email, _id) = self.get_user_info(&grant.access_token).await?;
        grant.provider_account_id = email;
        Ok(grant)
    }

    fn verify_scopes(&self, requested: &[String], granted: &str) -> ScopeCheck {
        ScopeCheck::compare(requested, granted.split_whitespace())
    }

    async fn try_revoke_token(&self, token: &str) -> Result<(), ProviderError> {
        let response = self
            .http_client
            .post(&self.endpoints.revoke_url)
            .form(&[("token", token)])
            .send()
            .await
            .map_err(|e| ProviderError::Network(format!("revoke request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::Revoke(format!(
                "status {}: {}",
                status,
                body_snippet(&body)
            )));
        }

        Ok(())
    }

    async fn refresh_access_token(
        &self,
        refresh_token: &str,
    ) -> Result<RefreshedToken, ProviderError> {
        let token = self
            .post_token_form(vec![
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
                ("refresh_token", refresh_token),
                ("grant_type", "refresh_token"),
            ])
            .await
            .map_err(|(error_code, details)| ProviderError::Refresh {
                error_code,
                details,
            })?;

        let access_token = token
            .access_token
            .filter(|t| !t.is_empty())
            .ok_or(ProviderError::MissingAccessToken)?;

        Ok(RefreshedToken {
            access_token,
            refresh_token: token.refresh_token.filter(|t| !t.is_empty()),
            expires_at: token
                .expires_in
                .map(|secs| Utc::now() + Duration::seconds(secs)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;
    use wiremock::matchers::{body_string_contains, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client_for(server: &MockServer) -> GoogleClient {
        GoogleClient::with_endpoints(
            "test-client-id".to_string(),
            "test-client-secret".to_string(),
            "https://app.example.com/",
            GoogleEndpoints::with_base(&server.uri()),
        )
    }

    #[test]
    fn test_build_auth_url() {
        let client = GoogleClient::new(
            "test-client-id".to_string(),
            "test-client-secret".to_string(),
            "https://app.example.com",
        );

        let url = client.build_auth_url(Provider::Gmail, "test_state").unwrap();
        assert_eq!(url.host_str().unwrap(), "accounts.google.com");
        assert_eq!(url.path(), "/o/oauth2/v2/auth");

        let query: HashMap<_, _> = url.query_pairs().collect();
        assert_eq!(query.get("client_id").unwrap(), "test-client-id");
        assert_eq!(
            query.get("redirect_uri").unwrap(),
            "https://app.example.com/api/connections/callback"
        );
        assert_eq!(
            query.get("scope").unwrap(),
            "openid email profile https://www.googleapis.com/auth/gmail.readonly"
        );
        assert_eq!(query.get("access_type").unwrap(), "offline");
        assert_eq!(query.get("prompt").unwrap(), "consent");
        assert_eq!(query.get("response_type").unwrap(), "code");
        assert_eq!(query.get("state").unwrap(), "test_state");
    }

    #[test]
    fn test_requested_scopes_exclude_identity() {
        let client = GoogleClient::new("id".into(), "secret".into(), "http://localhost:3000");
        assert_eq!(
            client.requested_scopes(Provider::GoogleDrive),
            vec!["https://www.googleapis.com/auth/drive.readonly".to_string()]
        );
        assert!(client.build_auth_url(Provider::Slack, "s").is_err());
    }

    #[test]
    fn test_verify_scopes_space_delimited() {
        let client = GoogleClient::new("id".into(), "secret".into(), "http://localhost:3000");
        let requested = client.requested_scopes(Provider::GoogleCalendar);

        let granted = "openid https://www.googleapis.com/auth/calendar.readonly email";
        assert!(client.verify_scopes(&requested, granted).valid);

        let check = client.verify_scopes(&requested, "openid email profile");
        assert!(!check.valid);
        assert_eq!(check.missing, requested);
    }

    #[tokio::test]
    async fn test_exchange_code_for_tokens() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .and(body_string_contains("grant_type=authorization_code"))
            .and(body_string_contains("code=auth-code"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "ya29.access",
                "refresh_token": "1//refresh",
                "expires_in": 3599,
                "scope": "openid https://www.googleapis.com/auth/gmail.readonly",
                "token_type": "Bearer"
            })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/oauth2/v2/userinfo"))
            .and(header("authorization", "Bearer ya29.access"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "1234",
                "email": "user@example.com"
            })))
            .mount(&server)
            .await;

        let client = client_for(&server);
        let grant = client.exchange_code_for_tokens("auth-code").await.unwrap();
        assert_eq!(grant.access_token, "ya29.access");
        assert_eq!(grant.refresh_token.as_deref(), Some("1//refresh"));
        assert!(grant.provider_account_id.is_empty());

        let grant = client.resolve_identity(grant).await.unwrap();
        assert_eq!(grant.provider_account_id, "user@example.com");
        assert!(grant.provider_org_id.is_none());
        assert!(grant.expires_at.unwrap() > Utc::now() + Duration::minutes(55));
    }

    #[tokio::test]
    async fn test_reused_code_fails() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "error": "invalid_grant",
                "error_description": "Bad Request"
            })))
            .mount(&server)
            .await;

        let err = client_for(&server)
            .exchange_code_for_tokens("used-code")
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::Exchange(_)));
    }

    #[tokio::test]
    async fn test_missing_access_token() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "expires_in": 3599
            })))
            .mount(&server)
            .await;

        let err = client_for(&server)
            .exchange_code_for_tokens("code")
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::MissingAccessToken));
    }

    #[tokio::test]
    async fn test_refresh_classifies_invalid_grant() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .and(body_string_contains("grant_type=refresh_token"))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "error": "invalid_grant",
                "error_description": "Token has been expired or revoked."
            })))
            .mount(&server)
            .await;

        let err = client_for(&server)
            .refresh_access_token("stale")
            .await
            .unwrap_err();
        assert!(err.is_permanent());
    }

    #[tokio::test]
    async fn test_refresh_without_rotation() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "ya29.new",
                "expires_in": 3600
            })))
            .mount(&server)
            .await;

        let refreshed = client_for(&server)
            .refresh_access_token("1//refresh")
            .await
            .unwrap();
        assert_eq!(refreshed.access_token, "ya29.new");
        assert!(refreshed.refresh_token.is_none());
    }

    #[tokio::test]
    async fn test_revoke_is_best_effort() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/revoke"))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "error": "invalid_token"
            })))
            .expect(1)
            .mount(&server)
            .await;

        assert!(!client_for(&server).revoke_token("already-invalid").await);
    }
}
