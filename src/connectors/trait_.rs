//! OAuth provider trait definition
//!
//! Defines the capability interface every provider client implements so the
//! connection manager can drive the authorization-code flow without knowing
//! provider wire formats.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use url::Url;

use super::provider::{Provider, ProviderFamily};

/// OAuth error codes that mean a refresh token will never work again.
const PERMANENT_REFRESH_CODES: &[&str] = &["invalid_grant", "unauthorized_client", "invalid_client"];

/// Provider client errors
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("network error: {0}")]
    Network(String),
    #[error("token exchange failed: {0}")]
    Exchange(String),
    #[error("no access token received")]
    MissingAccessToken,
    #[error("user info lookup failed: {0}")]
    UserInfo(String),
    #[error("token refresh failed: {details}")]
    Refresh {
        error_code: Option<String>,
        details: String,
    },
    #[error("{0} does not issue refresh tokens")]
    RefreshUnsupported(&'static str),
    #[error("token revocation failed: {0}")]
    Revoke(String),
    #[error("invalid provider response: {0}")]
    InvalidResponse(String),
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl ProviderError {
    /// Whether retrying the same refresh token can never succeed.
    pub fn is_permanent(&self) -> bool {
        match self {
            ProviderError::Refresh {
                error_code: Some(code),
                ..
            } => PERMANENT_REFRESH_CODES.contains(&code.as_str()),
            ProviderError::RefreshUnsupported(_) => true,
            _ => false,
        }
    }
}

/// Tokens and identity returned by a successful code exchange.
#[derive(Clone)]
pub struct TokenGrant {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub scope: String,
    pub provider_account_id: String,
    pub provider_org_id: Option<String>,
}

impl std::fmt::Debug for TokenGrant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenGrant")
            .field("access_token", &"[REDACTED]")
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "[REDACTED]"))
            .field("expires_at", &self.expires_at)
            .field("scope", &self.scope)
            .field("provider_account_id", &self.provider_account_id)
            .field("provider_org_id", &self.provider_org_id)
            .finish()
    }
}

/// Result of a refresh-token grant. The refresh token is only present when
/// the provider rotated it.
#[derive(Clone)]
pub struct RefreshedToken {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl std::fmt::Debug for RefreshedToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RefreshedToken")
            .field("rotated", &self.refresh_token.is_some())
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Outcome of comparing requested scopes against the granted set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScopeCheck {
    pub valid: bool,
    pub missing: Vec<String>,
}

impl ScopeCheck {
    /// Compare `requested` against an already parsed list of granted scopes.
    pub fn compare<'a>(requested: &[String], granted: impl IntoIterator<Item = &'a str>) -> Self {
        let granted: Vec<&str> = granted.into_iter().filter(|s| !s.is_empty()).collect();
        let missing: Vec<String> = requested
            .iter()
            .filter(|scope| !granted.contains(&scope.as_str()))
            .cloned()
            .collect();

        Self {
            valid: missing.is_empty(),
            missing,
        }
    }
}

/// Capability interface implemented by each OAuth provider client.
#[async_trait]
pub trait OAuthProvider: Send + Sync {
    /// Provider family served by this client
    fn family(&self) -> ProviderFamily;

    /// Provider-specific scopes requested for `provider`. Baseline identity
    /// scopes are excluded because they are never verified.
    fn requested_scopes(&self, provider: Provider) -> Vec<String>;

    /// Build the consent URL the browser is redirected to.
    fn build_auth_url(&self, provider: Provider, state: &str) -> Result<Url, ProviderError>;

    /// Exchange a one-time authorization code for tokens. Providers that
    /// return the account identity with the tokens fill it in here.
    async fn exchange_code_for_tokens(&self, code: &str) -> Result<TokenGrant, ProviderError>;

    /// Complete the grant's account identity once its scopes are accepted.
    async fn resolve_identity(&self, grant: TokenGrant) -> Result<TokenGrant, ProviderError> {
        Ok(grant)
    }

    /// Check the provider's granted scope string against the requested scopes.
    fn verify_scopes(&self, requested: &[String], granted: &str) -> ScopeCheck;

    /// Revoke `token` at the provider.
    async fn try_revoke_token(&self, token: &str) -> Result<(), ProviderError>;

    /// Obtain a new access token from a refresh token.
    async fn refresh_access_token(
        &self,
        refresh_token: &str,
    ) -> Result<RefreshedToken, ProviderError>;

    /// Best-effort revocation. Failures are logged and reported as `false`.
    async fn revoke_token(&self, token: &str) -> bool {
        match self.try_revoke_token(token).await {
            Ok(()) => true,
            Err(error) => {
                tracing::warn!(family = ?self.family(), %error, "Provider token revocation failed");
                false
            }
        }
    }
}

/// Truncate an upstream body for error messages without splitting a character.
pub(crate) fn body_snippet(body: &str) -> String {
    if body.chars().count() > 200 {
        let truncated: String = body.chars().take(200).collect();
        format!("{}...", truncated)
    } else {
        body.to_string()
    }
}
