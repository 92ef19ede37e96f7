//! # Connection Manager
//!
//! Drives the OAuth authorization-code flow and owns every stored token.
//!
//! A connection moves `absent -> active` on a successful callback, stays
//! `active` across refreshes and re-authorization, becomes `revoked` on
//! disconnect and `error` when the provider permanently rejects its refresh
//! token. Initiating again revives a revoked row in place.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use metrics::{counter, histogram};
use rand::RngCore;
use rand::rngs::OsRng;
use serde::Deserialize;
use subtle::ConstantTimeEq;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use url::Url;
use utoipa::IntoParams;
use uuid::Uuid;

use crate::auth::UserId;
use crate::connectors::{
    OAuthProvider, Provider, ProviderClients, ProviderError, ProviderFamily, RegistryError,
};
use crate::crypto::{CryptoError, DEFAULT_EXPIRY_BUFFER_MINUTES, TokenCipher, is_token_expired};
use crate::models::connection;
use crate::oauth_state::{
    OAUTH_PROVIDER_KEY, OAUTH_SCOPES_KEY, OAUTH_STATE_KEY, TRANSACTION_TTL, TransactionState,
};
use crate::repositories::{ConnectionRepository, NewConnection, ProviderStatus};

/// Query parameters the provider appends to the callback URL
#[derive(Debug, Clone, Default, Deserialize, IntoParams)]
pub struct CallbackParams {
    pub code: Option<String>,
    pub state: Option<String>,
    /// Set by the provider when the user denied consent
    pub error: Option<String>,
}

/// Result of a disconnect
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisconnectOutcome {
    /// Whether the provider confirmed revocation of the stored token
    pub revoked_at_provider: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("authorization denied by provider: {0}")]
    ProviderDenied(String),
    #[error("callback is missing code or state")]
    MissingParameters,
    #[error("state does not match the pending authorization")]
    InvalidState,
    #[error("no provider bound to the pending authorization")]
    MissingProvider,
    #[error("provider not valid for this route: {0}")]
    InvalidProvider(String),
    #[error("provider is not configured: {0}")]
    NotConfigured(#[from] RegistryError),
    #[error("granted scopes are missing {missing:?}")]
    InsufficientPermissions { missing: Vec<String> },
    #[error("no active connection for {0}")]
    NotConnected(Provider),
    #[error("provider call failed: {0}")]
    Provider(#[from] ProviderError),
    #[error("token refresh failed: {0}")]
    Refresh(ProviderError),
    #[error("token encryption failed: {0}")]
    Crypto(#[from] CryptoError),
    #[error("connection store failed: {0}")]
    Store(#[from] anyhow::Error),
}

impl ConnectionError {
    /// Short code reported back to the settings page
    pub fn code(&self) -> &str {
        match self {
            ConnectionError::ProviderDenied(code) => code,
            ConnectionError::MissingParameters => "missing_parameters",
            ConnectionError::InvalidState => "invalid_state",
            ConnectionError::MissingProvider => "missing_provider",
            ConnectionError::InvalidProvider(_) | ConnectionError::NotConfigured(_) => {
                "invalid_provider"
            }
            ConnectionError::InsufficientPermissions { .. } => "insufficient_permissions",
            ConnectionError::NotConnected(_) => "not_connected",
            ConnectionError::Refresh(_) => "refresh_failed",
            ConnectionError::Provider(_)
            | ConnectionError::Crypto(_)
            | ConnectionError::Store(_) => "callback_failed",
        }
    }
}

/// Owns the connection lifecycle for all providers
#[derive(Clone)]
pub struct ConnectionManager {
    repo: ConnectionRepository,
    cipher: TokenCipher,
    clients: ProviderClients,
    /// One lock per connection so concurrent callers share a single refresh
    refresh_locks: Arc<Mutex<HashMap<Uuid, Arc<Mutex<()>>>>>,
}

impl ConnectionManager {
    pub fn new(repo: ConnectionRepository, cipher: TokenCipher, clients: ProviderClients) -> Self {
        Self {
            repo,
            cipher,
            clients,
            refresh_locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn client_for(
        &self,
        provider: Provider,
        family: ProviderFamily,
    ) -> Result<Arc<dyn OAuthProvider>, ConnectionError> {
        if provider.family() != family {
            return Err(ConnectionError::InvalidProvider(provider.to_string()));
        }
        Ok(self.clients.for_provider(provider)?)
    }

    /// Starts an authorization: records state, provider and requested scopes
    /// in `txn` and returns the consent URL. Nothing is persisted.
    #[instrument(skip(self, txn), fields(user_id = %user))]
    pub fn initiate(
        &self,
        user: &UserId,
        provider: Provider,
        family: ProviderFamily,
        txn: &mut dyn TransactionState,
    ) -> Result<Url, ConnectionError> {
        let client = self.client_for(provider, family)?;

        let mut raw_state = [0u8; 32];
        OsRng.fill_bytes(&mut raw_state);
        let state = hex::encode(raw_state);

        let scopes = client.requested_scopes(provider);
        let scopes_json = serde_json::to_string(&scopes)
            .map_err(|e| ConnectionError::Store(anyhow::anyhow!("scope encoding: {}", e)))?;

        let auth_url = client.build_auth_url(provider, &state)?;

        txn.set(OAUTH_STATE_KEY, &state, TRANSACTION_TTL);
        txn.set(OAUTH_PROVIDER_KEY, provider.as_str(), TRANSACTION_TTL);
        txn.set(OAUTH_SCOPES_KEY, &scopes_json, TRANSACTION_TTL);

        counter!("connections_initiated_total", "provider" => provider.as_str()).increment(1);
        info!(%provider, "Initiated OAuth authorization");
        Ok(auth_url)
    }

    /// Completes an authorization from the provider's redirect.
    ///
    /// The pending transaction is consumed whatever the outcome.
    #[instrument(skip(self, params, txn), fields(user_id = %user))]
    pub async fn complete_callback(
        &self,
        user: &UserId,
        params: CallbackParams,
        txn: &mut dyn TransactionState,
        expected_family: ProviderFamily,
    ) -> Result<connection::Model, ConnectionError> {
        let saved_state = txn.get(OAUTH_STATE_KEY);
        let saved_provider = txn.get(OAUTH_PROVIDER_KEY);
        let saved_scopes = txn.get(OAUTH_SCOPES_KEY);
        for key in [OAUTH_STATE_KEY, OAUTH_PROVIDER_KEY, OAUTH_SCOPES_KEY] {
            txn.delete(key);
        }

        if let Some(denied) = params.error.filter(|e| !e.is_empty()) {
            warn!(error = %denied, "Provider returned an authorization error");
            return Err(ConnectionError::ProviderDenied(denied));
        }

        let (Some(code), Some(state)) = (
            params.code.filter(|c| !c.is_empty()),
            params.state.filter(|s| !s.is_empty()),
        ) else {
            return Err(ConnectionError::MissingParameters);
        };

        let state_matches = saved_state
            .as_deref()
            .is_some_and(|saved| bool::from(saved.as_bytes().ct_eq(state.as_bytes())));
        if !state_matches {
            counter!("connections_callback_rejected_total", "reason" => "invalid_state").increment(1);
            return Err(ConnectionError::InvalidState);
        }

        let provider_str = saved_provider.ok_or(ConnectionError::MissingProvider)?;
        let provider: Provider = provider_str
            .parse()
            .map_err(|_| ConnectionError::InvalidProvider(provider_str.clone()))?;
        let client = self.client_for(provider, expected_family)?;

        let started = std::time::Instant::now();
        let grant = client.exchange_code_for_tokens(&code).await?;
        histogram!("connections_token_exchange_ms", "provider" => provider.as_str())
            .record(started.elapsed().as_secs_f64() * 1_000.0);

        let requested = requested_scopes_from(saved_scopes.as_deref(), client.as_ref(), provider);
        let check = client.verify_scopes(&requested, &grant.scope);
        if !check.valid {
            warn!(%provider, missing = ?check.missing, "Granted scopes are insufficient, revoking fresh token");
            client.revoke_token(&grant.access_token).await;
            counter!("connections_callback_rejected_total", "reason" => "insufficient_permissions")
                .increment(1);
            return Err(ConnectionError::InsufficientPermissions {
                missing: check.missing,
            });
        }

        let fresh_token = grant.access_token.clone();
        let grant = match client.resolve_identity(grant).await {
            Ok(grant) => grant,
            Err(error) => {
                warn!(%provider, %error, "Account lookup failed, revoking fresh token");
                client.revoke_token(&fresh_token).await;
                return Err(error.into());
            }
        };

        let access_token = self.cipher.encrypt(&grant.access_token)?;
        let refresh_token = grant
            .refresh_token
            .as_deref()
            .map(|token| self.cipher.encrypt(token))
            .transpose()?;

        let stored = self
            .repo
            .upsert(NewConnection {
                user_id: user.to_string(),
                provider,
                provider_account_id: grant.provider_account_id.clone(),
                provider_org_id: grant.provider_org_id.clone(),
                access_token,
                refresh_token,
                access_token_expires_at: grant.expires_at,
                scope: grant.scope.clone(),
            })
            .await?;

        counter!("connections_established_total", "provider" => provider.as_str()).increment(1);
        info!(%provider, connection_id = %stored.id, "Connection established");
        Ok(stored)
    }

    /// Revokes the stored token at the provider (best effort) and soft-deletes
    /// the connection. Safe to repeat.
    #[instrument(skip(self), fields(user_id = %user))]
    pub async fn disconnect(
        &self,
        user: &UserId,
        provider: Provider,
    ) -> Result<DisconnectOutcome, ConnectionError> {
        let mut revoked_at_provider = false;

        if let Some(row) = self.repo.find(user.as_str(), provider).await?
            && !row.access_token.is_empty()
        {
            match self.cipher.decrypt(&row.access_token) {
                Ok(token) => match self.clients.for_provider(provider) {
                    Ok(client) => revoked_at_provider = client.revoke_token(&token).await,
                    Err(e) => warn!(%provider, error = %e, "Cannot revoke token without a configured client"),
                },
                Err(e) => error!(%provider, connection_id = %row.id, error = %e, "Stored token could not be decrypted for revocation"),
            }
        }

        let touched = self.repo.revoke(user.as_str(), provider).await?;
        if touched {
            counter!("connections_revoked_total", "provider" => provider.as_str()).increment(1);
        }
        info!(%provider, revoked_at_provider, "Connection disconnected");
        Ok(DisconnectOutcome {
            revoked_at_provider,
        })
    }

    pub async fn status(
        &self,
        user: &UserId,
        provider: Provider,
    ) -> Result<ProviderStatus, ConnectionError> {
        let row = self.repo.find(user.as_str(), provider).await?;
        Ok(ProviderStatus::from_row(row.as_ref()))
    }

    /// Status of every provider; lookup failures read as disconnected
    pub async fn statuses(&self, user: &UserId) -> BTreeMap<Provider, ProviderStatus> {
        self.repo.statuses(user.as_str(), &Provider::ALL).await
    }

    /// Refreshes the access token when it is within the expiry buffer and a
    /// refresh token is stored. Otherwise returns the connection unchanged.
    #[instrument(skip_all, fields(connection_id = %conn.id, provider = %conn.provider))]
    pub async fn refresh_if_needed(
        &self,
        conn: connection::Model,
    ) -> Result<connection::Model, ConnectionError> {
        if !needs_refresh(&conn) {
            return Ok(conn);
        }

        let id = conn.id;
        let lock = {
            let mut locks = self.refresh_locks.lock().await;
            locks.entry(id).or_default().clone()
        };
        let result = {
            let _guard = lock.lock().await;
            self.refresh_locked(conn).await
        };

        // Drop the entry once no other caller is waiting on it
        let mut locks = self.refresh_locks.lock().await;
        drop(lock);
        if locks
            .get(&id)
            .is_some_and(|entry| Arc::strong_count(entry) == 1)
        {
            locks.remove(&id);
        }
        result
    }

    async fn refresh_locked(
        &self,
        conn: connection::Model,
    ) -> Result<connection::Model, ConnectionError> {
        let provider = conn
            .provider()
            .ok_or_else(|| ConnectionError::InvalidProvider(conn.provider.clone()))?;

        // Another caller may have refreshed while we waited for the lock.
        let current = match self.repo.find_by_id(conn.id).await? {
            Some(current) if current.is_active() => current,
            _ => return Err(ConnectionError::NotConnected(provider)),
        };
        if !needs_refresh(&current) {
            debug!("Token already refreshed by a concurrent caller");
            return Ok(current);
        }
        let Some(encrypted_refresh) = current.refresh_token.as_deref() else {
            return Ok(current);
        };

        let refresh_token = self.cipher.decrypt(encrypted_refresh)?;
        let client = self.clients.for_provider(provider)?;

        counter!("token_refresh_attempts_total", "provider" => provider.as_str()).increment(1);
        let started = std::time::Instant::now();
        let refreshed = match client.refresh_access_token(&refresh_token).await {
            Ok(refreshed) => refreshed,
            Err(error) => {
                if error.is_permanent() {
                    error!(%provider, %error, "Permanent token refresh failure, marking connection as error");
                    self.repo.mark_error(current.id).await?;
                    counter!("token_refresh_permanent_failure_total", "provider" => provider.as_str())
                        .increment(1);
                } else {
                    warn!(%provider, %error, "Transient token refresh failure");
                    counter!("token_refresh_transient_failure_total", "provider" => provider.as_str())
                        .increment(1);
                }
                return Err(ConnectionError::Refresh(error));
            }
        };
        histogram!("token_refresh_latency_ms").record(started.elapsed().as_secs_f64() * 1_000.0);

        let access_token = self.cipher.encrypt(&refreshed.access_token)?;
        let rotated = refreshed
            .refresh_token
            .as_deref()
            .map(|token| self.cipher.encrypt(token))
            .transpose()?;

        // A disconnect may have landed while the provider call was in flight.
        match self.repo.find_by_id(current.id).await? {
            Some(latest) if latest.is_active() => {}
            _ => {
                warn!(%provider, "Connection left the active state during refresh, discarding tokens");
                return Err(ConnectionError::NotConnected(provider));
            }
        }

        let updated = self
            .repo
            .update_tokens(
                current.id,
                &access_token,
                rotated.as_deref(),
                refreshed.expires_at,
            )
            .await?;

        counter!("token_refresh_success_total", "provider" => provider.as_str()).increment(1);
        info!(%provider, rotated = rotated.is_some(), "Refreshed access token");
        Ok(updated)
    }

    /// Decrypted access token for an active connection, refreshed first when
    /// close to expiry. This is what feature code calls.
    pub async fn access_token(
        &self,
        user: &UserId,
        provider: Provider,
    ) -> Result<String, ConnectionError> {
        let conn = match self.repo.find(user.as_str(), provider).await? {
            Some(conn) if conn.is_active() => conn,
            _ => return Err(ConnectionError::NotConnected(provider)),
        };

        let conn = self.refresh_if_needed(conn).await?;
        let token = self.cipher.decrypt(&conn.access_token)?;
        if let Err(e) = self.repo.update_last_synced(conn.id).await {
            warn!(%provider, error = %e, "Failed to record token use");
        }
        Ok(token)
    }

    /// Refreshes every active connection expiring within the buffer.
    /// Returns how many were refreshed successfully.
    pub async fn refresh_expiring_soon(&self) -> Result<usize, ConnectionError> {
        let due = self.repo.expiring_soon(DEFAULT_EXPIRY_BUFFER_MINUTES).await?;
        let mut refreshed = 0;
        for conn in due.into_iter().filter(|c| c.refresh_token.is_some()) {
            let id = conn.id;
            match self.refresh_if_needed(conn).await {
                Ok(_) => refreshed += 1,
                Err(e) => debug!(connection_id = %id, error = %e, "Background refresh skipped"),
            }
        }
        Ok(refreshed)
    }

    /// Periodically refreshes expiring tokens until `shutdown` fires.
    pub async fn run_refresh_loop(self, interval: Duration, shutdown: CancellationToken) {
        info!(interval_secs = interval.as_secs(), "Starting token refresh loop");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(interval) => {
                    match self.refresh_expiring_soon().await {
                        Ok(count) if count > 0 => info!(refreshed = count, "Refreshed expiring tokens"),
                        Ok(_) => {}
                        Err(e) => error!(error = %e, "Token refresh sweep failed"),
                    }
                }
            }
        }
        info!("Token refresh loop stopped");
    }
}

fn needs_refresh(conn: &connection::Model) -> bool {
    conn.refresh_token.is_some()
        && is_token_expired(
            conn.access_token_expires_at
                .map(|at| at.with_timezone(&chrono::Utc)),
            DEFAULT_EXPIRY_BUFFER_MINUTES,
        )
}

/// Scopes recorded at initiate time; the client's own list when the record is
/// missing or unreadable.
fn requested_scopes_from(
    saved: Option<&str>,
    client: &dyn OAuthProvider,
    provider: Provider,
) -> Vec<String> {
    match saved.map(serde_json::from_str::<Vec<String>>) {
        Some(Ok(scopes)) => scopes,
        Some(Err(e)) => {
            warn!(%provider, error = %e, "Unreadable requested scopes, using provider defaults");
            client.requested_scopes(provider)
        }
        None => client.requested_scopes(provider),
    }
}
