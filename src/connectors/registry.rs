//! Provider client registry
//!
//! Routes each [`Provider`] to the OAuth client of its family. Clients are
//! built from configuration at startup and shared behind `Arc`.

use std::sync::Arc;

use tracing::warn;

use super::google::GoogleClient;
use super::provider::{Provider, ProviderFamily};
use super::slack::SlackClient;
use super::trait_::OAuthProvider;
use crate::config::AppConfig;

/// Error type for registry lookups
#[derive(Debug, Clone, thiserror::Error)]
pub enum RegistryError {
    #[error("provider '{provider}' is not configured")]
    NotConfigured { provider: Provider },
}

/// Provider clients keyed by family
#[derive(Clone, Default)]
pub struct ProviderClients {
    google: Option<Arc<dyn OAuthProvider>>,
    slack: Option<Arc<dyn OAuthProvider>>,
}

impl ProviderClients {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Build clients for every provider family with credentials configured.
    pub fn from_config(config: &AppConfig) -> Self {
        let mut clients = Self::new();

        match (&config.google_client_id, &config.google_client_secret) {
            (Some(id), Some(secret)) => {
                clients = clients.with_google(Arc::new(GoogleClient::new(
                    id.clone(),
                    secret.clone(),
                    &config.app_url,
                )));
            }
            _ => warn!("Google providers disabled: missing GOOGLE_CLIENT_ID/GOOGLE_CLIENT_SECRET"),
        }

        match (&config.slack_client_id, &config.slack_client_secret) {
            (Some(id), Some(secret)) => {
                clients = clients.with_slack(Arc::new(SlackClient::new(
                    id.clone(),
                    secret.clone(),
                    &config.app_url,
                )));
            }
            _ => warn!("Slack provider disabled: missing SLACK_CLIENT_ID/SLACK_CLIENT_SECRET"),
        }

        clients
    }

    pub fn with_google(mut self, client: Arc<dyn OAuthProvider>) -> Self {
        self.google = Some(client);
        self
    }

    pub fn with_slack(mut self, client: Arc<dyn OAuthProvider>) -> Self {
        self.slack = Some(client);
        self
    }

    /// Client serving `provider`
    pub fn for_provider(&self, provider: Provider) -> Result<Arc<dyn OAuthProvider>, RegistryError> {
        let client = match provider.family() {
            ProviderFamily::Google => self.google.as_ref(),
            ProviderFamily::Slack => self.slack.as_ref(),
        };

        client
            .cloned()
            .ok_or(RegistryError::NotConfigured { provider })
    }

    /// Providers whose family has a configured client
    pub fn configured_providers(&self) -> Vec<Provider> {
        Provider::ALL
            .into_iter()
            .filter(|provider| self.for_provider(*provider).is_ok())
            .collect()
    }
}
