//! Configuration loading for the chatlink service.
//!
//! Loads layered `.env` files and environment variables prefixed with
//! `CHATLINK_`, producing a typed [`AppConfig`].

use std::{collections::BTreeMap, env, net::SocketAddr, path::PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

const ENV_PREFIX: &str = "CHATLINK_";
const REDACTED: &str = "[REDACTED]";
const LOCAL_SESSION_SECRET: &str = "chatlink-local-development-secret";

/// Application configuration derived from `CHATLINK_*` environment variables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct AppConfig {
    #[serde(default = "default_profile")]
    pub profile: String,
    #[serde(default = "default_api_bind_addr")]
    pub api_bind_addr: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_log_format")]
    pub log_format: String,
    #[serde(default = "default_database_url")]
    pub database_url: String,
    #[serde(default = "default_db_max_connections")]
    pub db_max_connections: u32,
    #[serde(default = "default_db_acquire_timeout_ms")]
    pub db_acquire_timeout_ms: u64,
    /// Public base URL of the web application; OAuth redirect URIs hang off it
    #[serde(default = "default_app_url")]
    pub app_url: String,
    /// Hex-encoded 32-byte token encryption key, resolved lazily by the cipher
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encryption_key: Option<String>,
    /// Secret used to verify session tokens and sign OAuth transaction cookies
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_secret: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub google_client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub google_client_secret: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slack_client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slack_client_secret: Option<String>,
    /// Backing store for resumable streams; absent means non-resumable streaming
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_store_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_api_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_api_key: Option<String>,
    #[serde(default = "default_chat_models")]
    pub chat_models: Vec<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            profile: default_profile(),
            api_bind_addr: default_api_bind_addr(),
            log_level: default_log_level(),
            log_format: default_log_format(),
            database_url: default_database_url(),
            db_max_connections: default_db_max_connections(),
            db_acquire_timeout_ms: default_db_acquire_timeout_ms(),
            app_url: default_app_url(),
            encryption_key: None,
            session_secret: None,
            google_client_id: None,
            google_client_secret: None,
            slack_client_id: None,
            slack_client_secret: None,
            stream_store_url: None,
            model_api_url: None,
            model_api_key: None,
            chat_models: default_chat_models(),
        }
    }
}

impl AppConfig {
    /// Returns the configured bind address as a socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr, std::net::AddrParseError> {
        self.api_bind_addr.parse()
    }

    /// Whether this profile is a developer or test environment.
    pub fn is_local(&self) -> bool {
        matches!(self.profile.as_str(), "local" | "test")
    }

    /// Cookies carry the `Secure` attribute outside local/test profiles.
    pub fn secure_cookies(&self) -> bool {
        !self.is_local()
    }

    /// Key for session tokens and transaction cookies. Only local/test
    /// profiles may fall back to the built-in development secret.
    pub fn session_key(&self) -> &[u8] {
        self.session_secret
            .as_deref()
            .unwrap_or(LOCAL_SESSION_SECRET)
            .as_bytes()
    }

    /// Settings page the OAuth callback redirects back to.
    pub fn settings_url(&self) -> String {
        format!("{}/settings", self.app_url.trim_end_matches('/'))
    }

    /// Returns a redacted JSON representation (secrets are redacted).
    pub fn redacted_json(&self) -> serde_json::Result<String> {
        let mut config = self.clone();
        for secret in [
            &mut config.encryption_key,
            &mut config.session_secret,
            &mut config.google_client_secret,
            &mut config.slack_client_secret,
            &mut config.model_api_key,
        ] {
            if secret.is_some() {
                *secret = Some(REDACTED.to_string());
            }
        }
        if let Some(url) = config.stream_store_url.as_mut()
            && url.contains('@')
        {
            *url = REDACTED.to_string();
        }
        if config.database_url.contains('@') {
            config.database_url = REDACTED.to_string();
        }
        serde_json::to_string_pretty(&config)
    }

    /// Validates the configuration, returning an error if required settings are missing.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Err(source) = Url::parse(&self.app_url) {
            return Err(ConfigError::InvalidAppUrl {
                value: self.app_url.clone(),
                source,
            });
        }

        if !matches!(self.log_format.as_str(), "json" | "pretty") {
            return Err(ConfigError::InvalidLogFormat {
                value: self.log_format.clone(),
            });
        }

        // A missing key is tolerated until a token is actually encrypted, but a
        // malformed one is always a mistake.
        if let Some(key) = self.encryption_key.as_deref() {
            let valid = key.len() == 64 && key.chars().all(|c| c.is_ascii_hexdigit());
            if !valid {
                return Err(ConfigError::InvalidEncryptionKey { length: key.len() });
            }
        }

        if !self.is_local() && self.session_secret.is_none() {
            return Err(ConfigError::MissingSessionSecret);
        }

        if self.chat_models.is_empty() {
            return Err(ConfigError::NoChatModels);
        }

        if self.db_max_connections == 0 {
            return Err(ConfigError::InvalidDbMaxConnections);
        }

        Ok(())
    }
}

fn default_profile() -> String {
    "local".to_string()
}

fn default_api_bind_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

fn default_database_url() -> String {
    "postgresql://localhost:5432/chatlink".to_string()
}

fn default_db_max_connections() -> u32 {
    10
}

fn default_db_acquire_timeout_ms() -> u64 {
    5000
}

fn default_app_url() -> String {
    "http://localhost:3000".to_string()
}

fn default_chat_models() -> Vec<String> {
    vec!["chat-model".to_string(), "chat-model-reasoning".to_string()]
}

/// Errors that can occur while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load environment file {path}: {source}")]
    EnvFile {
        path: PathBuf,
        source: dotenvy::Error,
    },
    #[error("invalid api bind address '{value}': {source}")]
    InvalidBindAddr {
        value: String,
        source: std::net::AddrParseError,
    },
    #[error("invalid app url '{value}': {source}")]
    InvalidAppUrl {
        value: String,
        source: url::ParseError,
    },
    #[error("log format must be 'json' or 'pretty', got '{value}'")]
    InvalidLogFormat { value: String },
    #[error("encryption key must be 64 hex characters (32 bytes), got {length} characters")]
    InvalidEncryptionKey { length: usize },
    #[error("session secret is missing; set CHATLINK_SESSION_SECRET")]
    MissingSessionSecret,
    #[error("no chat models configured; set CHATLINK_CHAT_MODELS")]
    NoChatModels,
    #[error("database max connections must be positive")]
    InvalidDbMaxConnections,
}

/// Loads configuration using layered `.env` files and `CHATLINK_*` env vars.
pub struct ConfigLoader {
    base_dir: PathBuf,
}

impl ConfigLoader {
    /// Creates a new loader rooted at the current working directory.
    pub fn new() -> Self {
        Self {
            base_dir: env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
        }
    }

    /// Creates a loader rooted at the provided directory (useful for tests).
    pub fn with_base_dir(base_dir: PathBuf) -> Self {
        Self { base_dir }
    }

    /// Loads configuration: dotenv layers first, then the process environment.
    pub fn load(&self) -> Result<AppConfig, ConfigError> {
        let (mut layered, profile_hint) = self.collect_layered_env()?;

        // Overlay process environment last so it wins.
        for (key, value) in env::vars() {
            if let Some(stripped) = key.strip_prefix(ENV_PREFIX) {
                layered.insert(stripped.to_string(), value);
            }
        }

        let mut take = |key: &str| layered.remove(key).filter(|v| !v.trim().is_empty());

        let profile = take("PROFILE").unwrap_or(profile_hint);
        let api_bind_addr = take("API_BIND_ADDR").unwrap_or_else(default_api_bind_addr);
        let log_level = take("LOG_LEVEL").unwrap_or_else(default_log_level);
        let log_format = take("LOG_FORMAT").unwrap_or_else(default_log_format);
        let database_url = take("DATABASE_URL").unwrap_or_else(default_database_url);
        let db_max_connections = take("DB_MAX_CONNECTIONS")
            .and_then(|v| v.parse().ok())
            .unwrap_or_else(default_db_max_connections);
        let db_acquire_timeout_ms = take("DB_ACQUIRE_TIMEOUT_MS")
            .and_then(|v| v.parse().ok())
            .unwrap_or_else(default_db_acquire_timeout_ms);
        let app_url = take("APP_URL").unwrap_or_else(default_app_url);
        let chat_models = take("CHAT_MODELS")
            .map(|models| {
                models
                    .split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .unwrap_or_else(default_chat_models);

        let config = AppConfig {
            profile,
            api_bind_addr,
            log_level,
            log_format,
            database_url,
            db_max_connections,
            db_acquire_timeout_ms,
            app_url,
            encryption_key: take("ENCRYPTION_KEY").map(|v| v.trim().to_string()),
            session_secret: take("SESSION_SECRET"),
            google_client_id: take("GOOGLE_CLIENT_ID"),
            google_client_secret: take("GOOGLE_CLIENT_SECRET"),
            slack_client_id: take("SLACK_CLIENT_ID"),
            slack_client_secret: take("SLACK_CLIENT_SECRET"),
            stream_store_url: take("STREAM_STORE_URL"),
            model_api_url: take("MODEL_API_URL"),
            model_api_key: take("MODEL_API_KEY"),
            chat_models,
        };

        config.validate()?;

        match config.bind_addr() {
            Ok(_) => Ok(config),
            Err(source) => Err(ConfigError::InvalidBindAddr {
                value: config.api_bind_addr.clone(),
                source,
            }),
        }
    }

    fn collect_layered_env(&self) -> Result<(BTreeMap<String, String>, String), ConfigError> {
        let mut values = BTreeMap::new();

        self.merge_dotenv(self.base_dir.join(".env"), &mut values)?;
        self.merge_dotenv(self.base_dir.join(".env.local"), &mut values)?;

        let profile = env::var(format!("{ENV_PREFIX}PROFILE"))
            .ok()
            .or_else(|| values.get("PROFILE").cloned())
            .unwrap_or_else(default_profile);

        self.merge_dotenv(
            self.base_dir.join(format!(".env.{}", &profile)),
            &mut values,
        )?;
        self.merge_dotenv(
            self.base_dir.join(format!(".env.{}.local", &profile)),
            &mut values,
        )?;

        Ok((values, profile))
    }

    fn merge_dotenv(
        &self,
        path: PathBuf,
        values: &mut BTreeMap<String, String>,
    ) -> Result<(), ConfigError> {
        match dotenvy::from_path_iter(&path) {
            Ok(iter) => {
                for item in iter {
                    let (key, value) = item.map_err(|source| ConfigError::EnvFile {
                        path: path.clone(),
                        source,
                    })?;
                    if let Some(stripped) = key.strip_prefix(ENV_PREFIX) {
                        values.insert(stripped.to_string(), value);
                    }
                }
                Ok(())
            }
            Err(dotenvy::Error::Io(ref io_err))
                if io_err.kind() == std::io::ErrorKind::NotFound =>
            {
                Ok(())
            }
            Err(err) => Err(ConfigError::EnvFile { path, source: err }),
        }
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert!(config.is_local());
        assert!(!config.secure_cookies());
        assert_eq!(config.settings_url(), "http://localhost:3000/settings");
    }

    #[test]
    fn test_production_requires_session_secret() {
        let config = AppConfig {
            profile: "prod".to_string(),
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MissingSessionSecret)
        ));

        let config = AppConfig {
            profile: "prod".to_string(),
            session_secret: Some("s3cret".to_string()),
            ..Default::default()
        };
        assert!(config.validate().is_ok());
        assert!(config.secure_cookies());
    }

    #[test]
    fn test_malformed_encryption_key_rejected() {
        let config = AppConfig {
            encryption_key: Some("not-hex".to_string()),
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidEncryptionKey { length: 7 })
        ));

        let config = AppConfig {
            encryption_key: Some("ab".repeat(32)),
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_log_format_and_app_url() {
        let config = AppConfig {
            log_format: "xml".to_string(),
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidLogFormat { .. })
        ));

        let config = AppConfig {
            app_url: "not a url".to_string(),
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidAppUrl { .. })
        ));
    }

    #[test]
    fn test_redacted_json_masks_secrets() {
        let config = AppConfig {
            encryption_key: Some("ab".repeat(32)),
            session_secret: Some("session".to_string()),
            google_client_secret: Some("google".to_string()),
            database_url: "postgres://user:pw@db/chatlink".to_string(),
            ..Default::default()
        };
        let json = config.redacted_json().unwrap();
        assert!(!json.contains(&"ab".repeat(32)));
        assert!(!json.contains("session\""));
        assert!(!json.contains("pw@db"));
        assert!(json.contains(REDACTED));
    }
}
