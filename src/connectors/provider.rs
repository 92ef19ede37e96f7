//! Provider identifiers
//!
//! The closed set of external services a user can link, and the OAuth client
//! family that serves each of them.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// An external provider a user can connect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "kebab-case")]
pub enum Provider {
    Gmail,
    GoogleCalendar,
    GoogleDrive,
    Slack,
}

/// OAuth client family backing a provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProviderFamily {
    Google,
    Slack,
}

/// Error returned when parsing an unknown provider identifier.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown provider '{0}'")]
pub struct UnknownProvider(pub String);

impl Provider {
    pub const ALL: [Provider; 4] = [
        Provider::Gmail,
        Provider::GoogleCalendar,
        Provider::GoogleDrive,
        Provider::Slack,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Gmail => "gmail",
            Provider::GoogleCalendar => "google-calendar",
            Provider::GoogleDrive => "google-drive",
            Provider::Slack => "slack",
        }
    }

    pub fn family(&self) -> ProviderFamily {
        match self {
            Provider::Gmail | Provider::GoogleCalendar | Provider::GoogleDrive => {
                ProviderFamily::Google
            }
            Provider::Slack => ProviderFamily::Slack,
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Provider {
    type Err = UnknownProvider;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Provider::ALL
            .into_iter()
            .find(|provider| provider.as_str() == s)
            .ok_or_else(|| UnknownProvider(s.to_string()))
    }
}
