//! Connectors module
//!
//! OAuth provider clients behind one capability interface:
//! - `OAuthProvider`, the trait every provider client implements
//! - `Provider`, the closed set of linkable services
//! - `ProviderClients`, routing a provider to the client of its family
//! - Google and Slack implementations

pub mod google;
pub mod provider;
pub mod registry;
pub mod slack;
pub mod trait_;

pub use google::{GoogleClient, GoogleEndpoints};
pub use provider::{Provider, ProviderFamily, UnknownProvider};
pub use registry::{ProviderClients, RegistryError};
pub use slack::SlackClient;
pub use trait_::{OAuthProvider, ProviderError, RefreshedToken, ScopeCheck, TokenGrant};
