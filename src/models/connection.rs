//! Connection entity model
//!
//! One row per (user, provider) OAuth grant. Token columns hold encrypted
//! `iv:tag:ciphertext` bundles, never plaintext.

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::connectors::Provider;

/// Lifecycle status of a connection
#[derive(Clone, Copy, Debug, PartialEq, Eq, EnumIter, DeriveActiveEnum, Serialize, Deserialize)]
#[sea_orm(rs_type = "String", db_type = "Text")]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    #[sea_orm(string_value = "active")]
    Active,
    #[sea_orm(string_value = "revoked")]
    Revoked,
    #[sea_orm(string_value = "error")]
    Error,
}

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "connections")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    /// Owning user
    pub user_id: String,

    /// Provider string form, e.g. `google-drive`
    pub provider: String,

    /// Google: account email; Slack: authed user id
    pub provider_account_id: String,

    /// Slack team id
    pub provider_org_id: Option<String>,

    /// Encrypted access token; empty once revoked
    pub access_token: String,

    /// Encrypted refresh token
    pub refresh_token: Option<String>,

    pub access_token_expires_at: Option<DateTimeWithTimeZone>,

    /// Granted scopes exactly as the provider returned them
    pub scope: String,

    pub status: ConnectionStatus,

    pub last_synced_at: Option<DateTimeWithTimeZone>,

    pub created_at: DateTimeWithTimeZone,

    pub updated_at: DateTimeWithTimeZone,
}

impl Model {
    /// Parsed provider; `None` for rows written with an unknown provider string
    pub fn provider(&self) -> Option<Provider> {
        self.provider.parse().ok()
    }

    pub fn is_active(&self) -> bool {
        self.status == ConnectionStatus::Active
    }
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
