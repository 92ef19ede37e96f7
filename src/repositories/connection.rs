//! Connection repository for database operations
//!
//! Encapsulates SeaORM access to the `connections` table. Token values
//! arriving here are already encrypted; this layer never sees plaintext.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{Result, anyhow};
use chrono::{DateTime, Duration, Utc};
use sea_orm::prelude::DateTimeWithTimeZone;
use sea_orm::sea_query::{Expr, OnConflict, SimpleExpr};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder, Set,
};
use serde::Serialize;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::connectors::Provider;
use crate::models::connection::{self, ConnectionStatus, Entity as Connection};

/// Fields for creating or re-authorizing a connection
#[derive(Clone)]
pub struct NewConnection {
    pub user_id: String,
    pub provider: Provider,
    pub provider_account_id: String,
    pub provider_org_id: Option<String>,
    /// Encrypted access token bundle
    pub access_token: String,
    /// Encrypted refresh token bundle
    pub refresh_token: Option<String>,
    pub access_token_expires_at: Option<DateTime<Utc>>,
    pub scope: String,
}

impl std::fmt::Debug for NewConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NewConnection")
            .field("user_id", &self.user_id)
            .field("provider", &self.provider)
            .field("provider_account_id", &self.provider_account_id)
            .field("provider_org_id", &self.provider_org_id)
            .field("access_token_expires_at", &self.access_token_expires_at)
            .field("scope", &self.scope)
            .finish_non_exhaustive()
    }
}

/// Public view of a user's link to one provider; never carries tokens
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ProviderStatus {
    pub connected: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub account_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub org_id: Option<String>,
}

impl ProviderStatus {
    pub fn disconnected() -> Self {
        Self::default()
    }

    /// Connected only while the row is active
    pub fn from_row(row: Option<&connection::Model>) -> Self {
        match row {
            Some(row) if row.is_active() => Self {
                connected: true,
                account_id: Some(row.provider_account_id.clone()).filter(|v| !v.is_empty()),
                org_id: row.provider_org_id.clone().filter(|v| !v.is_empty()),
            },
            _ => Self::disconnected(),
        }
    }
}

/// Repository for connection database operations
#[derive(Debug, Clone)]
pub struct ConnectionRepository {
    db: Arc<DatabaseConnection>,
}

impl ConnectionRepository {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    /// Finds the connection a user holds for a provider, whatever its status
    pub async fn find(&self, user_id: &str, provider: Provider) -> Result<Option<connection::Model>> {
        Ok(Connection::find()
            .filter(connection::Column::UserId.eq(user_id))
            .filter(connection::Column::Provider.eq(provider.as_str()))
            .one(&*self.db)
            .await?)
    }

    pub async fn find_by_id(&self, id: Uuid) -> Result<Option<connection::Model>> {
        Ok(Connection::find_by_id(id).one(&*self.db).await?)
    }

    /// Lists a user's connections ordered by creation time
    pub async fn list_for_user(&self, user_id: &str) -> Result<Vec<connection::Model>> {
        Ok(Connection::find()
            .filter(connection::Column::UserId.eq(user_id))
            .order_by_asc(connection::Column::CreatedAt)
            .order_by_asc(connection::Column::Id)
            .all(&*self.db)
            .await?)
    }

    /// Inserts a connection, or refreshes the existing (user, provider) row in
    /// place. Re-authorizing a revoked or errored connection makes it active.
    pub async fn upsert(&self, new: NewConnection) -> Result<connection::Model> {
        let now: DateTimeWithTimeZone = Utc::now().into();
        let user_id = new.user_id.clone();
        let provider = new.provider;

        let model = connection::ActiveModel {
            id: Set(Uuid::new_v4()),
            user_id: Set(new.user_id),
            provider: Set(provider.as_str().to_string()),
            provider_account_id: Set(new.provider_account_id),
            provider_org_id: Set(new.provider_org_id),
            access_token: Set(new.access_token),
            refresh_token: Set(new.refresh_token),
            access_token_expires_at: Set(new.access_token_expires_at.map(Into::into)),
            scope: Set(new.scope),
            status: Set(ConnectionStatus::Active),
            last_synced_at: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
        };

        Connection::insert(model)
            .on_conflict(
                OnConflict::columns([connection::Column::UserId, connection::Column::Provider])
                    .update_columns([
                        connection::Column::ProviderAccountId,
                        connection::Column::ProviderOrgId,
                        connection::Column::AccessToken,
                        connection::Column::RefreshToken,
                        connection::Column::AccessTokenExpiresAt,
                        connection::Column::Scope,
                        connection::Column::Status,
                        connection::Column::UpdatedAt,
                    ])
                    .to_owned(),
            )
            .exec_without_returning(&*self.db)
            .await?;

        self.find(&user_id, provider)
            .await?
            .ok_or_else(|| anyhow!("connection for provider '{}' not persisted", provider))
    }

    /// Soft-revokes a connection: status `revoked`, tokens cleared.
    /// Returns whether a row was touched.
    pub async fn revoke(&self, user_id: &str, provider: Provider) -> Result<bool> {
        let now: DateTimeWithTimeZone = Utc::now().into();
        let result = Connection::update_many()
            .col_expr(
                connection::Column::Status,
                Expr::value(ConnectionStatus::Revoked),
            )
            .col_expr(connection::Column::AccessToken, Expr::value(""))
            .col_expr(
                connection::Column::RefreshToken,
                Expr::value(Option::<String>::None),
            )
            .col_expr(connection::Column::UpdatedAt, Expr::value(now))
            .filter(connection::Column::UserId.eq(user_id))
            .filter(connection::Column::Provider.eq(provider.as_str()))
            .exec(&*self.db)
            .await?;

        Ok(result.rows_affected > 0)
    }

    /// Stores refreshed tokens. The refresh token is only replaced when a new
    /// one is supplied; the expiry is only replaced when known.
    pub async fn update_tokens(
        &self,
        id: Uuid,
        access_token: &str,
        refresh_token: Option<&str>,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<connection::Model> {
        let existing = self
            .find_by_id(id)
            .await?
            .ok_or_else(|| anyhow!("connection '{}' not found", id))?;

        let mut model: connection::ActiveModel = existing.into();
        model.access_token = Set(access_token.to_string());
        if let Some(refresh_token) = refresh_token {
            model.refresh_token = Set(Some(refresh_token.to_string()));
        }
        if let Some(expires_at) = expires_at {
            model.access_token_expires_at = Set(Some(expires_at.into()));
        }
        model.updated_at = Set(Utc::now().into());

        Ok(model.update(&*self.db).await?)
    }

    pub async fn mark_error(&self, id: Uuid) -> Result<()> {
        self.set_column(
            id,
            connection::Column::Status,
            Expr::value(ConnectionStatus::Error),
        )
        .await
    }

    pub async fn update_last_synced(&self, id: Uuid) -> Result<()> {
        let now: DateTimeWithTimeZone = Utc::now().into();
        self.set_column(id, connection::Column::LastSyncedAt, Expr::value(now))
            .await
    }

    async fn set_column(&self, id: Uuid, column: connection::Column, value: SimpleExpr) -> Result<()> {
        let now: DateTimeWithTimeZone = Utc::now().into();
        let result = Connection::update_many()
            .col_expr(column, value)
            .col_expr(connection::Column::UpdatedAt, Expr::value(now))
            .filter(connection::Column::Id.eq(id))
            .exec(&*self.db)
            .await?;

        if result.rows_affected == 0 {
            return Err(anyhow!("connection '{}' not found", id));
        }
        Ok(())
    }

    /// Active connections whose access token expires within `minutes`
    pub async fn expiring_soon(&self, minutes: i64) -> Result<Vec<connection::Model>> {
        let threshold: DateTimeWithTimeZone = (Utc::now() + Duration::minutes(minutes)).into();
        Ok(Connection::find()
            .filter(connection::Column::Status.eq(ConnectionStatus::Active))
            .filter(connection::Column::AccessTokenExpiresAt.lt(threshold))
            .order_by_asc(connection::Column::AccessTokenExpiresAt)
            .all(&*self.db)
            .await?)
    }

    /// Status for each requested provider. A failed lookup degrades to
    /// disconnected instead of failing the whole request.
    pub async fn statuses(
        &self,
        user_id: &str,
        providers: &[Provider],
    ) -> BTreeMap<Provider, ProviderStatus> {
        let rows = self.list_for_user(user_id).await.unwrap_or_else(|error| {
            tracing::error!(user_id, error = %error, "Failed to load connection statuses");
            Vec::new()
        });
        providers
            .iter()
            .map(|&provider| {
                let row = rows.iter().find(|row| row.provider() == Some(provider));
                (provider, ProviderStatus::from_row(row))
            })
            .collect()
    }
}
