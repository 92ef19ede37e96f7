//! Chat repository
//!
//! Deleting a chat removes its streams and messages in the same transaction.

use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder, Set,
    TransactionTrait,
};
use uuid::Uuid;

use crate::models::chat::{self, Entity as Chat, Visibility};
use crate::models::{message, stream};

#[derive(Debug, Clone)]
pub struct ChatRepository {
    db: Arc<DatabaseConnection>,
}

impl ChatRepository {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    pub async fn find_by_id(&self, id: Uuid) -> Result<Option<chat::Model>> {
        Ok(Chat::find_by_id(id).one(&*self.db).await?)
    }

    pub async fn save(
        &self,
        id: Uuid,
        user_id: &str,
        title: &str,
        visibility: Visibility,
    ) -> Result<chat::Model> {
        let model = chat::ActiveModel {
            id: Set(id),
            created_at: Set(Utc::now().into()),
            title: Set(title.to_string()),
            user_id: Set(user_id.to_string()),
            visibility: Set(visibility),
        };
        Ok(model.insert(&*self.db).await?)
    }

    pub async fn update_title(&self, id: Uuid, title: &str) -> Result<()> {
        Chat::update_many()
            .col_expr(chat::Column::Title, sea_orm::sea_query::Expr::value(title))
            .filter(chat::Column::Id.eq(id))
            .exec(&*self.db)
            .await?;
        Ok(())
    }

    /// Removes a chat with its streams and messages; returns the deleted chat.
    pub async fn delete_by_id(&self, id: Uuid) -> Result<Option<chat::Model>> {
        let txn = self.db.begin().await?;

        let Some(existing) = Chat::find_by_id(id).one(&txn).await? else {
            txn.rollback().await?;
            return Ok(None);
        };

        stream::Entity::delete_many()
            .filter(stream::Column::ChatId.eq(id))
            .exec(&txn)
            .await?;
        message::Entity::delete_many()
            .filter(message::Column::ChatId.eq(id))
            .exec(&txn)
            .await?;
        Chat::delete_by_id(id).exec(&txn).await?;

        txn.commit().await?;
        Ok(Some(existing))
    }

    /// A user's chats, newest first
    pub async fn list_for_user(&self, user_id: &str) -> Result<Vec<chat::Model>> {
        Ok(Chat::find()
            .filter(chat::Column::UserId.eq(user_id))
            .order_by_desc(chat::Column::CreatedAt)
            .all(&*self.db)
            .await?)
    }
}
