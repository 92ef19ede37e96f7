//! Stream id registry: one row per generated turn.

use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder,
    QuerySelect, Set,
};
use uuid::Uuid;

use crate::models::stream::{self, Entity as Stream};

#[derive(Debug, Clone)]
pub struct StreamRepository {
    db: Arc<DatabaseConnection>,
}

impl StreamRepository {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    pub async fn create(&self, stream_id: Uuid, chat_id: Uuid) -> Result<()> {
        stream::ActiveModel {
            id: Set(stream_id),
            chat_id: Set(chat_id),
            created_at: Set(Utc::now().into()),
        }
        .insert(&*self.db)
        .await?;
        Ok(())
    }

    /// Stream ids of a chat, oldest first
    pub async fn list_ids_by_chat(&self, chat_id: Uuid) -> Result<Vec<Uuid>> {
        Ok(Stream::find()
            .select_only()
            .column(stream::Column::Id)
            .filter(stream::Column::ChatId.eq(chat_id))
            .order_by_asc(stream::Column::CreatedAt)
            .into_tuple::<Uuid>()
            .all(&*self.db)
            .await?)
    }
}
