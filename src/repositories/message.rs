//! Message repository

use std::sync::Arc;

use anyhow::{Result, anyhow};
use chrono::{DateTime, Utc};
use sea_orm::sea_query::Expr;
use sea_orm::{ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder, Set};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::models::message::{self, Entity as Message, MessageRole};

/// Token accounting attached to assistant messages
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TokenUsage {
    pub input_token_details: Option<JsonValue>,
    pub output_token_details: Option<JsonValue>,
    pub total_tokens: Option<i32>,
}

/// A message ready to be inserted
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub id: Uuid,
    pub chat_id: Uuid,
    pub role: MessageRole,
    pub parts: JsonValue,
    pub attachments: JsonValue,
    pub created_at: DateTime<Utc>,
    pub usage: Option<TokenUsage>,
}

impl From<NewMessage> for message::ActiveModel {
    fn from(new: NewMessage) -> Self {
        let usage = new.usage.unwrap_or_default();
        message::ActiveModel {
            id: Set(new.id),
            chat_id: Set(new.chat_id),
            role: Set(new.role),
            parts: Set(new.parts),
            attachments: Set(new.attachments),
            created_at: Set(new.created_at.into()),
            input_token_details: Set(usage.input_token_details),
            output_token_details: Set(usage.output_token_details),
            total_tokens: Set(usage.total_tokens),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MessageRepository {
    db: Arc<DatabaseConnection>,
}

impl MessageRepository {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    /// Messages of a chat in conversation order
    pub async fn list_by_chat(&self, chat_id: Uuid) -> Result<Vec<message::Model>> {
        Ok(Message::find()
            .filter(message::Column::ChatId.eq(chat_id))
            .order_by_asc(message::Column::CreatedAt)
            .all(&*self.db)
            .await?)
    }

    pub async fn find_by_id(&self, id: Uuid) -> Result<Option<message::Model>> {
        Ok(Message::find_by_id(id).one(&*self.db).await?)
    }

    pub async fn save_many(&self, messages: Vec<NewMessage>) -> Result<()> {
        if messages.is_empty() {
            return Ok(());
        }
        let models: Vec<message::ActiveModel> = messages.into_iter().map(Into::into).collect();
        Message::insert_many(models)
            .exec_without_returning(&*self.db)
            .await?;
        Ok(())
    }

    /// Replaces the parts of an existing message, keeping its id and position
    pub async fn update_parts(&self, id: Uuid, parts: JsonValue) -> Result<()> {
        let result = Message::update_many()
            .col_expr(message::Column::Parts, Expr::value(parts))
            .filter(message::Column::Id.eq(id))
            .exec(&*self.db)
            .await?;

        if result.rows_affected == 0 {
            return Err(anyhow!("message '{}' not found", id));
        }
        Ok(())
    }

    /// Attaches token usage to a message already stored
    pub async fn update_usage(&self, id: Uuid, usage: TokenUsage) -> Result<()> {
        Message::update_many()
            .col_expr(
                message::Column::InputTokenDetails,
                Expr::value(usage.input_token_details),
            )
            .col_expr(
                message::Column::OutputTokenDetails,
                Expr::value(usage.output_token_details),
            )
            .col_expr(message::Column::TotalTokens, Expr::value(usage.total_tokens))
            .filter(message::Column::Id.eq(id))
            .exec(&*self.db)
            .await?;
        Ok(())
    }
}
