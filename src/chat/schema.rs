//! Wire types of the chat endpoint
//!
//! [`ChatRequest`] is what the browser posts; [`UiMessage`] is the message
//! shape shared with the UI and stored in `messages.parts`; [`UiChunk`] is a
//! single event of the streamed response.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use url::Url;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::models::{MessageRole, Visibility};
use crate::models::message;

pub const MAX_TEXT_LENGTH: usize = 2000;
pub const MAX_FILE_NAME_LENGTH: usize = 100;

/// Body of `POST /api/chat`
#[derive(Debug, Clone, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ChatRequest {
    pub id: Uuid,
    #[serde(default)]
    pub message: Option<UserMessage>,
    /// Full UI message list, sent when continuing after a tool approval
    #[serde(default)]
    #[schema(value_type = Option<Vec<Object>>)]
    pub messages: Option<Vec<UiMessage>>,
    pub selected_chat_model: String,
    pub selected_visibility_type: Visibility,
}

#[derive(Debug, Clone, Deserialize, Serialize, ToSchema)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct UserMessage {
    pub id: Uuid,
    pub role: UserRole,
    pub parts: Vec<UserPart>,
}

/// The only role a posted message may carry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum UserRole {
    User,
}

#[derive(Debug, Clone, Deserialize, Serialize, ToSchema)]
#[serde(tag = "type", rename_all = "lowercase", deny_unknown_fields)]
pub enum UserPart {
    Text {
        text: String,
    },
    File {
        #[serde(rename = "mediaType")]
        media_type: ImageMediaType,
        name: String,
        #[schema(value_type = String, format = Uri)]
        url: Url,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, ToSchema)]
pub enum ImageMediaType {
    #[serde(rename = "image/jpeg")]
    Jpeg,
    #[serde(rename = "image/png")]
    Png,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("either message or messages is required")]
    MissingMessage,
    #[error("text parts must be between 1 and {MAX_TEXT_LENGTH} characters")]
    TextLength,
    #[error("file names must be between 1 and {MAX_FILE_NAME_LENGTH} characters")]
    FileNameLength,
    #[error("unknown chat model '{0}'")]
    UnknownModel(String),
}

impl ChatRequest {
    /// Checks the constraints serde cannot express.
    pub fn validate(&self, chat_models: &[String]) -> Result<(), ValidationError> {
        if self.message.is_none() && self.messages.is_none() {
            return Err(ValidationError::MissingMessage);
        }
        if !chat_models.iter().any(|m| m == &self.selected_chat_model) {
            return Err(ValidationError::UnknownModel(self.selected_chat_model.clone()));
        }
        if let Some(message) = &self.message {
            for part in &message.parts {
                match part {
                    UserPart::Text { text } => {
                        let len = text.chars().count();
                        if len == 0 || len > MAX_TEXT_LENGTH {
                            return Err(ValidationError::TextLength);
                        }
                    }
                    UserPart::File { name, .. } => {
                        let len = name.chars().count();
                        if len == 0 || len > MAX_FILE_NAME_LENGTH {
                            return Err(ValidationError::FileNameLength);
                        }
                    }
                }
            }
        }
        Ok(())
    }

    pub fn is_tool_approval(&self) -> bool {
        self.messages.is_some()
    }
}

impl UserMessage {
    pub fn text(&self) -> String {
        self.parts
            .iter()
            .filter_map(|part| match part {
                UserPart::Text { text } => Some(text.as_str()),
                UserPart::File { .. } => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn to_ui(&self) -> UiMessage {
        UiMessage {
            id: self.id,
            role: MessageRole::User,
            parts: self
                .parts
                .iter()
                .filter_map(|p| serde_json::to_value(p).ok())
                .collect(),
            metadata: None,
        }
    }
}

/// Message as exchanged with the UI. Parts are kept as opaque JSON so tool
/// parts round-trip untouched.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UiMessage {
    pub id: Uuid,
    pub role: MessageRole,
    #[serde(default)]
    pub parts: Vec<JsonValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<JsonValue>,
}

impl UiMessage {
    /// Text of all `text` parts, newline separated
    pub fn text(&self) -> String {
        self.parts
            .iter()
            .filter(|p| p.get("type").and_then(JsonValue::as_str) == Some("text"))
            .filter_map(|p| p.get("text").and_then(JsonValue::as_str))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

impl From<&message::Model> for UiMessage {
    fn from(row: &message::Model) -> Self {
        let created_at: DateTime<Utc> = row.created_at.into();
        Self {
            id: row.id,
            role: row.role,
            parts: row.parts.as_array().cloned().unwrap_or_default(),
            metadata: Some(serde_json::json!({ "createdAt": created_at.to_rfc3339() })),
        }
    }
}

/// One event of a streamed chat response
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum UiChunk {
    Start {
        message_id: Uuid,
    },
    StartStep,
    TextStart {
        id: String,
    },
    TextDelta {
        id: String,
        delta: String,
    },
    TextEnd {
        id: String,
    },
    ReasoningStart {
        id: String,
    },
    ReasoningDelta {
        id: String,
        delta: String,
    },
    ReasoningEnd {
        id: String,
    },
    ToolInputAvailable {
        tool_call_id: String,
        tool_name: String,
        input: JsonValue,
    },
    ToolOutputAvailable {
        tool_call_id: String,
        output: JsonValue,
    },
    FinishStep,
    Finish,
    Error {
        error_text: String,
    },
    #[serde(rename = "data-chat-title")]
    ChatTitle {
        data: String,
    },
    /// Carries a serialized [`UiMessage`] for a client that missed the end of a stream
    #[serde(rename = "data-appendMessage")]
    AppendMessage {
        data: String,
        transient: bool,
    },
}

impl UiChunk {
    /// JSON payload of the SSE frame
    pub fn to_frame(&self) -> String {
        // Every variant is a plain struct of strings and JSON values
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Terminal frame of every chat stream
pub const DONE_FRAME: &str = "[DONE]";
