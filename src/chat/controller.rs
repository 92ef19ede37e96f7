//! Chat turn orchestration
//!
//! A turn persists the user's message, registers a stream id, starts the
//! model and hands back a stream of SSE frames. Generation runs in its own
//! task and persists the assistant message when it ends, whether or not the
//! client is still reading.

use std::sync::Arc;

use chrono::{Duration, Utc};
use futures::stream::{self, StreamExt};
use metrics::counter;
use serde_json::{Value as JsonValue, json};
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

use super::model::{ModelError, ModelEvent, ModelEventStream, ModelInvoker, ModelRequest, Usage};
use super::schema::{ChatRequest, DONE_FRAME, UiChunk, UiMessage, UserMessage, ValidationError};
use super::stream_context::{Frame, FrameStream, StreamContext, StreamContextError, StreamOutput};
use crate::auth::UserId;
use crate::error::{ApiError, ErrorType, Surface};
use crate::models::chat::{self, Visibility};
use crate::models::MessageRole;
use crate::repositories::{ChatRepository, MessageRepository, NewMessage, StreamRepository};

pub const DEFAULT_CHAT_TITLE: &str = "New chat";

/// The only error text a client ever sees mid-stream
pub const STREAM_ERROR_TEXT: &str = "Oops, an error occurred!";

/// Retry-After sent when the model API did not name one
const DEFAULT_RETRY_AFTER_SECONDS: u64 = 60;

const GATEWAY_ACTIVATION_MESSAGE: &str =
    "AI Gateway requires a valid credit card on file to service requests";

/// How recent a finished assistant message must be to be handed to a resuming client
const APPEND_MESSAGE_WINDOW_SECONDS: i64 = 15;

#[derive(Debug, Error)]
pub enum ChatError {
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error("invalid request: {0}")]
    Validation(#[from] ValidationError),
    #[error("persistence failed: {0}")]
    Store(#[from] anyhow::Error),
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error(transparent)]
    StreamContext(#[from] StreamContextError),
}

impl From<ChatError> for ApiError {
    fn from(error: ChatError) -> Self {
        match error {
            ChatError::Api(api) => api,
            ChatError::Validation(invalid) => {
                ApiError::bad_request(Surface::Api).with_cause(invalid.to_string())
            }
            ChatError::Model(ModelError::RateLimited { retry_after }) => {
                ApiError::new(ErrorType::RateLimit, Surface::Chat)
                    .with_retry_after(retry_after.unwrap_or(DEFAULT_RETRY_AFTER_SECONDS))
            }
            other if other.to_string().contains(GATEWAY_ACTIVATION_MESSAGE) => {
                ApiError::bad_request(Surface::ActivateGateway)
            }
            other => {
                tracing::error!(error = %other, "Chat request failed");
                ApiError::offline(Surface::Chat)
            }
        }
    }
}

/// Result of a resume request
pub enum ResumeOutcome {
    /// Resumption is not available
    NoContent,
    Stream(FrameStream),
}

#[derive(Clone)]
pub struct ChatService {
    chats: ChatRepository,
    messages: MessageRepository,
    streams: StreamRepository,
    invoker: Arc<dyn ModelInvoker>,
    stream_context: Arc<StreamContext>,
    chat_models: Arc<Vec<String>>,
}

impl ChatService {
    pub fn new(
        chats: ChatRepository,
        messages: MessageRepository,
        streams: StreamRepository,
        invoker: Arc<dyn ModelInvoker>,
        stream_context: Arc<StreamContext>,
        chat_models: Vec<String>,
    ) -> Self {
        Self {
            chats,
            messages,
            streams,
            invoker,
            stream_context,
            chat_models: Arc::new(chat_models),
        }
    }

    /// Runs one chat turn and returns its SSE frames.
    pub async fn start_turn(
        &self,
        user: Option<&UserId>,
        request: ChatRequest,
    ) -> Result<FrameStream, ChatError> {
        request.validate(&self.chat_models)?;
        let user = user.ok_or_else(|| ApiError::unauthorized(Surface::Chat))?;
        let chat_id = request.id;
        let is_tool_approval = request.is_tool_approval();

        let mut history = Vec::new();
        let mut title_source = None;
        match self.chats.find_by_id(chat_id).await? {
            Some(chat) => {
                if chat.user_id != user.as_str() {
                    return Err(ApiError::forbidden(Surface::Chat).into());
                }
                if !is_tool_approval {
                    history = self
                        .messages
                        .list_by_chat(chat_id)
                        .await?
                        .iter()
                        .map(UiMessage::from)
                        .collect();
                }
            }
            None => {
                let Some(message) = &request.message else {
                    return Err(ApiError::not_found(Surface::Chat).into());
                };
                self.chats
                    .save(chat_id, user.as_str(), DEFAULT_CHAT_TITLE, request.selected_visibility_type)
                    .await?;
                title_source = Some(message.clone());
            }
        }

        let ui_messages = match (&request.messages, &request.message) {
            (Some(messages), _) => messages.clone(),
            (None, Some(message)) => {
                history.push(message.to_ui());
                history
            }
            (None, None) => history,
        };

        if let Some(message) = &request.message {
            self.save_user_message(chat_id, message).await?;
        }

        let stream_id = Uuid::new_v4();
        self.streams.create(stream_id, chat_id).await?;

        let model = request.selected_chat_model.clone();
        let model_request = ModelRequest::for_model(&model, ui_messages.clone());
        let max_steps = model_request.max_steps;
        let events = self.invoker.stream(model_request).await?;

        counter!("chat_turns_total", "model" => model.clone()).increment(1);
        tracing::info!(%chat_id, %stream_id, user_id = %user, model = %model, is_tool_approval, "Starting chat turn");

        let (tx, rx) = mpsc::unbounded_channel();

        if let Some(message) = title_source {
            self.spawn_title(chat_id, message, tx.clone());
        }

        let draft = AssistantDraft::for_turn(&ui_messages, is_tool_approval);
        let resubmitted = if is_tool_approval {
            ui_messages.into_iter().filter(|m| m.id != draft.id).collect()
        } else {
            Vec::new()
        };
        let turn = Turn {
            chat_id,
            draft,
            resubmitted,
            max_steps,
            messages: self.messages.clone(),
            tx,
        };
        tokio::spawn(turn.run(events));

        // `None` marks the end of the turn; a title still pending then is only stored
        let source = stream::unfold(rx, |mut rx| async move {
            rx.recv()
                .await
                .flatten()
                .map(|chunk: UiChunk| (chunk.to_frame(), rx))
        })
        .chain(stream::once(async { DONE_FRAME.to_string() }))
        .boxed();

        Ok(match self.stream_context.resumable_stream(stream_id, source).await {
            StreamOutput::Resumable(reader) => reader,
            StreamOutput::Plain(source) => number_frames(source),
        })
    }

    async fn save_user_message(&self, chat_id: Uuid, message: &UserMessage) -> Result<(), ChatError> {
        let ui = message.to_ui();
        self.messages
            .save_many(vec![NewMessage {
                id: message.id,
                chat_id,
                role: MessageRole::User,
                parts: JsonValue::Array(ui.parts),
                attachments: json!([]),
                created_at: Utc::now(),
                usage: None,
            }])
            .await?;
        Ok(())
    }

    fn spawn_title(&self, chat_id: Uuid, message: UserMessage, tx: mpsc::UnboundedSender<Option<UiChunk>>) {
        let invoker = self.invoker.clone();
        let chats = self.chats.clone();
        tokio::spawn(async move {
            let title = match invoker.generate_title(&message).await {
                Ok(title) => title,
                Err(error) => {
                    tracing::warn!(%chat_id, %error, "Title generation failed");
                    return;
                }
            };
            let _ = tx.send(Some(UiChunk::ChatTitle { data: title.clone() }));
            if let Err(error) = chats.update_title(chat_id, &title).await {
                tracing::error!(%chat_id, error = %error, "Failed to store chat title");
            }
        });
    }

    /// Reattaches a client to the newest stream of a chat.
    pub async fn resume(
        &self,
        user: Option<&UserId>,
        chat_id: Uuid,
        last_event_id: Option<u64>,
    ) -> Result<ResumeOutcome, ChatError> {
        match self.stream_context.store().await {
            Ok(Some(_)) => {}
            Ok(None) => return Ok(ResumeOutcome::NoContent),
            Err(error) => {
                tracing::error!(%error, "Stream store unavailable");
                return Ok(ResumeOutcome::NoContent);
            }
        }

        let user = user.ok_or_else(|| ApiError::unauthorized(Surface::Chat))?;
        let chat = self
            .chats
            .find_by_id(chat_id)
            .await?
            .ok_or_else(|| ApiError::not_found(Surface::Chat))?;
        if chat.visibility == Visibility::Private && chat.user_id != user.as_str() {
            return Err(ApiError::forbidden(Surface::Chat).into());
        }

        let newest = self
            .streams
            .list_ids_by_chat(chat_id)
            .await?
            .pop()
            .ok_or_else(|| ApiError::not_found(Surface::Stream))?;

        if let Some(frames) = self
            .stream_context
            .resume_existing_stream(newest, last_event_id)
            .await?
        {
            tracing::debug!(%chat_id, stream_id = %newest, ?last_event_id, "Resuming live stream");
            return Ok(ResumeOutcome::Stream(frames));
        }

        // The stream already ended; hand over a just-finished reply if there is one
        let messages = self.messages.list_by_chat(chat_id).await?;
        let recent = messages.last().filter(|m| {
            let age = Utc::now().signed_duration_since(m.created_at);
            m.role == MessageRole::Assistant && age <= Duration::seconds(APPEND_MESSAGE_WINDOW_SECONDS)
        });

        let Some(message) = recent else {
            return Ok(ResumeOutcome::Stream(stream::empty().boxed()));
        };

        let data = serde_json::to_string(&UiMessage::from(message)).map_err(anyhow::Error::from)?;
        let frames = vec![
            UiChunk::AppendMessage { data, transient: true }.to_frame(),
            DONE_FRAME.to_string(),
        ];
        Ok(ResumeOutcome::Stream(number_frames(stream::iter(frames).boxed())))
    }

    /// Deletes a chat with its messages and streams.
    pub async fn delete(&self, user: Option<&UserId>, chat_id: Option<Uuid>) -> Result<chat::Model, ChatError> {
        let chat_id = chat_id.ok_or_else(|| ApiError::bad_request(Surface::Api))?;
        let user = user.ok_or_else(|| ApiError::unauthorized(Surface::Chat))?;

        let owned = self
            .chats
            .find_by_id(chat_id)
            .await?
            .is_some_and(|chat| chat.user_id == user.as_str());
        if !owned {
            return Err(ApiError::forbidden(Surface::Chat).into());
        }

        let deleted = self
            .chats
            .delete_by_id(chat_id)
            .await?
            .ok_or_else(|| ApiError::not_found(Surface::Chat))?;
        tracing::info!(%chat_id, user_id = %user, "Deleted chat");
        Ok(deleted)
    }
}

fn number_frames(source: futures::stream::BoxStream<'static, String>) -> FrameStream {
    source
        .enumerate()
        .map(|(i, data)| Frame { id: i as u64 + 1, data })
        .boxed()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OpenKind {
    Text,
    Reasoning,
}

#[derive(Debug)]
struct OpenPart {
    kind: OpenKind,
    id: String,
    index: usize,
}

/// The assistant message being assembled from model events
#[derive(Debug)]
struct AssistantDraft {
    id: Uuid,
    parts: Vec<JsonValue>,
    open: Option<OpenPart>,
    usage: Option<Usage>,
    next_part: usize,
}

impl AssistantDraft {
    /// A tool-approval turn continues the trailing assistant message.
    fn for_turn(ui_messages: &[UiMessage], is_tool_approval: bool) -> Self {
        let continued = ui_messages
            .last()
            .filter(|m| is_tool_approval && m.role == MessageRole::Assistant);
        Self {
            id: continued.map(|m| m.id).unwrap_or_else(Uuid::new_v4),
            parts: continued.map(|m| m.parts.clone()).unwrap_or_default(),
            open: None,
            usage: None,
            next_part: 0,
        }
    }
}

struct Turn {
    chat_id: Uuid,
    draft: AssistantDraft,
    /// Messages sent back by the client on a tool-approval turn, minus the draft
    resubmitted: Vec<UiMessage>,
    max_steps: u32,
    messages: MessageRepository,
    tx: mpsc::UnboundedSender<Option<UiChunk>>,
}

impl Turn {
    fn send(&self, chunk: UiChunk) {
        // The client may be gone; generation carries on regardless
        let _ = self.tx.send(Some(chunk));
    }

    async fn run(mut self, events: ModelEventStream) {
        let tx = self.tx.clone();
        self.generate(events).await;
        self.persist().await;
        let _ = tx.send(None);
    }

    async fn generate(&mut self, mut events: ModelEventStream) {
        self.send(UiChunk::Start { message_id: self.draft.id });

        let mut finished = false;
        let mut failed = false;
        let mut steps = 0u32;
        while let Some(event) = events.next().await {
            match event {
                Ok(ModelEvent::StepStart) if steps == self.max_steps => {
                    tracing::warn!(chat_id = %self.chat_id, max_steps = self.max_steps, "Step limit reached");
                    break;
                }
                Ok(ModelEvent::StepStart) => {
                    steps += 1;
                    self.apply(ModelEvent::StepStart);
                }
                Ok(ModelEvent::Finish { usage }) => {
                    self.close_open();
                    self.draft.usage = usage;
                    self.send(UiChunk::Finish);
                    finished = true;
                }
                Ok(event) => self.apply(event),
                Err(error) => {
                    tracing::error!(chat_id = %self.chat_id, %error, "Model stream failed");
                    counter!("chat_stream_errors_total").increment(1);
                    self.close_open();
                    self.send(UiChunk::Error {
                        error_text: STREAM_ERROR_TEXT.to_string(),
                    });
                    failed = true;
                    break;
                }
            }
        }

        if !finished && !failed {
            self.close_open();
            self.send(UiChunk::Finish);
        }
    }

    fn apply(&mut self, event: ModelEvent) {
        match event {
            ModelEvent::StepStart => {
                self.close_open();
                self.draft.parts.push(json!({ "type": "step-start" }));
                self.send(UiChunk::StartStep);
            }
            ModelEvent::TextDelta(delta) => self.append(OpenKind::Text, delta),
            ModelEvent::ReasoningDelta(delta) => self.append(OpenKind::Reasoning, delta),
            ModelEvent::ToolCall { id, name, input } => {
                self.close_open();
                self.draft.parts.push(json!({
                    "type": format!("tool-{}", name),
                    "toolCallId": id,
                    "state": "input-available",
                    "input": input,
                }));
                self.send(UiChunk::ToolInputAvailable {
                    tool_call_id: id,
                    tool_name: name,
                    input,
                });
            }
            ModelEvent::ToolResult { id, output } => {
                let part = self
                    .draft
                    .parts
                    .iter_mut()
                    .find(|p| p.get("toolCallId").and_then(JsonValue::as_str) == Some(id.as_str()));
                if let Some(part) = part {
                    part["state"] = json!("output-available");
                    part["output"] = output.clone();
                }
                self.send(UiChunk::ToolOutputAvailable {
                    tool_call_id: id,
                    output,
                });
            }
            ModelEvent::StepFinish => {
                self.close_open();
                self.send(UiChunk::FinishStep);
            }
            ModelEvent::Finish { usage } => self.draft.usage = usage,
        }
    }

    fn append(&mut self, kind: OpenKind, delta: String) {
        if self.draft.open.as_ref().is_some_and(|open| open.kind != kind) {
            self.close_open();
        }

        if self.draft.open.is_none() {
            self.draft.next_part += 1;
            let (part_type, id) = match kind {
                OpenKind::Text => ("text", format!("text-{}", self.draft.next_part)),
                OpenKind::Reasoning => ("reasoning", format!("reasoning-{}", self.draft.next_part)),
            };
            self.draft
                .parts
                .push(json!({ "type": part_type, "text": "", "state": "streaming" }));
            self.send(match kind {
                OpenKind::Text => UiChunk::TextStart { id: id.clone() },
                OpenKind::Reasoning => UiChunk::ReasoningStart { id: id.clone() },
            });
            self.draft.open = Some(OpenPart {
                kind,
                id,
                index: self.draft.parts.len() - 1,
            });
        }

        let Some(open) = &self.draft.open else { return };
        let id = open.id.clone();
        if let Some(part) = self.draft.parts.get_mut(open.index) {
            let text = format!("{}{}", part["text"].as_str().unwrap_or_default(), delta);
            part["text"] = JsonValue::String(text);
        }
        self.send(match kind {
            OpenKind::Text => UiChunk::TextDelta { id, delta },
            OpenKind::Reasoning => UiChunk::ReasoningDelta { id, delta },
        });
    }

    fn close_open(&mut self) {
        let Some(open) = self.draft.open.take() else { return };
        if let Some(part) = self.draft.parts.get_mut(open.index) {
            part["state"] = json!("done");
        }
        self.send(match open.kind {
            OpenKind::Text => UiChunk::TextEnd { id: open.id },
            OpenKind::Reasoning => UiChunk::ReasoningEnd { id: open.id },
        });
    }

    async fn persist(self) {
        for message in &self.resubmitted {
            let parts = JsonValue::Array(message.parts.clone());
            if let Err(error) = self.messages.update_parts(message.id, parts).await {
                tracing::warn!(chat_id = %self.chat_id, message_id = %message.id, error = %error, "Failed to update resubmitted message");
            }
        }

        let draft = self.draft;
        if draft.parts.is_empty() {
            return;
        }

        let continued = self.messages.find_by_id(draft.id).await.ok().flatten().is_some();
        let result = if continued {
            let updated = self
                .messages
                .update_parts(draft.id, JsonValue::Array(draft.parts))
                .await;
            match (updated, draft.usage) {
                (Ok(()), Some(usage)) => self.messages.update_usage(draft.id, usage.into()).await,
                (updated, _) => updated,
            }
        } else {
            self.messages
                .save_many(vec![NewMessage {
                    id: draft.id,
                    chat_id: self.chat_id,
                    role: MessageRole::Assistant,
                    parts: JsonValue::Array(draft.parts),
                    attachments: json!([]),
                    created_at: Utc::now(),
                    usage: draft.usage.map(Into::into),
                }])
                .await
        };

        if let Err(error) = result {
            tracing::error!(chat_id = %self.chat_id, message_id = %draft.id, error = %error, "Failed to persist assistant message");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn turn() -> (Turn, mpsc::UnboundedReceiver<Option<UiChunk>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let db = Arc::new(sea_orm::DatabaseConnection::Disconnected);
        let turn = Turn {
            chat_id: Uuid::new_v4(),
            draft: AssistantDraft::for_turn(&[], false),
            resubmitted: Vec::new(),
            max_steps: 2,
            messages: MessageRepository::new(db),
            tx,
        };
        (turn, rx)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<Option<UiChunk>>) -> Vec<UiChunk> {
        let mut chunks = Vec::new();
        while let Ok(Some(chunk)) = rx.try_recv() {
            chunks.push(chunk);
        }
        chunks
    }

    #[test]
    fn test_events_merge_into_parts() {
        let (mut turn, mut rx) = turn();
        turn.apply(ModelEvent::StepStart);
        turn.apply(ModelEvent::ReasoningDelta("hmm".into()));
        turn.apply(ModelEvent::TextDelta("Hel".into()));
        turn.apply(ModelEvent::TextDelta("lo".into()));
        turn.apply(ModelEvent::ToolCall {
            id: "c1".into(),
            name: "getWeather".into(),
            input: json!({"city": "Oslo"}),
        });
        turn.apply(ModelEvent::ToolResult {
            id: "c1".into(),
            output: json!({"temp": 3}),
        });
        turn.apply(ModelEvent::StepFinish);

        let chunks = drain(&mut rx);
        assert_eq!(chunks[0], UiChunk::StartStep);
        assert_eq!(chunks[1], UiChunk::ReasoningStart { id: "reasoning-1".into() });
        assert_eq!(chunks[3], UiChunk::ReasoningEnd { id: "reasoning-1".into() });
        assert_eq!(chunks[4], UiChunk::TextStart { id: "text-2".into() });
        assert_eq!(chunks[7], UiChunk::TextEnd { id: "text-2".into() });
        assert_eq!(chunks.last(), Some(&UiChunk::FinishStep));

        let parts = &turn.draft.parts;
        assert_eq!(parts[0], json!({"type": "step-start"}));
        assert_eq!(parts[1]["text"], "hmm");
        assert_eq!(parts[2], json!({"type": "text", "text": "Hello", "state": "done"}));
        assert_eq!(parts[3]["state"], "output-available");
        assert_eq!(parts[3]["output"], json!({"temp": 3}));
    }

    #[tokio::test]
    async fn test_steps_beyond_the_limit_are_dropped() {
        let (mut turn, mut rx) = turn();
        let events = stream::iter((0..4).flat_map(|i| {
            [
                Ok(ModelEvent::StepStart),
                Ok(ModelEvent::TextDelta(format!("step {i}"))),
                Ok(ModelEvent::StepFinish),
            ]
        }))
        .boxed();
        turn.generate(events).await;

        let chunks = drain(&mut rx);
        let steps = chunks.iter().filter(|c| **c == UiChunk::StartStep).count();
        assert_eq!(steps, 2);
        assert_eq!(chunks.last(), Some(&UiChunk::Finish));
        assert_eq!(turn.draft.parts.len(), 4);
    }

    #[test]
    fn test_tool_approval_continues_assistant_message() {
        let assistant = UiMessage {
            id: Uuid::new_v4(),
            role: MessageRole::Assistant,
            parts: vec![json!({"type": "text", "text": "earlier"})],
            metadata: None,
        };
        let draft = AssistantDraft::for_turn(std::slice::from_ref(&assistant), true);
        assert_eq!(draft.id, assistant.id);
        assert_eq!(draft.parts.len(), 1);

        let draft = AssistantDraft::for_turn(std::slice::from_ref(&assistant), false);
        assert_ne!(draft.id, assistant.id);
        assert!(draft.parts.is_empty());
    }

    #[test]
    fn test_outer_error_mapping() {
        let api: ApiError = ChatError::Api(ApiError::forbidden(Surface::Chat)).into();
        assert_eq!(&*api.code, "forbidden:chat");

        let api: ApiError = ChatError::Model(ModelError::Upstream {
            status: 403,
            body: GATEWAY_ACTIVATION_MESSAGE.to_string(),
        })
        .into();
        assert_eq!(&*api.code, "bad_request:activate_gateway");

        let api: ApiError = ChatError::Model(ModelError::RateLimited { retry_after: Some(30) }).into();
        assert_eq!(&*api.code, "rate_limit:chat");
        assert_eq!(api.retry_after, Some(30));

        let api: ApiError = ChatError::Model(ModelError::Network("reset".into())).into();
        assert_eq!(&*api.code, "offline:chat");

        let api: ApiError = ChatError::Validation(ValidationError::MissingMessage).into();
        assert_eq!(&*api.code, "bad_request:api");
    }
}
