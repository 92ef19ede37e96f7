//! Model collaborator
//!
//! Inference lives behind [`ModelInvoker`]. The controller only sees a
//! stream of [`ModelEvent`]s and turns them into UI chunks.

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use serde::Deserialize;
use serde_json::{Value as JsonValue, json};
use thiserror::Error;

use super::schema::{UiMessage, UserMessage};
use crate::connectors::trait_::body_snippet;
use crate::models::MessageRole;
use crate::repositories::TokenUsage;

/// Upper bound on model steps per turn
pub const MAX_STEPS: u32 = 5;

/// Thinking budget for reasoning models
pub const THINKING_BUDGET_TOKENS: u32 = 10_000;

/// Tools offered to non-reasoning models
pub const ACTIVE_TOOLS: &[&str] = &["getWeather", "createDocument", "updateDocument", "requestSuggestions"];

pub const SYSTEM_PROMPT: &str =
    "You are a friendly assistant! Keep your responses concise and helpful.";

const TITLE_PROMPT: &str = "Generate a short title for the conversation started by the user's \
message. Summarize the message in at most 80 characters. Do not use quotes or colons.";

pub const MAX_TITLE_LENGTH: usize = 80;

const MODEL_REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("model request failed: {0}")]
    Network(String),
    #[error("model API error {status}: {body}")]
    Upstream { status: u16, body: String },
    #[error("model API rate limit reached")]
    RateLimited { retry_after: Option<u64> },
    #[error("invalid model response: {0}")]
    InvalidResponse(String),
    #[error("model stream failed: {0}")]
    Stream(String),
}

/// How text deltas are re-chunked before reaching the client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Smoothing {
    Word { delay: Duration },
}

/// One generation request
#[derive(Debug, Clone)]
pub struct ModelRequest {
    pub model: String,
    pub system: String,
    pub messages: Vec<UiMessage>,
    pub max_steps: u32,
    pub active_tools: Vec<String>,
    pub smoothing: Option<Smoothing>,
    pub thinking_budget: Option<u32>,
}

impl ModelRequest {
    /// Builds the request for `model`. Reasoning models get no tools, no
    /// smoothing and a thinking budget.
    pub fn for_model(model: &str, messages: Vec<UiMessage>) -> Self {
        let reasoning = is_reasoning_model(model);
        Self {
            model: model.to_string(),
            system: SYSTEM_PROMPT.to_string(),
            messages,
            max_steps: MAX_STEPS,
            active_tools: if reasoning {
                Vec::new()
            } else {
                ACTIVE_TOOLS.iter().map(|t| t.to_string()).collect()
            },
            smoothing: (!reasoning).then_some(Smoothing::Word {
                delay: Duration::from_millis(10),
            }),
            thinking_budget: reasoning.then_some(THINKING_BUDGET_TOKENS),
        }
    }
}

pub fn is_reasoning_model(model: &str) -> bool {
    model.contains("reasoning") || model.contains("thinking")
}

/// Token usage reported at the end of generation
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Usage {
    pub input_tokens: Option<u32>,
    pub output_tokens: Option<u32>,
    pub total_tokens: Option<u32>,
    pub input_token_details: Option<JsonValue>,
    pub output_token_details: Option<JsonValue>,
}

impl From<Usage> for TokenUsage {
    fn from(usage: Usage) -> Self {
        TokenUsage {
            input_token_details: usage.input_token_details,
            output_token_details: usage.output_token_details,
            total_tokens: usage
                .total_tokens
                .or_else(|| Some(usage.input_tokens? + usage.output_tokens?))
                .and_then(|t| i32::try_from(t).ok()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ModelEvent {
    StepStart,
    TextDelta(String),
    ReasoningDelta(String),
    ToolCall {
        id: String,
        name: String,
        input: JsonValue,
    },
    ToolResult {
        id: String,
        output: JsonValue,
    },
    StepFinish,
    Finish { usage: Option<Usage> },
}

pub type ModelEventStream = BoxStream<'static, Result<ModelEvent, ModelError>>;

#[async_trait]
pub trait ModelInvoker: Send + Sync {
    /// Starts generation. Errors returned here happen before any output.
    async fn stream(&self, request: ModelRequest) -> Result<ModelEventStream, ModelError>;

    async fn generate_title(&self, message: &UserMessage) -> Result<String, ModelError>;
}

/// Applies the request's smoothing to an event stream.
pub fn apply_smoothing(events: ModelEventStream, smoothing: Option<Smoothing>) -> ModelEventStream {
    match smoothing {
        Some(Smoothing::Word { delay }) => smooth_words(events, delay),
        None => events,
    }
}

struct WordSmoother {
    inner: ModelEventStream,
    buffer: String,
    ready: VecDeque<Result<ModelEvent, ModelError>>,
    delay: Duration,
    done: bool,
}

impl WordSmoother {
    /// Moves every complete word (word plus trailing whitespace) to `ready`.
    fn drain_words(&mut self) {
        let mut cuts = Vec::new();
        let mut seen_space = false;
        for (i, c) in self.buffer.char_indices() {
            if c.is_whitespace() {
                seen_space = true;
            } else if seen_space {
                cuts.push(i);
                seen_space = false;
            }
        }

        let mut start = 0;
        for cut in cuts {
            self.ready
                .push_back(Ok(ModelEvent::TextDelta(self.buffer[start..cut].to_string())));
            start = cut;
        }
        self.buffer.drain(..start);
    }

    fn flush(&mut self) {
        if !self.buffer.is_empty() {
            let rest = std::mem::take(&mut self.buffer);
            self.ready.push_back(Ok(ModelEvent::TextDelta(rest)));
        }
    }
}

/// Re-chunks text deltas on word boundaries, pausing `delay` between words.
pub fn smooth_words(events: ModelEventStream, delay: Duration) -> ModelEventStream {
    let smoother = WordSmoother {
        inner: events,
        buffer: String::new(),
        ready: VecDeque::new(),
        delay,
        done: false,
    };

    stream::unfold(smoother, |mut s| async move {
        loop {
            if let Some(item) = s.ready.pop_front() {
                if matches!(item, Ok(ModelEvent::TextDelta(_))) && !s.delay.is_zero() {
                    tokio::time::sleep(s.delay).await;
                }
                return Some((item, s));
            }
            if s.done {
                return None;
            }
            match s.inner.next().await {
                Some(Ok(ModelEvent::TextDelta(delta))) => {
                    s.buffer.push_str(&delta);
                    s.drain_words();
                }
                Some(other) => {
                    s.flush();
                    s.ready.push_back(other);
                }
                None => {
                    s.flush();
                    s.done = true;
                }
            }
        }
    })
    .boxed()
}

/// Client for an OpenAI-compatible `/chat/completions` endpoint
pub struct HttpModelInvoker {
    http_client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    choices: Vec<CompletionChoice>,
    #[serde(default)]
    usage: Option<CompletionUsage>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    message: CompletionMessage,
}

#[derive(Debug, Deserialize)]
struct CompletionMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    reasoning_content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<CompletionToolCall>,
}

#[derive(Debug, Deserialize)]
struct CompletionToolCall {
    id: String,
    function: CompletionFunction,
}

#[derive(Debug, Deserialize)]
struct CompletionFunction {
    name: String,
    #[serde(default)]
    arguments: String,
}

#[derive(Debug, Deserialize)]
struct CompletionUsage {
    prompt_tokens: Option<u32>,
    completion_tokens: Option<u32>,
    total_tokens: Option<u32>,
    #[serde(default)]
    prompt_tokens_details: Option<JsonValue>,
    #[serde(default)]
    completion_tokens_details: Option<JsonValue>,
}

impl HttpModelInvoker {
    pub fn new(base_url: &str, api_key: Option<String>) -> Self {
        Self {
            http_client: reqwest::Client::builder()
                .timeout(MODEL_REQUEST_TIMEOUT)
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
        }
    }

    async fn complete(&self, body: JsonValue) -> Result<CompletionResponse, ModelError> {
        let mut request = self
            .http_client
            .post(format!("{}/chat/completions", self.base_url))
            .json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| ModelError::Network(e.to_string()))?;

        let status = response.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse().ok());
            return Err(ModelError::RateLimited { retry_after });
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ModelError::Upstream {
                status: status.as_u16(),
                body: body_snippet(&body),
            });
        }

        response
            .json()
            .await
            .map_err(|e| ModelError::InvalidResponse(e.to_string()))
    }
}

fn wire_message(message: &UiMessage) -> JsonValue {
    let role = match message.role {
        MessageRole::User => "user",
        MessageRole::Assistant => "assistant",
        MessageRole::System => "system",
    };

    let images: Vec<JsonValue> = message
        .parts
        .iter()
        .filter(|p| p.get("type").and_then(JsonValue::as_str) == Some("file"))
        .filter_map(|p| p.get("url").and_then(JsonValue::as_str))
        .map(|url| json!({ "type": "image_url", "image_url": { "url": url } }))
        .collect();

    if images.is_empty() {
        json!({ "role": role, "content": message.text() })
    } else {
        let mut content = vec![json!({ "type": "text", "text": message.text() })];
        content.extend(images);
        json!({ "role": role, "content": content })
    }
}

#[async_trait]
impl ModelInvoker for HttpModelInvoker {
    async fn stream(&self, request: ModelRequest) -> Result<ModelEventStream, ModelError> {
        let mut messages = vec![json!({ "role": "system", "content": request.system })];
        messages.extend(request.messages.iter().map(wire_message));

        let mut body = json!({ "model": request.model, "messages": messages });
        if !request.active_tools.is_empty() {
            body["tools"] = request
                .active_tools
                .iter()
                .map(|name| {
                    json!({
                        "type": "function",
                        "function": { "name": name, "parameters": { "type": "object" } }
                    })
                })
                .collect();
        }
        if let Some(budget) = request.thinking_budget {
            body["thinking"] = json!({ "type": "enabled", "budget_tokens": budget });
        }

        tracing::debug!(model = %request.model, steps = request.max_steps, "Invoking model");
        let response = self.complete(body).await?;
        let choice = response
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| ModelError::InvalidResponse("no choices".to_string()))?;

        let mut events = vec![ModelEvent::StepStart];
        if let Some(reasoning) = choice.message.reasoning_content.filter(|r| !r.is_empty()) {
            events.push(ModelEvent::ReasoningDelta(reasoning));
        }
        if let Some(content) = choice.message.content.filter(|c| !c.is_empty()) {
            events.push(ModelEvent::TextDelta(content));
        }
        for call in choice.message.tool_calls {
            let input = serde_json::from_str(&call.function.arguments).unwrap_or(JsonValue::Null);
            events.push(ModelEvent::ToolCall {
                id: call.id,
                name: call.function.name,
                input,
            });
        }
        events.push(ModelEvent::StepFinish);
        events.push(ModelEvent::Finish {
            usage: response.usage.map(|u| Usage {
                input_tokens: u.prompt_tokens,
                output_tokens: u.completion_tokens,
                total_tokens: u.total_tokens,
                input_token_details: u.prompt_tokens_details,
                output_token_details: u.completion_tokens_details,
            }),
        });

        let events = stream::iter(events.into_iter().map(Ok)).boxed();
        Ok(apply_smoothing(events, request.smoothing))
    }

    async fn generate_title(&self, message: &UserMessage) -> Result<String, ModelError> {
        let body = json!({
            "model": "title-model",
            "messages": [
                { "role": "system", "content": TITLE_PROMPT },
                { "role": "user", "content": message.text() },
            ],
        });
        let response = self.complete(body).await?;
        let title = response
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| ModelError::InvalidResponse("empty title".to_string()))?;
        Ok(clean_title(&title))
    }
}

fn clean_title(raw: &str) -> String {
    let title: String = raw
        .trim()
        .trim_matches(|c| c == '"' || c == '\'')
        .replace(':', "")
        .chars()
        .take(MAX_TITLE_LENGTH)
        .collect();
    if title.trim().is_empty() {
        "New chat".to_string()
    } else {
        title.trim().to_string()
    }
}

/// Deterministic invoker that answers with the user's last text
#[derive(Debug, Clone, Default)]
pub struct EchoModelInvoker;

#[async_trait]
impl ModelInvoker for EchoModelInvoker {
    async fn stream(&self, request: ModelRequest) -> Result<ModelEventStream, ModelError> {
        let prompt = request
            .messages
            .iter()
            .rev()
            .find(|m| m.role == MessageRole::User)
            .map(UiMessage::text)
            .unwrap_or_default();
        let reply = format!("You said: {}", prompt);

        let input_tokens = prompt.split_whitespace().count() as u32;
        let output_tokens = reply.split_whitespace().count() as u32;

        let mut events = vec![ModelEvent::StepStart];
        if request.thinking_budget.is_some() {
            events.push(ModelEvent::ReasoningDelta("Reading the message.".to_string()));
        }
        events.push(ModelEvent::TextDelta(reply));
        events.push(ModelEvent::StepFinish);
        events.push(ModelEvent::Finish {
            usage: Some(Usage {
                input_tokens: Some(input_tokens),
                output_tokens: Some(output_tokens),
                total_tokens: Some(input_tokens + output_tokens),
                ..Default::default()
            }),
        });

        let events = stream::iter(events.into_iter().map(Ok)).boxed();
        Ok(apply_smoothing(events, request.smoothing))
    }

    async fn generate_title(&self, message: &UserMessage) -> Result<String, ModelError> {
        Ok(clean_title(message.text().lines().next().unwrap_or_default()))
    }
}
