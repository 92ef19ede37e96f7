//! # Chat Handlers
//!
//! Chat turns, stream resumption and chat deletion.

use std::convert::Infallible;
use std::time::Duration;

use axum::{
    extract::{Path, Query, State, rejection::JsonRejection},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{
        IntoResponse, Json, Response,
        sse::{Event, KeepAlive, Sse},
    },
};
use futures::StreamExt;
use serde::Deserialize;
use utoipa::IntoParams;
use uuid::Uuid;

use crate::auth::UserId;
use crate::chat::{ChatRequest, FrameStream, ResumeOutcome};
use crate::error::{ApiError, Surface};
use crate::models::chat;
use crate::server::AppState;

const LAST_EVENT_ID: &str = "last-event-id";

#[derive(Debug, Deserialize, IntoParams)]
pub struct DeleteChatQuery {
    /// Chat to delete
    pub id: Option<String>,
}

/// Wraps frames in an SSE response.
fn sse_response(frames: FrameStream) -> Response {
    let events = frames.map(|frame| {
        Ok::<_, Infallible>(Event::default().id(frame.id.to_string()).data(frame.data))
    });

    let mut response = Sse::new(events)
        .keep_alive(KeepAlive::new().interval(Duration::from_secs(15)))
        .into_response();
    let headers = response.headers_mut();
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
    response
}

fn parse_chat_id(raw: &str) -> Result<Uuid, ApiError> {
    Uuid::parse_str(raw)
        .map_err(|e| ApiError::bad_request(Surface::Api).with_cause(format!("invalid chat id: {}", e)))
}

/// Send a message
///
/// Streams the reply as Server-Sent Events. Each event carries one JSON UI
/// chunk; the final event is `[DONE]`.
#[utoipa::path(
    post,
    path = "/api/chat",
    request_body = ChatRequest,
    security(("bearer_auth" = [])),
    responses(
        (status = 200, description = "Event stream of UI chunks", body = String, content_type = "text/event-stream"),
        (status = 400, description = "Invalid request", body = ApiError),
        (status = 401, description = "Missing or invalid session", body = ApiError),
        (status = 403, description = "Chat belongs to another user", body = ApiError),
        (status = 503, description = "Message could not be processed", body = ApiError)
    ),
    tag = "chat"
)]
pub async fn post_chat(
    State(state): State<AppState>,
    user: Option<UserId>,
    body: Result<Json<ChatRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(request) = body.map_err(ApiError::from)?;
    let frames = state.chat.start_turn(user.as_ref(), request).await?;
    Ok(sse_response(frames))
}

/// Resume a chat stream
///
/// Replays the newest stream of a chat after `Last-Event-ID` and follows it
/// live. Answers 204 when resumable streams are disabled.
#[utoipa::path(
    get,
    path = "/api/chat/{id}/stream",
    security(("bearer_auth" = [])),
    params(
        ("id" = String, Path, description = "Chat id"),
        ("Last-Event-ID" = Option<u64>, Header, description = "Last event the client received")
    ),
    responses(
        (status = 200, description = "Event stream of UI chunks", body = String, content_type = "text/event-stream"),
        (status = 204, description = "Resumable streams are disabled"),
        (status = 401, description = "Missing or invalid session", body = ApiError),
        (status = 403, description = "Private chat of another user", body = ApiError),
        (status = 404, description = "Chat or stream not found", body = ApiError)
    ),
    tag = "chat"
)]
pub async fn resume_stream(
    State(state): State<AppState>,
    user: Option<UserId>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let chat_id = parse_chat_id(&id)?;
    let last_event_id = headers
        .get(LAST_EVENT_ID)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok());

    match state.chat.resume(user.as_ref(), chat_id, last_event_id).await? {
        ResumeOutcome::NoContent => Ok(StatusCode::NO_CONTENT.into_response()),
        ResumeOutcome::Stream(frames) => Ok(sse_response(frames)),
    }
}

/// Delete a chat
#[utoipa::path(
    delete,
    path = "/api/chat",
    security(("bearer_auth" = [])),
    params(DeleteChatQuery),
    responses(
        (status = 200, description = "The deleted chat", body = chat::Model),
        (status = 400, description = "Missing or invalid id", body = ApiError),
        (status = 401, description = "Missing or invalid session", body = ApiError),
        (status = 403, description = "Chat belongs to another user", body = ApiError)
    ),
    tag = "chat"
)]
pub async fn delete_chat(
    State(state): State<AppState>,
    user: Option<UserId>,
    Query(query): Query<DeleteChatQuery>,
) -> Result<Json<chat::Model>, ApiError> {
    let chat_id = query
        .id
        .as_deref()
        .filter(|id| !id.is_empty())
        .map(parse_chat_id)
        .transpose()?;
    let deleted = state.chat.delete(user.as_ref(), chat_id).await?;
    Ok(Json(deleted))
}
