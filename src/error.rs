//! # Error Handling
//!
//! Unified error responses for the chatlink API. Every error carries a
//! `type:surface` code, a user-facing message and the request trace id.

use std::fmt;

use axum::{
    extract::rejection::JsonRejection,
    http::{HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;
use utoipa::ToSchema;

use crate::telemetry;

const GENERIC_MESSAGE: &str = "Something went wrong. Please try again later.";

/// Kind of failure; determines the HTTP status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ErrorType {
    #[error("bad_request")]
    BadRequest,
    #[error("unauthorized")]
    Unauthorized,
    #[error("forbidden")]
    Forbidden,
    #[error("not_found")]
    NotFound,
    #[error("rate_limit")]
    RateLimit,
    #[error("offline")]
    Offline,
    #[error("provider")]
    Provider,
}

impl ErrorType {
    /// Get the appropriate HTTP status code for this error type
    pub fn status_code(&self) -> StatusCode {
        match self {
            ErrorType::BadRequest => StatusCode::BAD_REQUEST,
            ErrorType::Unauthorized => StatusCode::UNAUTHORIZED,
            ErrorType::Forbidden => StatusCode::FORBIDDEN,
            ErrorType::NotFound => StatusCode::NOT_FOUND,
            ErrorType::RateLimit => StatusCode::TOO_MANY_REQUESTS,
            ErrorType::Offline => StatusCode::SERVICE_UNAVAILABLE,
            ErrorType::Provider => StatusCode::BAD_GATEWAY,
        }
    }
}

/// Part of the product an error is reported against
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Surface {
    Api,
    Auth,
    Chat,
    Stream,
    Database,
    Connections,
    ActivateGateway,
}

impl Surface {
    pub fn as_str(&self) -> &'static str {
        match self {
            Surface::Api => "api",
            Surface::Auth => "auth",
            Surface::Chat => "chat",
            Surface::Stream => "stream",
            Surface::Database => "database",
            Surface::Connections => "connections",
            Surface::ActivateGateway => "activate_gateway",
        }
    }
}

impl fmt::Display for Surface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn message_for(error_type: ErrorType, surface: Surface) -> &'static str {
    if surface == Surface::Database {
        return "An error occurred while executing a database query.";
    }

    match (error_type, surface) {
        (ErrorType::BadRequest, Surface::Api) => {
            "The request couldn't be processed. Please check your input and try again."
        }
        (ErrorType::BadRequest, Surface::ActivateGateway) => {
            "The model gateway has not been activated for this deployment. Please activate it and try again."
        }
        (ErrorType::Unauthorized, Surface::Auth) => "You need to sign in before continuing.",
        (ErrorType::Forbidden, Surface::Auth) => "Your account does not have access to this feature.",
        (ErrorType::RateLimit, Surface::Chat) => {
            "You have exceeded your maximum number of messages for the day. Please try again later."
        }
        (ErrorType::NotFound, Surface::Chat) => {
            "The requested chat was not found. Please check the chat ID and try again."
        }
        (ErrorType::Forbidden, Surface::Chat) => {
            "This chat belongs to another user. Please check the chat ID and try again."
        }
        (ErrorType::Unauthorized, Surface::Chat) => {
            "You need to sign in to view this chat. Please sign in and try again."
        }
        (ErrorType::Offline, Surface::Chat) => {
            "We're having trouble sending your message. Please check your internet connection and try again."
        }
        (ErrorType::NotFound, Surface::Stream) => "No stream was found for this chat.",
        (ErrorType::Unauthorized, Surface::Connections) => {
            "You need to sign in to manage connections."
        }
        (ErrorType::NotFound, Surface::Connections) => "No connection exists for this provider.",
        (ErrorType::BadRequest, Surface::Connections) => "Invalid provider.",
        (ErrorType::Provider, _) => "The upstream provider returned an error. Please try again later.",
        _ => GENERIC_MESSAGE,
    }
}

/// Unified API error response structure
#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ApiError {
    #[serde(skip_serializing)]
    pub status: StatusCode,
    /// `type:surface` code for programmatic handling
    pub code: Box<str>,
    /// Human-readable error message
    pub message: Box<str>,
    /// Extra detail about the failure (optional)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cause: Option<Box<str>>,
    /// Correlation trace ID for debugging
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<Box<str>>,
    #[serde(skip_serializing)]
    pub retry_after: Option<u64>,
    #[serde(skip_serializing)]
    surface: Option<Surface>,
}

impl ApiError {
    /// Create an error for `error_type` reported against `surface`
    pub fn new(error_type: ErrorType, surface: Surface) -> Self {
        Self {
            status: error_type.status_code(),
            code: format!("{}:{}", error_type, surface).into_boxed_str(),
            message: message_for(error_type, surface).into(),
            cause: None,
            trace_id: Self::current_trace_id(),
            retry_after: None,
            surface: Some(surface),
        }
    }

    /// Attach a cause string
    pub fn with_cause<S: Into<String>>(mut self, cause: S) -> Self {
        self.cause = Some(cause.into().into_boxed_str());
        self
    }

    /// Set retry after delay
    pub fn with_retry_after(mut self, seconds: u64) -> Self {
        self.retry_after = Some(seconds);
        self
    }

    pub fn bad_request(surface: Surface) -> Self {
        Self::new(ErrorType::BadRequest, surface)
    }

    pub fn unauthorized(surface: Surface) -> Self {
        Self::new(ErrorType::Unauthorized, surface)
    }

    pub fn forbidden(surface: Surface) -> Self {
        Self::new(ErrorType::Forbidden, surface)
    }

    pub fn not_found(surface: Surface) -> Self {
        Self::new(ErrorType::NotFound, surface)
    }

    pub fn offline(surface: Surface) -> Self {
        Self::new(ErrorType::Offline, surface)
    }

    /// Database failure: details are logged, the client sees a generic message
    pub fn database<E: fmt::Debug>(error: E) -> Self {
        tracing::error!(error = ?error, "Database error");
        Self::new(ErrorType::Offline, Surface::Database)
    }

    fn current_trace_id() -> Option<Box<str>> {
        telemetry::current_trace_id()
            .map(|trace_id| trace_id.into_boxed_str())
            .or_else(|| {
                Some(format!("corr-{}", &uuid::Uuid::new_v4().to_string()[..8]).into_boxed_str())
            })
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for ApiError {}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut headers = HeaderMap::new();
        headers.insert("content-type", HeaderValue::from_static("application/json"));

        if let Some(retry_after) = self.retry_after
            && let Ok(header_value) = HeaderValue::from_str(&retry_after.to_string())
        {
            headers.insert("retry-after", header_value);
        }

        // Database errors never leak their cause or code.
        if self.surface == Some(Surface::Database) {
            let body = serde_json::json!({
                "code": "",
                "message": GENERIC_MESSAGE,
                "traceId": self.trace_id,
            });
            return (self.status, headers, axum::Json(body)).into_response();
        }

        (self.status, headers, axum::Json(self)).into_response()
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(error: anyhow::Error) -> Self {
        Self::database(error)
    }
}

impl From<sea_orm::DbErr> for ApiError {
    fn from(error: sea_orm::DbErr) -> Self {
        match error {
            sea_orm::DbErr::RecordNotFound(record) => {
                tracing::debug!(%record, "Record not found");
                Self::not_found(Surface::Api)
            }
            other => Self::database(other),
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        let cause = match rejection {
            JsonRejection::JsonDataError(err) => format!("Invalid JSON: {}", err.body_text()),
            JsonRejection::JsonSyntaxError(err) => format!("JSON syntax error: {}", err.body_text()),
            JsonRejection::MissingJsonContentType(_) => {
                "Missing 'Content-Type: application/json' header".to_string()
            }
            _ => "Invalid request body".to_string(),
        };

        Self::bad_request(Surface::Api).with_cause(cause)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[test]
    fn test_code_and_status_from_type() {
        let cases = [
            (ErrorType::BadRequest, Surface::Api, 400, "bad_request:api"),
            (ErrorType::Unauthorized, Surface::Chat, 401, "unauthorized:chat"),
            (ErrorType::Forbidden, Surface::Chat, 403, "forbidden:chat"),
            (ErrorType::NotFound, Surface::Stream, 404, "not_found:stream"),
            (ErrorType::RateLimit, Surface::Chat, 429, "rate_limit:chat"),
            (ErrorType::Offline, Surface::Chat, 503, "offline:chat"),
            (ErrorType::Provider, Surface::Connections, 502, "provider:connections"),
        ];

        for (error_type, surface, status, code) in cases {
            let error = ApiError::new(error_type, surface);
            assert_eq!(error.status.as_u16(), status);
            assert_eq!(&*error.code, code);
        }
    }

    #[test]
    fn test_chat_messages() {
        assert_eq!(
            &*ApiError::forbidden(Surface::Chat).message,
            "This chat belongs to another user. Please check the chat ID and try again."
        );
        assert_eq!(
            &*ApiError::offline(Surface::Chat).message,
            "We're having trouble sending your message. Please check your internet connection and try again."
        );
        assert_eq!(&*ApiError::not_found(Surface::Auth).message, GENERIC_MESSAGE);
    }

    #[test]
    fn test_trace_id_fallback() {
        let error = ApiError::bad_request(Surface::Api);
        assert!(error.trace_id.as_deref().unwrap().starts_with("corr-"));
    }

    #[tokio::test]
    async fn test_trace_id_from_context() {
        let context = telemetry::TraceContext {
            trace_id: "req-123".to_string(),
        };
        let error = telemetry::with_trace_context(context, async {
            ApiError::unauthorized(Surface::Chat)
        })
        .await;
        assert_eq!(error.trace_id.as_deref(), Some("req-123"));
    }

    #[tokio::test]
    async fn test_into_response_shape() {
        let response = ApiError::bad_request(Surface::Api)
            .with_cause("text too long")
            .into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            response.headers().get("content-type").unwrap(),
            "application/json"
        );

        let body = body_json(response).await;
        assert_eq!(body["code"], "bad_request:api");
        assert_eq!(body["cause"], "text too long");
        assert!(body.get("traceId").is_some());
        assert!(body.get("status").is_none());
    }

    #[tokio::test]
    async fn test_database_errors_are_masked() {
        let error: ApiError = sea_orm::DbErr::Custom("relation chats does not exist".into()).into();
        let response = error.with_cause("secret detail").into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        let body = body_json(response).await;
        assert_eq!(body["code"], "");
        assert_eq!(body["message"], GENERIC_MESSAGE);
        assert!(body.get("cause").is_none());
    }

    #[tokio::test]
    async fn test_retry_after_header() {
        let response = ApiError::new(ErrorType::RateLimit, Surface::Chat)
            .with_retry_after(60)
            .into_response();
        assert_eq!(response.headers().get("retry-after").unwrap(), "60");
    }

    #[test]
    fn test_record_not_found_maps_to_404() {
        let error: ApiError = sea_orm::DbErr::RecordNotFound("chat".into()).into();
        assert_eq!(error.status, StatusCode::NOT_FOUND);
    }
}
