//! # Chat
//!
//! Chat turns streamed as Server-Sent Events:
//! - `schema`: request body, UI messages and stream chunks
//! - `model`: the inference collaborator behind [`ModelInvoker`]
//! - `stream_context`: resumable storage of a turn's frames
//! - `controller`: the turn, resume and delete flows

pub mod controller;
pub mod model;
pub mod schema;
pub mod stream_context;

pub use controller::{ChatError, ChatService, ResumeOutcome};
pub use model::{EchoModelInvoker, HttpModelInvoker, ModelError, ModelEvent, ModelEventStream, ModelInvoker, ModelRequest};
pub use schema::{ChatRequest, UiChunk, UiMessage};
pub use stream_context::{Frame, FrameStream, MemoryStreamStore, StreamContext, StreamStore};

use std::sync::Arc;

use crate::config::AppConfig;

/// Picks the model invoker for the configuration.
pub fn invoker_from_config(config: &AppConfig) -> Arc<dyn ModelInvoker> {
    match &config.model_api_url {
        Some(url) if !url.trim().is_empty() => {
            Arc::new(HttpModelInvoker::new(url, config.model_api_key.clone()))
        }
        _ => {
            tracing::warn!("MODEL_API_URL is not set, replies will echo the user's message");
            Arc::new(EchoModelInvoker)
        }
    }
}
