//! # Repository Layer
//!
//! Thin SeaORM wrappers, one per table, returning `anyhow::Result`.

pub mod chat;
pub mod connection;
pub mod message;
pub mod stream;

pub use chat::ChatRepository;
pub use connection::{ConnectionRepository, NewConnection, ProviderStatus};
pub use message::{MessageRepository, NewMessage, TokenUsage};
pub use stream::StreamRepository;
