//! # Data Models
//!
//! SeaORM entities for connections and chat persistence.

pub mod chat;
pub mod connection;
pub mod message;
pub mod stream;

pub use chat::{Entity as Chat, Visibility};
pub use connection::{ConnectionStatus, Entity as Connection};
pub use message::{Entity as Message, MessageRole};
pub use stream::Entity as Stream;
