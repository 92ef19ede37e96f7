//! # API Handlers
//!
//! HTTP endpoint handlers for connections, chat and health.

pub mod chat;
pub mod connections;
pub mod health;

#[cfg(test)]
mod tests;
