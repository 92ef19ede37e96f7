//! # chatlink
//!
//! Backend of an AI chat application: OAuth connections to Google and Slack
//! with encrypted token custody, and chat turns streamed as resumable
//! Server-Sent Events.

pub mod auth;
pub mod chat;
pub mod config;
pub mod connection_manager;
pub mod connectors;
pub mod crypto;
pub mod db;
pub mod error;
pub mod handlers;
pub mod models;
pub mod oauth_state;
pub mod repositories;
pub mod server;
pub mod telemetry;
pub use migration;
