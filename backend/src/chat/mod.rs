//! Chat module
//!
//! Sessions, messages, their persistence, and the message path that ties the
//! cache, orchestrator, balancer, and monitor together.

pub mod db;
pub mod models;
pub mod service;
pub mod store;

pub use db::SqliteSessionStore;
pub use models::{
    ChatMessage, ChatSession, ClientContext, DeliveryStatus, MessageMetadata, MessageRole,
    ResponseSource, SessionStatus, TokenUsage,
};
pub use service::{ChatService, ExpiryReport};
pub use store::{MemorySessionStore, SessionStore, StoreError};
