//! Consult Chat Backend Library
//!
//! The chat-resilience core: response cache, fallback orchestrator, session
//! load balancer, performance monitor, and the HTTP/WebSocket/polling
//! transports in front of them. The main binary is in `src/main.rs`.

pub mod api;
pub mod balancer;
pub mod cache;
pub mod chat;
pub mod config;
pub mod error;
pub mod fallback;
pub mod maintenance;
pub mod monitor;
/// Wire schema shared with clients
pub mod protocol;
pub mod provider;
/// Application state management
///
/// Builds and owns the shared components handed to every handler.
pub mod state;
pub mod websocket;
