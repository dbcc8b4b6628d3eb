//! Consult Chat Client
//!
//! The client side of the chat-resilience core: a transport manager that
//! prefers a live WebSocket, degrades to HTTP polling, and reconnects on an
//! explicit state machine. The terminal client binary is in `src/main.rs`.

pub mod transport;

pub use transport::{
    ConnectionStatus, DeliveryOutcome, DeliveryReceipt, TransportConfig, TransportError,
    TransportHealth, TransportManager,
};
