//! Client transport
//!
//! Keeps a chat client talking to the server whatever the network does: a
//! persistent WebSocket when it can, the polling endpoint when it cannot.
//! Transport trouble is never fatal to a send; only exhausting every
//! reconnect attempt is surfaced, as the `failed` status.

pub mod backoff;
pub mod channel;
pub mod config;
pub mod manager;
pub mod state_machine;

pub use backoff::Backoff;
pub use channel::{HttpPollingClient, LiveConnector, LiveLink, PollingClient, WsConnector};
pub use config::TransportConfig;
pub use manager::TransportManager;
pub use state_machine::{Action, Event, ReconnectMachine};

use consult_chat_backend::protocol::ChatReply;
use serde::Serialize;
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::oneshot;

/// Connection status as seen by the application
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    /// Not connected and not trying
    Disconnected,
    /// First attempt to open the live channel
    Connecting,
    /// Live channel open
    Connected,
    /// Live channel lost; retrying on the backoff schedule
    Reconnecting,
    /// Reconnect attempts exhausted; sends go through polling
    Failed,
    /// The server offers no live channel; sends go through polling
    Polling,
}

impl ConnectionStatus {
    /// Convert the status to its string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionStatus::Disconnected => "disconnected",
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Reconnecting => "reconnecting",
            ConnectionStatus::Failed => "failed",
            ConnectionStatus::Polling => "polling",
        }
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors of the client transport
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransportError {
    /// The live channel could not be opened
    #[error("Failed to open live channel: {0}")]
    Connect(String),

    /// The server does not offer a live channel
    #[error("Live channel not supported by server: {0}")]
    Unsupported(String),

    /// Opening the live channel took too long
    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    /// The live channel closed
    #[error("Live channel closed")]
    Closed,

    /// Writing to the live channel failed
    #[error("Send failed: {0}")]
    Send(String),

    /// A polling request failed
    #[error("Polling request failed: {0}")]
    Poll(String),

    /// A frame could not be encoded or decoded
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The server refused the message
    #[error("Rejected by server: {0}")]
    Rejected(String),

    /// The transport was disconnected before the send completed
    #[error("Send cancelled by disconnect")]
    Cancelled,
}

/// Terminal outcome of one send
#[derive(Debug, Clone, PartialEq)]
pub enum DeliveryOutcome {
    /// The server answered
    Delivered(ChatReply),
    /// The server is at capacity; retry after the given wait
    Busy {
        /// Suggested wait
        retry_after: Duration,
        /// Server explanation
        message: String,
    },
    /// The message was not delivered
    Failed(TransportError),
}

/// Handle to the outcome of a send
#[derive(Debug)]
pub struct DeliveryReceipt {
    client_message_id: String,
    outcome: oneshot::Receiver<DeliveryOutcome>,
}

impl DeliveryReceipt {
    pub(crate) fn new(client_message_id: String, outcome: oneshot::Receiver<DeliveryOutcome>) -> Self {
        Self {
            client_message_id,
            outcome,
        }
    }

    /// Correlation id sent with the message
    pub fn client_message_id(&self) -> &str {
        &self.client_message_id
    }

    /// Wait for the terminal outcome
    pub async fn outcome(self) -> DeliveryOutcome {
        self.outcome
            .await
            .unwrap_or(DeliveryOutcome::Failed(TransportError::Cancelled))
    }
}

/// Connection health
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TransportHealth {
    /// Current status
    pub status: ConnectionStatus,
    /// Last heartbeat round trip, if one completed on the current channel
    pub last_rtt_ms: Option<u64>,
    /// Connected with a round trip at or under the latency threshold
    pub healthy: bool,
}
