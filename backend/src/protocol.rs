//! Wire schema shared by the HTTP, WebSocket, and polling endpoints
//!
//! The persistent channel and the polling endpoint exchange the same
//! [`ClientFrame`]/[`ServerFrame`] JSON, so a client can switch between them
//! without translating messages.

use crate::chat::models::{ClientContext, ResponseSource};
use serde::{Deserialize, Serialize};

/// One chat message from the client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageRequest {
    /// Message text
    pub content: String,
    /// Existing session; a new one is created when absent
    #[serde(default)]
    pub session_id: Option<String>,
    /// Client the conversation is about
    #[serde(default)]
    pub context: ClientContext,
    /// Optional quick action label (unknown labels are ignored)
    #[serde(default)]
    pub quick_action: Option<String>,
    /// Owning user; defaults to "anonymous"
    #[serde(default)]
    pub user_id: Option<String>,
    /// Client-side correlation id echoed back in the reply
    #[serde(default)]
    pub client_message_id: Option<String>,
}

impl MessageRequest {
    /// A request with only content set
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            session_id: None,
            context: ClientContext::default(),
            quick_action: None,
            user_id: None,
            client_message_id: None,
        }
    }
}

/// The answer to one [`MessageRequest`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatReply {
    /// Session the message belongs to
    pub session_id: String,
    /// Id of the stored assistant message
    pub message_id: String,
    /// Answer text, never empty
    pub content: String,
    /// Where the answer came from
    pub source: ResponseSource,
    /// Tokens used (zero for fallback answers)
    pub tokens_used: u32,
    /// Server-side processing time
    pub response_time_ms: u64,
    /// Echo of the request's correlation id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_message_id: Option<String>,
}

/// Frames sent by the client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    /// A chat message
    Message(MessageRequest),
    /// Heartbeat ping
    Ping {
        /// Client clock at send time, echoed back
        sent_at_ms: u64,
    },
}

/// Frames sent by the server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    /// Answer to a message
    Reply(ChatReply),
    /// Capacity rejection; retry later
    Busy {
        /// Suggested wait before retrying
        retry_after_secs: u64,
        /// Human readable explanation
        message: String,
        /// Correlation id of the rejected message
        #[serde(default, skip_serializing_if = "Option::is_none")]
        client_message_id: Option<String>,
    },
    /// Heartbeat answer
    Pong {
        /// Echo of the ping's timestamp
        sent_at_ms: u64,
    },
    /// The message could not be processed (bad input, closed session)
    Error {
        /// Human readable explanation
        message: String,
        /// Correlation id of the failed message
        #[serde(default, skip_serializing_if = "Option::is_none")]
        client_message_id: Option<String>,
    },
}
