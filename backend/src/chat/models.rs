//! Chat data models
//!
//! Defines structures for sessions, messages, and the client context that
//! flows from the admin UI into prompts, cache fingerprints, and templates.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Role of a message sender
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    /// Message from the admin user
    User,
    /// Message from the assistant/AI
    Assistant,
    /// Message injected by the system (notices, resets)
    System,
}

impl MessageRole {
    /// Convert the role to its string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
            MessageRole::System => "system",
        }
    }
}

impl From<&str> for MessageRole {
    fn from(s: &str) -> Self {
        match s {
            "assistant" => MessageRole::Assistant,
            "system" => MessageRole::System,
            _ => MessageRole::User,
        }
    }
}

/// Lifecycle state of a chat session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    /// Recently active
    Active,
    /// No activity for a while, still resumable
    Idle,
    /// Explicitly closed by the user
    Closed,
    /// Expired after the inactivity window
    Expired,
}

impl SessionStatus {
    /// Convert the status to its string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Active => "active",
            SessionStatus::Idle => "idle",
            SessionStatus::Closed => "closed",
            SessionStatus::Expired => "expired",
        }
    }

    /// Whether the session can no longer accept messages
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionStatus::Closed | SessionStatus::Expired)
    }
}

impl From<&str> for SessionStatus {
    fn from(s: &str) -> Self {
        match s {
            "idle" => SessionStatus::Idle,
            "closed" => SessionStatus::Closed,
            "expired" => SessionStatus::Expired,
            _ => SessionStatus::Active,
        }
    }
}

/// Delivery state of a message on its way to the client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    /// Accepted but not yet handed to a transport
    Pending,
    /// Handed to a transport
    Sent,
    /// Confirmed received
    Delivered,
    /// Gave up delivering
    Failed,
}

impl DeliveryStatus {
    /// Convert the delivery status to its string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Pending => "pending",
            DeliveryStatus::Sent => "sent",
            DeliveryStatus::Delivered => "delivered",
            DeliveryStatus::Failed => "failed",
        }
    }
}

impl From<&str> for DeliveryStatus {
    fn from(s: &str) -> Self {
        match s {
            "sent" => DeliveryStatus::Sent,
            "delivered" => DeliveryStatus::Delivered,
            "failed" => DeliveryStatus::Failed,
            _ => DeliveryStatus::Pending,
        }
    }
}

/// Where an assistant answer came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseSource {
    /// Fresh answer from the text-generation provider
    Primary,
    /// Pre-authored template used because the provider could not answer
    Fallback,
    /// Previously generated answer served from the response cache
    Cache,
}

impl ResponseSource {
    /// Convert the source to its string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            ResponseSource::Primary => "primary",
            ResponseSource::Fallback => "fallback",
            ResponseSource::Cache => "cache",
        }
    }

    /// Parse a stored source label
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "primary" => Some(ResponseSource::Primary),
            "fallback" => Some(ResponseSource::Fallback),
            "cache" => Some(ResponseSource::Cache),
            _ => None,
        }
    }
}

/// Client the consultation is about
///
/// Answers reference the client by name, so the context is part of the
/// cache fingerprint.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClientContext {
    /// Client (company) name
    #[serde(default)]
    pub client_name: Option<String>,
    /// Meeting type, e.g. "discovery call" or "architecture review"
    #[serde(default)]
    pub meeting_type: Option<String>,
    /// Free-form metadata (industry, cloud provider, budget band, ...)
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl ClientContext {
    /// Create a context for a named client
    pub fn for_client(client_name: impl Into<String>) -> Self {
        Self {
            client_name: Some(client_name.into()),
            ..Default::default()
        }
    }

    /// Set the meeting type
    pub fn with_meeting_type(mut self, meeting_type: impl Into<String>) -> Self {
        self.meeting_type = Some(meeting_type.into());
        self
    }

    /// Add one metadata entry
    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Client name for display, with a neutral default
    pub fn display_name(&self) -> &str {
        self.client_name
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .unwrap_or("your organization")
    }

    /// Meeting type for display, with a neutral default
    pub fn display_meeting_type(&self) -> &str {
        self.meeting_type
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .unwrap_or("consultation")
    }
}

/// A chat conversation between an admin user and the assistant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatSession {
    /// Unique identifier for the session
    pub id: String,
    /// User who owns the session
    pub user_id: String,
    /// Client the session is about
    pub context: ClientContext,
    /// Lifecycle state
    pub status: SessionStatus,
    /// When the session was created
    pub created_at: DateTime<Utc>,
    /// When the session last saw a message
    pub last_activity_at: DateTime<Utc>,
}

impl ChatSession {
    /// Create a new active session
    pub fn new(id: String, user_id: String, context: ClientContext) -> Self {
        let now = Utc::now();
        Self {
            id,
            user_id,
            context,
            status: SessionStatus::Active,
            created_at: now,
            last_activity_at: now,
        }
    }

    /// Record activity: refresh the timestamp and reactivate an idle session
    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.last_activity_at = now;
        if self.status == SessionStatus::Idle {
            self.status = SessionStatus::Active;
        }
    }

    /// Time since the last activity (zero if the clock went backwards)
    pub fn inactive_for(&self, now: DateTime<Utc>) -> Duration {
        (now - self.last_activity_at).to_std().unwrap_or_default()
    }
}

/// Token accounting for one generation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    /// Tokens in the prompt
    pub prompt_tokens: u32,
    /// Tokens in the generated answer
    pub completion_tokens: u32,
    /// Total tokens billed
    pub total_tokens: u32,
}

/// Per-message metadata
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageMetadata {
    /// Tokens used to produce the message (assistant messages only)
    #[serde(default)]
    pub tokens_used: Option<u32>,
    /// Where the answer came from (assistant messages only)
    #[serde(default)]
    pub source: Option<ResponseSource>,
}

/// A single message in a session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Unique identifier for the message
    pub id: String,
    /// ID of the session this message belongs to
    pub session_id: String,
    /// Role of the message sender
    pub role: MessageRole,
    /// Content of the message
    pub content: String,
    /// When the message was created
    pub timestamp: DateTime<Utc>,
    /// Delivery state
    pub delivery_status: DeliveryStatus,
    /// Tokens and answer source
    #[serde(default)]
    pub metadata: MessageMetadata,
}

impl ChatMessage {
    /// Create a new pending message
    pub fn new(session_id: String, role: MessageRole, content: String) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            session_id,
            role,
            content,
            timestamp: Utc::now(),
            delivery_status: DeliveryStatus::Pending,
            metadata: MessageMetadata::default(),
        }
    }

    /// Set the delivery status
    pub fn with_status(mut self, status: DeliveryStatus) -> Self {
        self.delivery_status = status;
        self
    }

    /// Set the metadata
    pub fn with_metadata(mut self, metadata: MessageMetadata) -> Self {
        self.metadata = metadata;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_round_trips_through_str() {
        for role in [MessageRole::User, MessageRole::Assistant, MessageRole::System] {
            assert_eq!(MessageRole::from(role.as_str()), role);
        }
        assert_eq!(MessageRole::from("bogus"), MessageRole::User);
    }

    #[test]
    fn test_touch_reactivates_idle_session() {
        let mut session = ChatSession::new(
            "s-1".to_string(),
            "admin".to_string(),
            ClientContext::default(),
        );
        session.status = SessionStatus::Idle;
        let later = session.last_activity_at + chrono::Duration::seconds(30);
        session.touch(later);
        assert_eq!(session.status, SessionStatus::Active);
        assert_eq!(session.last_activity_at, later);
    }

    #[test]
    fn test_inactive_for_never_negative() {
        let session = ChatSession::new(
            "s-1".to_string(),
            "admin".to_string(),
            ClientContext::default(),
        );
        let earlier = session.last_activity_at - chrono::Duration::seconds(10);
        assert_eq!(session.inactive_for(earlier), Duration::ZERO);
    }

    #[test]
    fn test_context_display_defaults() {
        let context = ClientContext::default();
        assert_eq!(context.display_name(), "your organization");
        assert_eq!(context.display_meeting_type(), "consultation");

        let named = ClientContext::for_client("Acme Corp").with_meeting_type("discovery call");
        assert_eq!(named.display_name(), "Acme Corp");
        assert_eq!(named.display_meeting_type(), "discovery call");
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(SessionStatus::Closed.is_terminal());
        assert!(SessionStatus::Expired.is_terminal());
        assert!(!SessionStatus::Idle.is_terminal());
    }
}
