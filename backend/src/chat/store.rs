//! Session persistence capability
//!
//! Sessions and messages are owned by an external persistence collaborator.
//! The message path only needs the narrow contract below; the in-memory
//! implementation backs tests and database-less deployments.

use crate::chat::models::{ChatMessage, ChatSession};
use async_trait::async_trait;
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::RwLock;

/// Errors raised by a session store
#[derive(Error, Debug)]
pub enum StoreError {
    /// The backing store rejected or failed the operation
    #[error("Session store error: {0}")]
    Backend(String),

    /// Stored data could not be decoded
    #[error("Corrupt session record: {0}")]
    Corrupt(String),
}

/// Session and message persistence used by the chat message path
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Fetch a session by ID
    async fn get_session(&self, id: &str) -> Result<Option<ChatSession>, StoreError>;

    /// Insert or replace a session
    async fn save_session(&self, session: &ChatSession) -> Result<(), StoreError>;

    /// Insert a message, or update it if a message with the same ID exists
    async fn save_message(&self, message: &ChatMessage) -> Result<(), StoreError>;

    /// All messages of a session in arrival order
    async fn list_messages(&self, session_id: &str) -> Result<Vec<ChatMessage>, StoreError>;

    /// All sessions that are not closed or expired
    async fn list_open_sessions(&self) -> Result<Vec<ChatSession>, StoreError>;
}

/// In-memory session store
#[derive(Default)]
pub struct MemorySessionStore {
    sessions: RwLock<HashMap<String, ChatSession>>,
    messages: RwLock<HashMap<String, Vec<ChatMessage>>>,
}

impl MemorySessionStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn get_session(&self, id: &str) -> Result<Option<ChatSession>, StoreError> {
        Ok(self.sessions.read().await.get(id).cloned())
    }

    async fn save_session(&self, session: &ChatSession) -> Result<(), StoreError> {
        self.sessions
            .write()
            .await
            .insert(session.id.clone(), session.clone());
        Ok(())
    }

    async fn save_message(&self, message: &ChatMessage) -> Result<(), StoreError> {
        let mut messages = self.messages.write().await;
        let thread = messages.entry(message.session_id.clone()).or_default();
        match thread.iter_mut().find(|m| m.id == message.id) {
            Some(existing) => *existing = message.clone(),
            None => thread.push(message.clone()),
        }
        Ok(())
    }

    async fn list_messages(&self, session_id: &str) -> Result<Vec<ChatMessage>, StoreError> {
        Ok(self
            .messages
            .read()
            .await
            .get(session_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn list_open_sessions(&self) -> Result<Vec<ChatSession>, StoreError> {
        let sessions = self.sessions.read().await;
        let mut open: Vec<ChatSession> = sessions
            .values()
            .filter(|s| !s.status.is_terminal())
            .cloned()
            .collect();
        open.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(open)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::models::{ClientContext, DeliveryStatus, MessageRole, SessionStatus};

    #[tokio::test]
    async fn test_save_message_updates_in_place() {
        let store = MemorySessionStore::new();
        let message = ChatMessage::new("s-1".to_string(), MessageRole::User, "Hi".to_string());
        store.save_message(&message).await.unwrap();

        let delivered = message.clone().with_status(DeliveryStatus::Delivered);
        store.save_message(&delivered).await.unwrap();

        let thread = store.list_messages("s-1").await.unwrap();
        assert_eq!(thread.len(), 1);
        assert_eq!(thread[0].delivery_status, DeliveryStatus::Delivered);
    }

    #[tokio::test]
    async fn test_messages_keep_arrival_order() {
        let store = MemorySessionStore::new();
        for content in ["first", "second", "third"] {
            let message =
                ChatMessage::new("s-1".to_string(), MessageRole::User, content.to_string());
            store.save_message(&message).await.unwrap();
        }
        let contents: Vec<String> = store
            .list_messages("s-1")
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.content)
            .collect();
        assert_eq!(contents, vec!["first", "second", "third"]);
    }

    #[tokio::test]
    async fn test_list_open_sessions_skips_terminal() {
        let store = MemorySessionStore::new();
        let open = ChatSession::new("a".into(), "admin".into(), ClientContext::default());
        let mut closed = ChatSession::new("b".into(), "admin".into(), ClientContext::default());
        closed.status = SessionStatus::Closed;
        store.save_session(&open).await.unwrap();
        store.save_session(&closed).await.unwrap();

        let sessions = store.list_open_sessions().await.unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].id, "a");
    }
}
