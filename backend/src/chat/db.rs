//! SQLite session store
//!
//! Handles all database interactions for sessions and messages.

use crate::chat::models::{
    ChatMessage, ChatSession, ClientContext, DeliveryStatus, MessageMetadata, MessageRole,
    ResponseSource, SessionStatus,
};
use crate::chat::store::{SessionStore, StoreError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use std::path::PathBuf;
use std::str::FromStr;
use tracing::{debug, info};

/// SQLite-backed implementation of [`SessionStore`]
pub struct SqliteSessionStore {
    pool: SqlitePool,
}

fn backend(context: &str) -> impl Fn(sqlx::Error) -> StoreError + '_ {
    move |e| StoreError::Backend(format!("{}: {}", context, e))
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_millis(ms).unwrap_or_else(Utc::now)
}

impl SqliteSessionStore {
    /// Open (creating if missing) the database and run migrations
    ///
    /// # Arguments
    /// * `db_path` - Path to the SQLite database file
    ///
    /// # Returns
    /// * `Ok(SqliteSessionStore)` if successful
    /// * `Err(StoreError)` if connection or migration failed
    pub async fn new(db_path: &str) -> Result<Self, StoreError> {
        // Ensure parent directory exists
        if let Some(parent) = PathBuf::from(db_path).parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::Backend(format!("Failed to create db directory: {}", e))
            })?;
        }

        let connection_string = if db_path.starts_with("sqlite:") {
            db_path.to_string()
        } else {
            format!("sqlite:{}", db_path)
        };

        let options = SqliteConnectOptions::from_str(&connection_string)
            .map_err(backend("Invalid database path"))?
            .create_if_missing(true)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(backend("Failed to connect to database"))?;

        info!("Connected to SQLite database at: {}", db_path);

        let store = Self { pool };
        store.run_migrations().await?;

        Ok(store)
    }

    /// Run database migrations
    async fn run_migrations(&self) -> Result<(), StoreError> {
        let migration_sql = include_str!("../../migrations/001_create_sessions.sql");

        // Strip comments so the file can be split into single statements
        let mut cleaned_sql = String::new();
        for line in migration_sql.lines() {
            let without_comment = match line.find("--") {
                Some(pos) => &line[..pos],
                None => line,
            };
            let trimmed = without_comment.trim();
            if trimmed.is_empty() {
                continue;
            }
            cleaned_sql.push_str(trimmed);
            cleaned_sql.push(' ');
        }

        for statement in cleaned_sql
            .split(';')
            .map(str::trim)
            .filter(|s| !s.is_empty())
        {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(|e| {
                    StoreError::Backend(format!(
                        "Migration failed: {} - Statement: {}",
                        e,
                        statement.chars().take(100).collect::<String>()
                    ))
                })?;
        }

        debug!("Database migrations completed");
        Ok(())
    }

    fn session_from_row(row: &SqliteRow) -> Result<ChatSession, StoreError> {
        let read = |e: sqlx::Error| StoreError::Corrupt(e.to_string());
        let context_json: String = row.try_get("context").map_err(read)?;
        let context: ClientContext = serde_json::from_str(&context_json)
            .map_err(|e| StoreError::Corrupt(format!("context: {}", e)))?;
        let status: String = row.try_get("status").map_err(read)?;

        Ok(ChatSession {
            id: row.try_get("id").map_err(read)?,
            user_id: row.try_get("user_id").map_err(read)?,
            context,
            status: SessionStatus::from(status.as_str()),
            created_at: from_millis(row.try_get("created_at").map_err(read)?),
            last_activity_at: from_millis(row.try_get("last_activity_at").map_err(read)?),
        })
    }

    fn message_from_row(row: &SqliteRow) -> Result<ChatMessage, StoreError> {
        let read = |e: sqlx::Error| StoreError::Corrupt(e.to_string());
        let role: String = row.try_get("role").map_err(read)?;
        let delivery: String = row.try_get("delivery_status").map_err(read)?;
        let tokens_used: Option<i64> = row.try_get("tokens_used").map_err(read)?;
        let source: Option<String> = row.try_get("source").map_err(read)?;

        Ok(ChatMessage {
            id: row.try_get("id").map_err(read)?,
            session_id: row.try_get("session_id").map_err(read)?,
            role: MessageRole::from(role.as_str()),
            content: row.try_get("content").map_err(read)?,
            timestamp: from_millis(row.try_get("created_at").map_err(read)?),
            delivery_status: DeliveryStatus::from(delivery.as_str()),
            metadata: MessageMetadata {
                tokens_used: tokens_used.and_then(|t| u32::try_from(t).ok()),
                source: source.as_deref().and_then(ResponseSource::parse),
            },
        })
    }
}

#[async_trait]
impl SessionStore for SqliteSessionStore {
    async fn get_session(&self, id: &str) -> Result<Option<ChatSession>, StoreError> {
        let row = sqlx::query(
            "SELECT id, user_id, context, status, created_at, last_activity_at FROM sessions WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(backend("Failed to fetch session"))?;

        row.as_ref().map(Self::session_from_row).transpose()
    }

    async fn save_session(&self, session: &ChatSession) -> Result<(), StoreError> {
        let context = serde_json::to_string(&session.context)
            .map_err(|e| StoreError::Corrupt(format!("context: {}", e)))?;

        sqlx::query(
            "INSERT INTO sessions (id, user_id, context, status, created_at, last_activity_at) \
             VALUES (?, ?, ?, ?, ?, ?) \
             ON CONFLICT(id) DO UPDATE SET user_id = excluded.user_id, context = excluded.context, \
             status = excluded.status, last_activity_at = excluded.last_activity_at",
        )
        .bind(&session.id)
        .bind(&session.user_id)
        .bind(context)
        .bind(session.status.as_str())
        .bind(session.created_at.timestamp_millis())
        .bind(session.last_activity_at.timestamp_millis())
        .execute(&self.pool)
        .await
        .map_err(backend("Failed to save session"))?;

        debug!(session_id = %session.id, status = session.status.as_str(), "Saved session");
        Ok(())
    }

    async fn save_message(&self, message: &ChatMessage) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO messages (id, session_id, role, content, created_at, delivery_status, tokens_used, source) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT(id) DO UPDATE SET content = excluded.content, \
             delivery_status = excluded.delivery_status, tokens_used = excluded.tokens_used, \
             source = excluded.source",
        )
        .bind(&message.id)
        .bind(&message.session_id)
        .bind(message.role.as_str())
        .bind(&message.content)
        .bind(message.timestamp.timestamp_millis())
        .bind(message.delivery_status.as_str())
        .bind(message.metadata.tokens_used.map(i64::from))
        .bind(message.metadata.source.map(|s| s.as_str()))
        .execute(&self.pool)
        .await
        .map_err(backend("Failed to save message"))?;

        debug!(
            "Saved message {} to session {}",
            message.id, message.session_id
        );
        Ok(())
    }

    async fn list_messages(&self, session_id: &str) -> Result<Vec<ChatMessage>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, session_id, role, content, created_at, delivery_status, tokens_used, source \
             FROM messages WHERE session_id = ? ORDER BY seq ASC",
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await
        .map_err(backend("Failed to fetch messages"))?;

        rows.iter().map(Self::message_from_row).collect()
    }

    async fn list_open_sessions(&self) -> Result<Vec<ChatSession>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, user_id, context, status, created_at, last_activity_at FROM sessions \
             WHERE status IN ('active', 'idle') ORDER BY id ASC",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(backend("Failed to fetch sessions"))?;

        rows.iter().map(Self::session_from_row).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn create_test_store() -> (SqliteSessionStore, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("chat.db");
        let store = SqliteSessionStore::new(db_path.to_str().unwrap())
            .await
            .expect("Failed to create test database");
        (store, temp_dir)
    }

    #[tokio::test]
    async fn test_session_round_trip() {
        let (store, _temp_dir) = create_test_store().await;
        let context = ClientContext::for_client("Acme Corp")
            .with_meeting_type("discovery call")
            .with_metadata("industry", serde_json::json!("retail"));
        let session = ChatSession::new("s-1".to_string(), "admin".to_string(), context.clone());
        store.save_session(&session).await.unwrap();

        let loaded = store.get_session("s-1").await.unwrap().unwrap();
        assert_eq!(loaded.user_id, "admin");
        assert_eq!(loaded.context, context);
        assert_eq!(loaded.status, SessionStatus::Active);
    }

    #[tokio::test]
    async fn test_get_session_missing() {
        let (store, _temp_dir) = create_test_store().await;
        assert!(store.get_session("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_messages_in_arrival_order_with_metadata() {
        let (store, _temp_dir) = create_test_store().await;
        let session = ChatSession::new("s-1".into(), "admin".into(), ClientContext::default());
        store.save_session(&session).await.unwrap();

        let question = ChatMessage::new("s-1".into(), MessageRole::User, "Question".into());
        let answer = ChatMessage::new("s-1".into(), MessageRole::Assistant, "Answer".into())
            .with_status(DeliveryStatus::Sent)
            .with_metadata(MessageMetadata {
                tokens_used: Some(42),
                source: Some(ResponseSource::Primary),
            });
        store.save_message(&question).await.unwrap();
        store.save_message(&answer).await.unwrap();

        let thread = store.list_messages("s-1").await.unwrap();
        assert_eq!(thread.len(), 2);
        assert_eq!(thread[0].content, "Question");
        assert_eq!(thread[1].metadata.tokens_used, Some(42));
        assert_eq!(thread[1].metadata.source, Some(ResponseSource::Primary));
    }

    #[tokio::test]
    async fn test_save_message_upserts_delivery_status() {
        let (store, _temp_dir) = create_test_store().await;
        let session = ChatSession::new("s-1".into(), "admin".into(), ClientContext::default());
        store.save_session(&session).await.unwrap();

        let message = ChatMessage::new("s-1".into(), MessageRole::Assistant, "Answer".into());
        store.save_message(&message).await.unwrap();
        store
            .save_message(&message.clone().with_status(DeliveryStatus::Delivered))
            .await
            .unwrap();

        let thread = store.list_messages("s-1").await.unwrap();
        assert_eq!(thread.len(), 1);
        assert_eq!(thread[0].delivery_status, DeliveryStatus::Delivered);
    }

    #[tokio::test]
    async fn test_open_sessions_exclude_closed() {
        let (store, _temp_dir) = create_test_store().await;
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
