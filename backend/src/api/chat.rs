//! Chat API endpoints
//!
//! Handles HTTP requests for chat messages and sessions. The polling
//! endpoint speaks the same frames as the WebSocket.

use crate::chat::models::{ChatMessage, ChatSession};
use crate::chat::service::ChatService;
use crate::error::AppError;
use crate::protocol::{ChatReply, ClientFrame, MessageRequest, ServerFrame};
use crate::state::AppState;
use axum::{
    extract::{Path, State},
    response::Json,
};
use tracing::warn;

/// Answer one client frame
///
/// Shared by the polling endpoint and the WebSocket so both transports
/// behave identically. Capacity rejections become `busy` frames; every
/// other failure becomes an `error` frame.
pub async fn answer_frame(chat: &ChatService, frame: ClientFrame) -> ServerFrame {
    match frame {
        ClientFrame::Ping { sent_at_ms } => ServerFrame::Pong { sent_at_ms },
        ClientFrame::Message(request) => {
            let client_message_id = request.client_message_id.clone();
            match chat.handle_message(request).await {
                Ok(reply) => ServerFrame::Reply(reply),
                Err(AppError::Capacity(e)) => ServerFrame::Busy {
                    retry_after_secs: e.retry_after.as_secs().max(1),
                    message: e.to_string(),
                    client_message_id,
                },
                Err(e) => {
                    warn!(error = %e, "Message rejected");
                    ServerFrame::Error {
                        message: e.to_string(),
                        client_message_id,
                    }
                }
            }
        }
    }
}

/// POST /api/chat/message - Send a message and wait for the answer
pub async fn send_message(
    State(state): State<AppState>,
    Json(request): Json<MessageRequest>,
) -> Result<Json<ChatReply>, AppError> {
    let reply = state.chat.handle_message(request).await?;
    Ok(Json(reply))
}

/// POST /api/chat/poll - Polling transport; same frames as the WebSocket
pub async fn poll(
    State(state): State<AppState>,
    Json(frame): Json<ClientFrame>,
) -> Json<ServerFrame> {
    Json(answer_frame(&state.chat, frame).await)
}

/// GET /api/chat/sessions/:id/messages - Messages of a session in arrival order
pub async fn list_session_messages(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Vec<ChatMessage>>, AppError> {
    Ok(Json(state.chat.list_messages(&id).await?))
}

/// DELETE /api/chat/sessions/:id - Close a session
pub async fn close_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ChatSession>, AppError> {
    Ok(Json(state.chat.close_session(&id).await?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryStore;
    use crate::chat::models::{ResponseSource, SessionStatus};
    use crate::chat::store::MemorySessionStore;
    use crate::config::Config;
    use crate::provider::{Generation, GenerationOptions, ProviderError, TextGenerator, TokenUsage};
    use async_trait::async_trait;
    use std::sync::Arc;

    struct FixedGenerator;

    #[async_trait]
    impl TextGenerator for FixedGenerator {
        async fn generate(
            &self,
            _prompt: &str,
            _options: &GenerationOptions,
        ) -> Result<Generation, ProviderError> {
            Ok(Generation {
                content: "AWS Lambda best practices are to keep functions small.".to_string(),
                usage: TokenUsage {
                    prompt_tokens: 10,
                    completion_tokens: 12,
                    total_tokens: 22,
                },
            })
        }
    }

    fn create_test_state(max_sessions: usize) -> AppState {
        let mut config = Config::default();
        config.balancer.max_concurrent_sessions = max_sessions;
        AppState::build(
            config,
            Arc::new(FixedGenerator),
            Arc::new(MemoryStore::new()),
            Arc::new(MemorySessionStore::new()),
        )
    }

    fn message(content: &str, session_id: &str) -> MessageRequest {
        MessageRequest {
            session_id: Some(session_id.to_string()),
            client_message_id: Some(format!("c-{}", session_id)),
            ..MessageRequest::new(content)
        }
    }

    #[tokio::test]
    async fn test_send_message() {
        let state = create_test_state(10);
        let result = send_message(
            State(state),
            Json(message("What are Lambda best practices?", "s1")),
        )
        .await;
        let reply = result.unwrap().0;
        assert_eq!(reply.session_id, "s1");
        assert_eq!(reply.source, ResponseSource::Primary);
        assert_eq!(reply.tokens_used, 22);
        assert_eq!(reply.client_message_id.as_deref(), Some("c-s1"));
    }

    #[tokio::test]
    async fn test_send_message_empty_content() {
        let state = create_test_state(10);
        let result = send_message(State(state), Json(message("  ", "s1"))).await;
        match result.unwrap_err() {
            AppError::InvalidRequest(_) => {}
            other => panic!("Expected InvalidRequest, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_poll_reply_and_ping() {
        let state = create_test_state(10);
        let frame = poll(
            State(state.clone()),
            Json(ClientFrame::Message(message("What are Lambda best practices?", "s1"))),
        )
        .await
        .0;
        match frame {
            ServerFrame::Reply(reply) => assert_eq!(reply.source, ResponseSource::Primary),
            other => panic!("Expected reply, got {:?}", other),
        }

        let frame = poll(State(state), Json(ClientFrame::Ping { sent_at_ms: 9 })).await.0;
        assert_eq!(frame, ServerFrame::Pong { sent_at_ms: 9 });
    }

    #[tokio::test]
    async fn test_poll_busy_when_at_capacity() {
        let state = create_test_state(1);
        poll(
            State(state.clone()),
            Json(ClientFrame::Message(message("first session here", "s1"))),
        )
        .await;

        let frame = poll(
            State(state),
            Json(ClientFrame::Message(message("second session here", "s2"))),
        )
        .await
        .0;
        match frame {
            ServerFrame::Busy {
                retry_after_secs,
                client_message_id,
                ..
            } => {
                assert!(retry_after_secs >= 1);
                assert_eq!(client_message_id.as_deref(), Some("c-s2"));
            }
            other => panic!("Expected busy, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_poll_error_frame_for_invalid_message() {
        let state = create_test_state(10);
        let frame = poll(State(state), Json(ClientFrame::Message(message("", "s1"))))
            .await
            .0;
        assert!(matches!(frame, ServerFrame::Error { .. }));
    }

    #[tokio::test]
    async fn test_list_and_close_session() {
        let state = create_test_state(10);
        send_message(
            State(state.clone()),
            Json(message("What are Lambda best practices?", "s1")),
        )
        .await
        .unwrap();

        let messages = list_session_messages(State(state.clone()), Path("s1".to_string()))
            .await
            .unwrap()
            .0;
        assert_eq!(messages.len(), 2);

        let session = close_session(State(state.clone()), Path("s1".to_string()))
            .await
            .unwrap()
            .0;
        assert_eq!(session.status, SessionStatus::Closed);
        assert_eq!(state.balancer.active_sessions(), 0);
    }

    #[tokio::test]
    async fn test_close_session_not_found() {
        let state = create_test_state(10);
        let result = close_session(State(state), Path("nonexistent".to_string())).await;
        match result.unwrap_err() {
            AppError::SessionNotFound(_) => {}
            other => panic!("Expected SessionNotFound, got {:?}", other),
        }
    }
}
