//! Chat message path
//!
//! Every transport (HTTP, WebSocket, polling) hands inbound messages to
//! [`ChatService::handle_message`]. Messages of one session are processed
//! one at a time in arrival order; different sessions run concurrently.

use crate::balancer::SessionLoadBalancer;
use crate::chat::models::{
    ChatMessage, ChatSession, DeliveryStatus, MessageMetadata, MessageRole, ResponseSource,
    SessionStatus, TokenUsage,
};
use crate::chat::store::SessionStore;
use crate::config::SessionConfig;
use crate::error::AppError;
use crate::fallback::{FallbackOrchestrator, OrchestratedResponse, QuickAction, MINIMAL_RESPONSE};
use crate::monitor::PerformanceMonitor;
use crate::protocol::{ChatReply, MessageRequest};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Maximum message length in characters
pub const MAX_MESSAGE_LENGTH: usize = 10_000;

/// Maximum session id length in characters
const MAX_SESSION_ID_LENGTH: usize = 128;

/// User recorded when the request names none
const ANONYMOUS_USER: &str = "anonymous";

/// Result of one idle-session sweep
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct ExpiryReport {
    /// Sessions moved from active to idle
    pub idled: usize,
    /// Sessions expired and released
    pub expired: usize,
}

/// The message path shared by every transport
pub struct ChatService {
    store: Arc<dyn SessionStore>,
    orchestrator: Arc<FallbackOrchestrator>,
    balancer: Arc<SessionLoadBalancer>,
    monitor: Arc<PerformanceMonitor>,
    lanes: DashMap<String, Arc<Mutex<()>>>,
    idle_after: Duration,
    idle_timeout: Duration,
}

impl ChatService {
    /// Create the service
    pub fn new(
        store: Arc<dyn SessionStore>,
        orchestrator: Arc<FallbackOrchestrator>,
        balancer: Arc<SessionLoadBalancer>,
        monitor: Arc<PerformanceMonitor>,
        config: &SessionConfig,
    ) -> Self {
        Self {
            store,
            orchestrator,
            balancer,
            monitor,
            lanes: DashMap::new(),
            idle_after: config.idle_after(),
            idle_timeout: config.idle_timeout(),
        }
    }

    /// Per-session ordering lane
    fn lane(&self, session_id: &str) -> Arc<Mutex<()>> {
        self.lanes
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Drop a session's lane once no other message holds or waits on it
    ///
    /// `held` is the caller's own handle to the lane.
    fn release_lane(&self, session_id: &str, held: Arc<Mutex<()>>) {
        // One reference in the map, one in `held`
        self.lanes.remove_if(session_id, |_, lane| {
            Arc::ptr_eq(lane, &held) && Arc::strong_count(lane) == 2
        });
    }

    async fn persist_message(&self, message: &ChatMessage) {
        if let Err(e) = self.store.save_message(message).await {
            warn!(
                session_id = %message.session_id,
                message_id = %message.id,
                error = %e,
                "Failed to persist message"
            );
        }
    }

    async fn persist_session(&self, session: &ChatSession) {
        if let Err(e) = self.store.save_session(session).await {
            warn!(session_id = %session.id, error = %e, "Failed to persist session");
        }
    }

    /// Handle one inbound message
    ///
    /// # Arguments
    /// * `request` - The message and its routing details
    ///
    /// # Returns
    /// * `Ok(ChatReply)` - A non-empty answer
    /// * `Err(AppError::Capacity)` - The balancer refused the session; retryable
    /// * `Err(AppError::InvalidRequest | SessionClosed)` - The message cannot be accepted
    pub async fn handle_message(&self, request: MessageRequest) -> Result<ChatReply, AppError> {
        let started = Instant::now();

        let content = request.content.trim().to_string();
        if content.is_empty() {
            return Err(AppError::InvalidRequest(
                "Message content cannot be empty".to_string(),
            ));
        }
        if content.chars().count() > MAX_MESSAGE_LENGTH {
            return Err(AppError::InvalidRequest(format!(
                "Message too long (max {} characters)",
                MAX_MESSAGE_LENGTH
            )));
        }

        let session_id = match request.session_id.as_deref().map(str::trim) {
            Some(id) if id.len() > MAX_SESSION_ID_LENGTH => {
                return Err(AppError::InvalidRequest(format!(
                    "Session id too long (max {} characters)",
                    MAX_SESSION_ID_LENGTH
                )));
            }
            Some(id) if !id.is_empty() => id.to_string(),
            _ => Uuid::new_v4().to_string(),
        };

        self.monitor.record_message_received();

        let lane = self.lane(&session_id);
        let turn = lane.lock().await;
        let result = self.answer(session_id.clone(), content, request, started).await;
        drop(turn);

        // Lanes only outlive a message for sessions the balancer tracks
        if self.balancer.resource_of(&session_id).is_none() {
            self.release_lane(&session_id, lane);
        }
        result
    }

    /// The part of [`Self::handle_message`] that runs inside the session lane
    async fn answer(
        &self,
        session_id: String,
        content: String,
        request: MessageRequest,
        started: Instant,
    ) -> Result<ChatReply, AppError> {
        let existing = match self.store.get_session(&session_id).await {
            Ok(session) => session,
            Err(e) => {
                warn!(session_id = %session_id, error = %e, "Session lookup failed, continuing with a fresh session");
                None
            }
        };

        let mut session = match existing {
            Some(session) if session.status.is_terminal() => {
                return Err(AppError::SessionClosed(session_id));
            }
            Some(mut session) => {
                if request.context != Default::default() {
                    session.context = request.context.clone();
                }
                session
            }
            None => ChatSession::new(
                session_id.clone(),
                request
                    .user_id
                    .clone()
                    .filter(|u| !u.trim().is_empty())
                    .unwrap_or_else(|| ANONYMOUS_USER.to_string()),
                request.context.clone(),
            ),
        };

        let placement = self.balancer.admit(&session.id).map_err(|e| {
            self.monitor.record_capacity_rejection();
            e
        })?;
        if placement.newly_admitted {
            info!(
                session_id = %session.id,
                resource_id = %placement.resource_id,
                "Session admitted"
            );
        }

        session.touch(Utc::now());
        self.persist_session(&session).await;

        let user_message = ChatMessage::new(session.id.clone(), MessageRole::User, content.clone())
            .with_status(DeliveryStatus::Delivered);
        self.persist_message(&user_message).await;

        // Detached so a dropped caller cannot cancel the provider call; the
        // answer still lands in the cache.
        let orchestrator = self.orchestrator.clone();
        let context = session.context.clone();
        let quick_action = request
            .quick_action
            .as_deref()
            .and_then(QuickAction::from_label);
        let prompt_content = content.clone();
        let handle = tokio::spawn(async move {
            orchestrator
                .respond(&prompt_content, &context, quick_action)
                .await
        });

        let outcome = match handle.await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(session_id = %session.id, error = %e, "Response task failed");
                OrchestratedResponse {
                    content: MINIMAL_RESPONSE.to_string(),
                    source: ResponseSource::Fallback,
                    token_usage: TokenUsage::default(),
                    failure: None,
                    attempts: 0,
                }
            }
        };

        let elapsed = started.elapsed();
        self.monitor.record_response_time(elapsed);
        self.balancer.record_activity(&session.id, elapsed);

        let assistant_message = ChatMessage::new(
            session.id.clone(),
            MessageRole::Assistant,
            outcome.content.clone(),
        )
        .with_status(DeliveryStatus::Sent)
        .with_metadata(MessageMetadata {
            tokens_used: Some(outcome.token_usage.total_tokens),
            source: Some(outcome.source),
        });
        self.persist_message(&assistant_message).await;
        self.monitor.record_message_sent();

        debug!(
            session_id = %session.id,
            source = outcome.source.as_str(),
            response_time_ms = elapsed.as_millis() as u64,
            "Message answered"
        );

        Ok(ChatReply {
            session_id: session.id,
            message_id: assistant_message.id,
            content: outcome.content,
            source: outcome.source,
            tokens_used: outcome.token_usage.total_tokens,
            response_time_ms: elapsed.as_millis() as u64,
            client_message_id: request.client_message_id,
        })
    }

    /// Mark a delivered reply as delivered
    ///
    /// Transports call this once the reply frame has been written.
    pub async fn mark_delivered(&self, session_id: &str, message_id: &str) {
        let messages = match self.store.list_messages(session_id).await {
            Ok(messages) => messages,
            Err(e) => {
                warn!(session_id = %session_id, error = %e, "Failed to load messages");
                return;
            }
        };
        if let Some(message) = messages.into_iter().find(|m| m.id == message_id) {
            self.persist_message(&message.with_status(DeliveryStatus::Delivered))
                .await;
        }
    }

    /// Explicitly close a session and release its capacity
    pub async fn close_session(&self, session_id: &str) -> Result<ChatSession, AppError> {
        let lane = self.lane(session_id);
        let turn = lane.lock().await;
        let result = self.close_in_lane(session_id).await;
        drop(turn);

        if self.balancer.resource_of(session_id).is_none() {
            self.release_lane(session_id, lane);
        }
        result
    }

    async fn close_in_lane(&self, session_id: &str) -> Result<ChatSession, AppError> {
        let mut session = self
            .store
            .get_session(session_id)
            .await?
            .ok_or_else(|| AppError::SessionNotFound(session_id.to_string()))?;

        if !session.status.is_terminal() {
            session.status = SessionStatus::Closed;
            self.store.save_session(&session).await?;
        }
        self.balancer.release(session_id);

        info!(session_id = %session_id, "Session closed");
        Ok(session)
    }

    /// Messages of a session in arrival order
    pub async fn list_messages(&self, session_id: &str) -> Result<Vec<ChatMessage>, AppError> {
        if self.store.get_session(session_id).await?.is_none() {
            return Err(AppError::SessionNotFound(session_id.to_string()));
        }
        Ok(self.store.list_messages(session_id).await?)
    }

    /// Mark inactive sessions idle and expire abandoned ones
    ///
    /// # Arguments
    /// * `now` - Reference time for inactivity
    pub async fn expire_idle(&self, now: DateTime<Utc>) -> ExpiryReport {
        let mut report = ExpiryReport::default();
        let sessions = match self.store.list_open_sessions().await {
            Ok(sessions) => sessions,
            Err(e) => {
                warn!(error = %e, "Failed to list open sessions");
                return report;
            }
        };

        for candidate in sessions {
            if candidate.inactive_for(now) < self.idle_after {
                continue;
            }

            let lane = self.lane(&candidate.id);
            let turn = lane.lock().await;

            // Re-read under the lane; a message may have arrived meanwhile.
            match self.store.get_session(&candidate.id).await {
                Ok(Some(mut session)) if !session.status.is_terminal() => {
                    let inactive = session.inactive_for(now);
                    if inactive >= self.idle_timeout {
                        session.status = SessionStatus::Expired;
                        self.persist_session(&session).await;
                        self.balancer.release(&session.id);
                        report.expired += 1;
                        debug!(session_id = %session.id, "Session expired");
                    } else if inactive >= self.idle_after && session.status == SessionStatus::Active
                    {
                        session.status = SessionStatus::Idle;
                        self.persist_session(&session).await;
                        report.idled += 1;
                    }
                }
                _ => {}
            }
            drop(turn);

            if self.balancer.resource_of(&candidate.id).is_none() {
                self.release_lane(&candidate.id, lane);
            }
        }

        if report.expired > 0 || report.idled > 0 {
            info!(idled = report.idled, expired = report.expired, "Swept idle sessions");
        }
        report
    }
}
