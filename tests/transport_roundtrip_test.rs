//! End-to-end transport tests against a real backend router
//!
//! The backend is served on an ephemeral port with a stub text generator;
//! the client talks to it over the real WebSocket and HTTP implementations.

use async_trait::async_trait;
use consult_chat_backend::api;
use consult_chat_backend::cache::MemoryStore;
use consult_chat_backend::chat::{MemorySessionStore, ResponseSource, TokenUsage};
use consult_chat_backend::config::Config;
use consult_chat_backend::protocol::MessageRequest;
use consult_chat_backend::provider::{Generation, GenerationOptions, ProviderError, TextGenerator};
use consult_chat_backend::state::AppState;
use consult_chat_client::{ConnectionStatus, DeliveryOutcome, TransportConfig, TransportManager};
use std::sync::Arc;
use std::time::Duration;

struct CannedGenerator;

#[async_trait]
impl TextGenerator for CannedGenerator {
    async fn generate(
        &self,
        _prompt: &str,
        _options: &GenerationOptions,
    ) -> Result<Generation, ProviderError> {
        Ok(Generation {
            content: "Start with a landing zone and least-privilege IAM.".to_string(),
            usage: TokenUsage {
                prompt_tokens: 8,
                completion_tokens: 9,
                total_tokens: 17,
            },
        })
    }
}

/// Serve the backend on 127.0.0.1 and return its base URL
async fn spawn_backend(max_sessions: usize) -> String {
    let mut config = Config::default();
    config.balancer.max_concurrent_sessions = max_sessions;
    let state = AppState::build(
        config,
        Arc::new(CannedGenerator),
        Arc::new(MemoryStore::new()),
        Arc::new(MemorySessionStore::new()),
    );
    let app = api::router(state);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}", addr)
}

fn client_config(server_url: String) -> TransportConfig {
    TransportConfig {
        server_url,
        reconnect_base_ms: 10,
        reconnect_max_delay_ms: 50,
        max_reconnect_attempts: 2,
        connect_timeout_ms: 2_000,
        heartbeat_interval_ms: 20,
        ..TransportConfig::default()
    }
}

#[tokio::test]
async fn test_live_channel_round_trip() {
    let url = spawn_backend(10).await;
    let manager = TransportManager::from_config(client_config(url));

    assert_eq!(manager.connect("e2e-live").await, ConnectionStatus::Connected);

    let first = manager
        .send(MessageRequest::new("How do we start with AWS?"))
        .outcome()
        .await;
    let second = manager
        .send(MessageRequest::new("How do we start with AWS?"))
        .outcome()
        .await;

    match (first, second) {
        (DeliveryOutcome::Delivered(a), DeliveryOutcome::Delivered(b)) => {
            assert_eq!(a.session_id, "e2e-live");
            assert_eq!(a.source, ResponseSource::Primary);
            assert_eq!(b.source, ResponseSource::Cache);
            assert_eq!(a.content, b.content);
        }
        other => panic!("Expected two deliveries, got {:?}", other),
    }

    // Heartbeats answered by the server
    tokio::time::timeout(Duration::from_secs(2), async {
        while manager.health().last_rtt_ms.is_none() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    assert!(manager.health().healthy);

    manager.disconnect().await;
    assert_eq!(manager.status(), ConnectionStatus::Disconnected);
}

#[tokio::test]
async fn test_unreachable_live_channel_falls_back_to_polling() {
    let url = spawn_backend(10).await;
    let mut config = client_config(url.clone());
    // Poll the real server while the live channel points nowhere
    config.server_url = "http://127.0.0.1:9".to_string();
    let connector = Arc::new(consult_chat_client::transport::WsConnector::new(
        config.websocket_url(),
    ));
    let poller = Arc::new(consult_chat_client::transport::HttpPollingClient::new(
        format!("{}/api/chat/poll", url),
        Duration::from_secs(5),
    ));
    let manager = TransportManager::new(config, connector, poller);

    assert_eq!(manager.connect("e2e-poll").await, ConnectionStatus::Reconnecting);

    let outcome = manager
        .send(MessageRequest::new("Is polling enough for now?"))
        .outcome()
        .await;
    match outcome {
        DeliveryOutcome::Delivered(reply) => assert_eq!(reply.session_id, "e2e-poll"),
        other => panic!("Expected delivery, got {:?}", other),
    }

    tokio::time::timeout(Duration::from_secs(2), async {
        while manager.status() != ConnectionStatus::Failed {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn test_capacity_is_reported_as_busy() {
    let url = spawn_backend(1).await;

    let first = TransportManager::from_config(client_config(url.clone()));
    first.connect("occupant").await;
    let outcome = first
        .send(MessageRequest::new("Taking the only seat"))
        .outcome()
        .await;
    assert!(matches!(outcome, DeliveryOutcome::Delivered(_)));

    let second = TransportManager::from_config(client_config(url));
    second.connect("latecomer").await;
    let outcome = second
        .send(MessageRequest::new("Is there room for me?"))
        .outcome()
        .await;
    match outcome {
        DeliveryOutcome::Busy { retry_after, .. } => assert_eq!(retry_after, Duration::from_secs(5)),
        other => panic!("Expected busy, got {:?}", other),
    }
}
