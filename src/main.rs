//! Consult Chat terminal client
//!
//! Reads messages from stdin, sends them through the transport manager, and
//! prints replies and connection status changes.
//!
//! Commands: `/status` prints connection health, `/quit` exits.

use consult_chat_backend::chat::ClientContext;
use consult_chat_backend::protocol::MessageRequest;
use consult_chat_client::{DeliveryOutcome, TransportConfig, TransportManager};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::info;
use uuid::Uuid;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let config = TransportConfig::from_env();
    info!(server = %config.server_url, "Configuration loaded");

    let session_id =
        std::env::var("CHAT_SESSION_ID").unwrap_or_else(|_| Uuid::new_v4().to_string());
    let context = match std::env::var("CHAT_CLIENT_NAME") {
        Ok(name) if !name.trim().is_empty() => ClientContext::for_client(name.trim()),
        _ => ClientContext::default(),
    };
    let context = match std::env::var("CHAT_MEETING_TYPE") {
        Ok(meeting) if !meeting.trim().is_empty() => context.with_meeting_type(meeting.trim()),
        _ => context,
    };

    let manager = TransportManager::from_config(config);
    manager.on_status_change(|status| println!("[{}]", status));

    let status = manager.connect(session_id.clone()).await;
    println!("Session {} ({})", session_id, status);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        match line {
            "" => continue,
            "/quit" => break,
            "/status" => {
                let health = manager.health();
                match health.last_rtt_ms {
                    Some(rtt) => println!(
                        "{} (rtt {} ms, {})",
                        health.status,
                        rtt,
                        if health.healthy { "healthy" } else { "slow" }
                    ),
                    None => println!("{}", health.status),
                }
                continue;
            }
            _ => {}
        }

        let request = MessageRequest {
            session_id: Some(session_id.clone()),
            context: context.clone(),
            ..MessageRequest::new(line)
        };
        let receipt = manager.send(request);

        // Print answers as they arrive; the prompt stays responsive
        tokio::spawn(async move {
            match receipt.outcome().await {
                DeliveryOutcome::Delivered(reply) => {
                    println!(
                        "\n{}\n  ({}, {} ms)",
                        reply.content,
                        reply.source.as_str(),
                        reply.response_time_ms
                    );
                }
                DeliveryOutcome::Busy { retry_after, message } => {
                    println!("{} Try again in {} s.", message, retry_after.as_secs());
                }
                DeliveryOutcome::Failed(e) => {
                    println!("Message not delivered: {}", e);
                }
            }
        });
    }

    manager.disconnect().await;
    Ok(())
}
