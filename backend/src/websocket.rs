//! WebSocket transport
//!
//! The persistent-connection counterpart of `POST /api/chat/poll`: clients
//! send [`ClientFrame`]s and receive [`ServerFrame`]s. Messages on one
//! connection are answered in the order they arrive; heartbeats are answered
//! immediately. Supports ping/pong for connection keepalive.

use crate::api::chat::answer_frame;
use crate::protocol::{ClientFrame, ServerFrame};
use crate::state::AppState;
use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Interval between server-initiated keepalive pings (in seconds)
const KEEPALIVE_INTERVAL_SECS: u64 = 30;

/// A frame queued for the socket, with the reply it delivers (if any)
struct Outbound {
    message: Message,
    delivers: Option<(String, String)>,
}

impl Outbound {
    fn frame(frame: &ServerFrame) -> Option<Self> {
        let delivers = match frame {
            ServerFrame::Reply(reply) => Some((reply.session_id.clone(), reply.message_id.clone())),
            _ => None,
        };
        match serde_json::to_string(frame) {
            Ok(text) => Some(Self {
                message: Message::Text(text),
                delivers,
            }),
            Err(e) => {
                error!("Failed to serialize frame: {}", e);
                None
            }
        }
    }
}

/// WebSocket upgrade handler
///
/// # Arguments
/// * `ws` - WebSocket upgrade request
/// * `state` - Application state
///
/// # Returns
/// * `Response` - HTTP response initiating WebSocket connection
pub async fn websocket_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

// Handle WebSocket connection
async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut sender, mut receiver) = socket.split();

    state.monitor.record_connection_opened();
    info!("WebSocket client connected");

    // Use a channel to send messages from the other tasks to the sender
    let (tx, mut rx) = mpsc::unbounded_channel::<Outbound>();

    // Task to forward queued frames to the socket
    let delivery_state = state.clone();
    let mut send_task = tokio::spawn(async move {
        while let Some(outbound) = rx.recv().await {
            if let Err(e) = sender.send(outbound.message).await {
                error!("Failed to send message: {}", e);
                break;
            }
            if let Some((session_id, message_id)) = outbound.delivers {
                delivery_state
                    .chat
                    .mark_delivered(&session_id, &message_id)
                    .await;
            }
        }
    });

    // Task to send periodic pings
    let ping_tx = tx.clone();
    let mut ping_task = tokio::spawn(async move {
        loop {
            tokio::time::sleep(tokio::time::Duration::from_secs(KEEPALIVE_INTERVAL_SECS)).await;
            let ping = Outbound {
                message: Message::Ping(vec![]),
                delivers: None,
            };
            if ping_tx.send(ping).is_err() {
                break;
            }
        }
    });

    // Sequential worker: one message at a time, in arrival order
    let (work_tx, mut work_rx) = mpsc::unbounded_channel::<ClientFrame>();
    let worker_tx = tx.clone();
    let worker_state = state.clone();
    let worker = tokio::spawn(async move {
        while let Some(frame) = work_rx.recv().await {
            let reply = answer_frame(&worker_state.chat, frame).await;
            if let Some(outbound) = Outbound::frame(&reply) {
                if worker_tx.send(outbound).is_err() {
                    break;
                }
            }
        }
    });

    // Receive messages
    let mut recv_task = tokio::spawn(async move {
        while let Some(msg) = receiver.next().await {
            match msg {
                Ok(Message::Text(text)) => match serde_json::from_str::<ClientFrame>(&text) {
                    Ok(ClientFrame::Ping { sent_at_ms }) => {
                        let Some(pong) = Outbound::frame(&ServerFrame::Pong { sent_at_ms }) else {
                            continue;
                        };
                        if tx.send(pong).is_err() {
                            break;
                        }
                    }
                    Ok(frame) => {
                        if work_tx.send(frame).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!("Received unreadable WebSocket frame: {}", e);
                        let error = ServerFrame::Error {
                            message: format!("Unreadable frame: {}", e),
                            client_message_id: None,
                        };
                        if let Some(outbound) = Outbound::frame(&error) {
                            if tx.send(outbound).is_err() {
                                break;
                            }
                        }
                    }
                },
                Ok(Message::Close(_)) => {
                    info!("WebSocket client disconnected");
                    break;
                }
                Ok(Message::Pong(_)) => {
                    debug!("Keepalive pong received");
                }
                Err(e) => {
                    error!("WebSocket error: {}", e);
                    break;
                }
                _ => {}
            }
        }
    });

    // Wait for any task to complete
    tokio::select! {
        _ = &mut send_task => {
            ping_task.abort();
            recv_task.abort();
        }
        _ = &mut ping_task => {
            send_task.abort();
            recv_task.abort();
        }
        _ = &mut recv_task => {
            send_task.abort();
            ping_task.abort();
        }
    }

    // Queued messages are dropped with the connection; a provider call that
    // already started keeps running and fills the cache.
    worker.abort();

    state.monitor.record_connection_closed();
    info!("WebSocket connection closed");
}
