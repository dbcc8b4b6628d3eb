//! Channel capabilities
//!
//! The manager only knows these traits. Production uses a WebSocket
//! ([`WsConnector`]) and the HTTP polling endpoint ([`HttpPollingClient`]);
//! tests plug in doubles.

use super::TransportError;
use async_trait::async_trait;
use consult_chat_backend::protocol::{ClientFrame, ServerFrame};
use futures_util::{SinkExt, StreamExt};
use reqwest::Client;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

/// Capability to open a persistent channel
#[async_trait]
pub trait LiveConnector: Send + Sync {
    /// Open a new channel; `Unsupported` means never retry
    async fn open(&self) -> Result<Box<dyn LiveLink>, TransportError>;
}

/// An open persistent channel
#[async_trait]
pub trait LiveLink: Send {
    /// Write one frame
    async fn send(&mut self, frame: &ClientFrame) -> Result<(), TransportError>;

    /// Next frame from the server; `Ok(None)` once the channel closed
    async fn recv(&mut self) -> Result<Option<ServerFrame>, TransportError>;

    /// Close the channel
    async fn close(&mut self);
}

/// Capability to exchange one frame over request/response
#[async_trait]
pub trait PollingClient: Send + Sync {
    /// Send a frame and return the server's answer
    async fn exchange(&self, frame: &ClientFrame) -> Result<ServerFrame, TransportError>;
}

/// WebSocket connector
pub struct WsConnector {
    url: String,
}

impl WsConnector {
    /// Connect to the given `ws://` or `wss://` URL
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait]
impl LiveConnector for WsConnector {
    async fn open(&self) -> Result<Box<dyn LiveLink>, TransportError> {
        match connect_async(self.url.as_str()).await {
            Ok((stream, _response)) => {
                debug!(url = %self.url, "WebSocket opened");
                Ok(Box::new(WsLink { stream }))
            }
            Err(tungstenite::Error::Http(response))
                if matches!(response.status().as_u16(), 404 | 405) =>
            {
                Err(TransportError::Unsupported(format!(
                    "upgrade answered with HTTP {}",
                    response.status()
                )))
            }
            Err(e) => Err(TransportError::Connect(e.to_string())),
        }
    }
}

/// An open WebSocket
pub struct WsLink {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl LiveLink for WsLink {
    async fn send(&mut self, frame: &ClientFrame) -> Result<(), TransportError> {
        let text =
            serde_json::to_string(frame).map_err(|e| TransportError::Protocol(e.to_string()))?;
        self.stream
            .send(Message::Text(text))
            .await
            .map_err(|e| TransportError::Send(e.to_string()))
    }

    async fn recv(&mut self) -> Result<Option<ServerFrame>, TransportError> {
        while let Some(message) = self.stream.next().await {
            match message {
                Ok(Message::Text(text)) => match serde_json::from_str::<ServerFrame>(&text) {
                    Ok(frame) => return Ok(Some(frame)),
                    Err(e) => warn!("Ignoring unreadable server frame: {}", e),
                },
                Ok(Message::Close(_)) => return Ok(None),
                // Keepalive pings are answered by tungstenite
                Ok(_) => {}
                Err(e) => {
                    debug!("WebSocket read failed: {}", e);
                    return Err(TransportError::Closed);
                }
            }
        }
        Ok(None)
    }

    async fn close(&mut self) {
        if let Err(e) = self.stream.close(None).await {
            debug!("WebSocket close failed: {}", e);
        }
    }
}

/// Polling over `POST /api/chat/poll`
pub struct HttpPollingClient {
    client: Client,
    url: String,
}

impl HttpPollingClient {
    /// Create a client for the given poll URL
    ///
    /// # Arguments
    /// * `url` - Full URL of the polling endpoint
    /// * `timeout` - Deadline for one request; it covers the server's provider call
    pub fn new(url: impl Into<String>, timeout: Duration) -> Self {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| Client::new());
        Self {
            client,
            url: url.into(),
        }
    }
}

#[async_trait]
impl PollingClient for HttpPollingClient {
    async fn exchange(&self, frame: &ClientFrame) -> Result<ServerFrame, TransportError> {
        let response = self
            .client
            .post(&self.url)
            .json(frame)
            .send()
            .await
            .map_err(|e| TransportError::Poll(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::Poll(format!("HTTP {}", status)));
        }

        response
            .json::<ServerFrame>()
            .await
            .map_err(|e| TransportError::Protocol(e.to_string()))
    }
}
