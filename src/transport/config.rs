// Transport configuration
// Loaded from environment variables with defaults

use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Client transport configuration
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Base HTTP URL of the chat server (e.g. `http://localhost:8080`)
    pub server_url: String,
    /// Delay before the first reconnect attempt (in milliseconds)
    pub reconnect_base_ms: u64,
    /// Upper bound for any reconnect delay (in milliseconds)
    pub reconnect_max_delay_ms: u64,
    /// Failed reconnect attempts tolerated before giving up on the live channel
    pub max_reconnect_attempts: u32,
    /// Deadline for opening the live channel (in milliseconds)
    pub connect_timeout_ms: u64,
    /// Interval between heartbeats on the live channel (in milliseconds)
    pub heartbeat_interval_ms: u64,
    /// Heartbeat round trip above which the channel counts as unhealthy
    pub unhealthy_latency_ms: u64,
    /// Wait between attempts of one polling request (in milliseconds)
    pub poll_interval_ms: u64,
    /// Attempts per polling request before the send fails
    pub poll_max_attempts: u32,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            server_url: "http://localhost:8080".to_string(),
            reconnect_base_ms: 1_000,
            reconnect_max_delay_ms: 30_000,
            max_reconnect_attempts: 10,
            connect_timeout_ms: 5_000,
            heartbeat_interval_ms: 15_000,
            unhealthy_latency_ms: 1_000,
            poll_interval_ms: 2_000,
            poll_max_attempts: 3,
        }
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

impl TransportConfig {
    /// Load configuration from environment variables with defaults
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            server_url: env::var("CHAT_SERVER_URL")
                .map(|url| url.trim_end_matches('/').to_string())
                .unwrap_or(defaults.server_url),
            reconnect_base_ms: env_or("RECONNECT_BASE_MS", defaults.reconnect_base_ms),
            reconnect_max_delay_ms: env_or(
                "RECONNECT_MAX_DELAY_MS",
                defaults.reconnect_max_delay_ms,
            ),
            max_reconnect_attempts: env_or(
                "MAX_RECONNECT_ATTEMPTS",
                defaults.max_reconnect_attempts,
            ),
            connect_timeout_ms: env_or("CONNECT_TIMEOUT_MS", defaults.connect_timeout_ms),
            heartbeat_interval_ms: env_or(
                "HEARTBEAT_INTERVAL_MS",
                defaults.heartbeat_interval_ms,
            ),
            unhealthy_latency_ms: env_or("UNHEALTHY_LATENCY_MS", defaults.unhealthy_latency_ms),
            poll_interval_ms: env_or("POLL_INTERVAL_MS", defaults.poll_interval_ms),
            poll_max_attempts: env_or("POLL_MAX_ATTEMPTS", defaults.poll_max_attempts).max(1),
        }
    }

    /// WebSocket endpoint derived from the server URL
    pub fn websocket_url(&self) -> String {
        let base = if let Some(rest) = self.server_url.strip_prefix("https://") {
            format!("wss://{}", rest)
        } else if let Some(rest) = self.server_url.strip_prefix("http://") {
            format!("ws://{}", rest)
        } else {
            self.server_url.clone()
        };
        format!("{}/ws", base)
    }

    /// Polling endpoint derived from the server URL
    pub fn poll_url(&self) -> String {
        format!("{}/api/chat/poll", self.server_url)
    }

    /// Get the connect deadline as a Duration
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Get the heartbeat interval as a Duration
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms.max(1))
    }

    /// Get the polling retry wait as a Duration
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}
