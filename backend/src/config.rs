//! Application configuration
//!
//! Centralized configuration management with environment variable support
//! and sensible defaults.

use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Application configuration
#[derive(Debug, Clone, Default)]
pub struct Config {
    /// Server configuration
    pub server: ServerConfig,
    /// Text-generation provider configuration
    pub provider: ProviderConfig,
    /// Response cache configuration
    pub cache: CacheConfig,
    /// Session load balancer configuration
    pub balancer: BalancerConfig,
    /// Performance monitor thresholds
    pub monitor: MonitorConfig,
    /// Session lifecycle and persistence configuration
    pub sessions: SessionConfig,
}

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Port to bind the server to
    pub port: u16,
    /// Host address to bind to
    pub host: String,
    /// Interval of the background maintenance task (rebalance, expiry, purge)
    pub maintenance_interval_secs: u64,
}

/// Text-generation provider configuration
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    /// API key for the provider (empty means every call fails with `auth`)
    pub api_key: String,
    /// Model name
    pub model: String,
    /// Provider API base URL
    pub base_url: String,
    /// Hard timeout for a single provider call (in milliseconds)
    pub timeout_ms: u64,
    /// Maximum output length requested from the provider
    pub max_output_tokens: u32,
    /// Sampling temperature
    pub temperature: f32,
    /// Upper bound for the sleep before the single retry (in milliseconds)
    pub max_retry_backoff_ms: u64,
}

/// Response cache configuration
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Whether the cache starts enabled
    pub enabled: bool,
    /// Time-to-live for cached answers (in seconds)
    pub ttl_secs: u64,
    /// Messages shorter than this (after normalization) are never cached
    pub min_content_len: usize,
    /// Timeout for a single key-value store call (in milliseconds)
    pub io_timeout_ms: u64,
}

/// Session load balancer configuration
#[derive(Debug, Clone)]
pub struct BalancerConfig {
    /// Identifiers of the backing resources sessions are spread across
    pub resources: Vec<String>,
    /// Global cap on concurrently tracked sessions
    pub max_concurrent_sessions: usize,
    /// Cap on sessions tracked by a single resource
    pub max_sessions_per_resource: usize,
    /// Average response time above which a resource sheds sessions (in milliseconds)
    pub latency_target_ms: u64,
    /// Weight of the normalized response time in the load score
    pub latency_weight: f64,
}

/// Performance monitor thresholds
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// A single response slower than this logs a warning (in milliseconds)
    pub slow_response_ms: u64,
    /// Highest acceptable average response time (in milliseconds)
    pub max_avg_response_ms: f64,
    /// Lowest acceptable cache hit rate (0.0 - 1.0)
    pub min_cache_hit_rate: f64,
    /// Highest acceptable provider error rate (0.0 - 1.0)
    pub max_error_rate: f64,
    /// Highest acceptable share of fallback answers (0.0 - 1.0)
    pub max_fallback_rate: f64,
    /// Samples required before rate thresholds are evaluated
    pub min_samples: u64,
}

/// Session lifecycle and persistence configuration
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Inactivity after which an active session is marked idle (in seconds)
    pub idle_after_secs: u64,
    /// Inactivity after which a session expires (in seconds)
    pub idle_timeout_secs: u64,
    /// SQLite database path; unset keeps sessions in memory
    pub database_path: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            host: "0.0.0.0".to_string(),
            maintenance_interval_secs: 30,
        }
    }
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            model: "gemini-2.5-flash".to_string(),
            base_url: "https://generativelanguage.googleapis.com/v1beta".to_string(),
            timeout_ms: 3_000,
            max_output_tokens: 1_024,
            temperature: 0.4,
            max_retry_backoff_ms: 2_000,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_secs: 3_600,
            min_content_len: 10,
            io_timeout_ms: 2_000,
        }
    }
}

impl Default for BalancerConfig {
    fn default() -> Self {
        Self {
            resources: vec!["primary".to_string(), "secondary".to_string()],
            max_concurrent_sessions: 100,
            max_sessions_per_resource: 60,
            latency_target_ms: 2_500,
            latency_weight: 2.0,
        }
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            slow_response_ms: 5_000,
            max_avg_response_ms: 3_000.0,
            min_cache_hit_rate: 0.05,
            max_error_rate: 0.25,
            max_fallback_rate: 0.5,
            min_samples: 20,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_after_secs: 300,
            idle_timeout_secs: 1_800,
            database_path: None,
        }
    }
}

/// Read and parse an environment variable, falling back to `default`
/// when it is unset or does not parse.
fn env_or<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

impl Config {
    /// Load configuration from environment variables with defaults
    pub fn from_env() -> Self {
        let server = ServerConfig::default();
        let provider = ProviderConfig::default();
        let cache = CacheConfig::default();
        let balancer = BalancerConfig::default();
        let monitor = MonitorConfig::default();
        let sessions = SessionConfig::default();

        Self {
            server: ServerConfig {
                port: env_or("PORT", server.port),
                host: env::var("HOST").unwrap_or(server.host),
                maintenance_interval_secs: env_or(
                    "MAINTENANCE_INTERVAL_SECS",
                    server.maintenance_interval_secs,
                ),
            },
            provider: ProviderConfig {
                api_key: env::var("GEMINI_API_KEY").unwrap_or_default(),
                model: env::var("GEMINI_MODEL").unwrap_or(provider.model),
                base_url: env::var("GEMINI_API_BASE_URL").unwrap_or(provider.base_url),
                timeout_ms: env_or("PROVIDER_TIMEOUT_MS", provider.timeout_ms),
                max_output_tokens: env_or(
                    "PROVIDER_MAX_OUTPUT_TOKENS",
                    provider.max_output_tokens,
                ),
                temperature: env_or("PROVIDER_TEMPERATURE", provider.temperature),
                max_retry_backoff_ms: env_or(
                    "PROVIDER_MAX_RETRY_BACKOFF_MS",
                    provider.max_retry_backoff_ms,
                ),
            },
            cache: CacheConfig {
                enabled: env_or("CACHE_ENABLED", cache.enabled),
                ttl_secs: env_or("CACHE_TTL_SECS", cache.ttl_secs),
                min_content_len: env_or("CACHE_MIN_CONTENT_LEN", cache.min_content_len),
                io_timeout_ms: env_or("CACHE_IO_TIMEOUT_MS", cache.io_timeout_ms),
            },
            balancer: BalancerConfig {
                resources: env::var("BALANCER_RESOURCES")
                    .ok()
                    .map(|raw| {
                        raw.split(',')
                            .map(|s| s.trim().to_string())
                            .filter(|s| !s.is_empty())
                            .collect::<Vec<_>>()
                    })
                    .filter(|list| !list.is_empty())
                    .unwrap_or(balancer.resources),
                max_concurrent_sessions: env_or(
                    "MAX_CONCURRENT_SESSIONS",
                    balancer.max_concurrent_sessions,
                ),
                max_sessions_per_resource: env_or(
                    "MAX_SESSIONS_PER_RESOURCE",
                    balancer.max_sessions_per_resource,
                ),
                latency_target_ms: env_or("LATENCY_TARGET_MS", balancer.latency_target_ms),
                latency_weight: env_or("LATENCY_WEIGHT", balancer.latency_weight),
            },
            monitor: MonitorConfig {
                slow_response_ms: env_or("SLOW_RESPONSE_MS", monitor.slow_response_ms),
                max_avg_response_ms: env_or("MAX_AVG_RESPONSE_MS", monitor.max_avg_response_ms),
                min_cache_hit_rate: env_or("MIN_CACHE_HIT_RATE", monitor.min_cache_hit_rate),
                max_error_rate: env_or("MAX_ERROR_RATE", monitor.max_error_rate),
                max_fallback_rate: env_or("MAX_FALLBACK_RATE", monitor.max_fallback_rate),
                min_samples: env_or("MONITOR_MIN_SAMPLES", monitor.min_samples),
            },
            sessions: SessionConfig {
                idle_after_secs: env_or("SESSION_IDLE_AFTER_SECS", sessions.idle_after_secs),
                idle_timeout_secs: env_or(
                    "SESSION_IDLE_TIMEOUT_SECS",
                    sessions.idle_timeout_secs,
                ),
                database_path: env::var("DATABASE_PATH").ok().filter(|p| !p.is_empty()),
            },
        }
    }

    /// Get the server address as a string
    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

impl ProviderConfig {
    /// Timeout applied to every provider call
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl CacheConfig {
    /// Time-to-live for cached answers
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    /// Timeout applied to every key-value store call
    pub fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.io_timeout_ms)
    }
}

impl SessionConfig {
    /// Inactivity after which an active session is marked idle
    pub fn idle_after(&self) -> Duration {
        Duration::from_secs(self.idle_after_secs)
    }

    /// Inactivity after which a session expires
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_low_single_digit_timeouts() {
        let config = Config::default();
        assert!(config.provider.timeout() <= Duration::from_secs(5));
        assert!(config.cache.io_timeout() <= Duration::from_secs(5));
        assert_eq!(config.server_addr(), "0.0.0.0:8080");
    }

    #[test]
    fn test_default_balancer_has_resources() {
        let config = Config::default();
        assert!(!config.balancer.resources.is_empty());
        assert!(
            config.balancer.max_sessions_per_resource <= config.balancer.max_concurrent_sessions
        );
    }

    #[test]
    fn test_env_or_falls_back_on_garbage() {
        assert_eq!(env_or("CONSULT_CHAT_TEST_UNSET_VARIABLE", 42u64), 42);
    }
}
