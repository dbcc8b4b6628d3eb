//! Consult Chat Backend
//!
//! HTTP, WebSocket, and polling server for the consultation chat assistant.

use consult_chat_backend::{
    api,
    cache::{KeyValueStore, MemoryStore},
    chat::{MemorySessionStore, SessionStore, SqliteSessionStore},
    config::Config,
    maintenance,
    provider::GeminiGenerator,
    state::AppState,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // Load configuration
    let config = Config::from_env();
    info!(
        addr = %config.server_addr(),
        model = %config.provider.model,
        cache_enabled = config.cache.enabled,
        resources = ?config.balancer.resources,
        "Configuration loaded"
    );

    if config.provider.api_key.is_empty() {
        warn!("GEMINI_API_KEY is not set; every answer will come from fallback templates");
    }

    // Session persistence
    let sessions: Arc<dyn SessionStore> = match &config.sessions.database_path {
        Some(path) => {
            let store = SqliteSessionStore::new(path).await?;
            info!("Session database opened at {}", path);
            Arc::new(store)
        }
        None => {
            info!("DATABASE_PATH not set, keeping sessions in memory");
            Arc::new(MemorySessionStore::new())
        }
    };

    let generator = Arc::new(GeminiGenerator::from_config(&config.provider));
    let kv: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
    let maintenance_period = Duration::from_secs(config.server.maintenance_interval_secs);

    // Bind to address from config
    let addr: SocketAddr = config
        .server_addr()
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid server address: {}", e))?;

    let state = AppState::build(config, generator, kv, sessions);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let maintenance = maintenance::spawn(state.clone(), maintenance_period, shutdown_rx);

    let app = api::router(state);

    info!("🚀 Server running on http://{}", addr);
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let listener = tokio::net::TcpListener::bind(&addr).await?;

    // Setup graceful shutdown
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    let _ = shutdown_tx.send(true);
    if let Err(e) = maintenance.await {
        warn!("Maintenance task ended abnormally: {}", e);
    }

    info!("Server shutdown complete");
    Ok(())
}

/// Handle graceful shutdown signals (Ctrl+C, SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down gracefully...");
        },
        _ = terminate => {
            info!("Received SIGTERM, shutting down gracefully...");
        },
    }
}
