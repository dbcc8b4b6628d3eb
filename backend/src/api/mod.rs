//! API module
//!
//! Contains the HTTP request handlers and the router that mounts them.

pub mod chat;
pub mod system;

use crate::state::AppState;
use crate::websocket;
use axum::{
    extract::Request,
    middleware::Next,
    response::Response,
    routing::{delete, get, post, put},
    Router,
};
use std::time::Instant;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, info_span, Instrument};
use uuid::Uuid;

/// Request ID middleware - adds unique ID to each request for tracing
async fn request_id_middleware(request: Request, next: Next) -> Response {
    let request_id = Uuid::new_v4().to_string();
    let method = request.method().clone();
    let uri = request.uri().clone();
    let start = Instant::now();

    let span = info_span!(
        "request",
        request_id = %request_id,
        method = %method,
        uri = %uri,
    );

    let response = next.run(request).instrument(span).await;

    info!(
        request_id = %request_id,
        method = %method,
        uri = %uri,
        status = %response.status().as_u16(),
        duration_ms = start.elapsed().as_millis(),
        "Request completed"
    );

    response
}

/// Build the application router
///
/// # Arguments
/// * `state` - Shared application state
///
/// # Returns
/// A router with every endpoint and the tracing/CORS middleware applied
pub fn router(state: AppState) -> Router {
    Router::new()
        // Chat
        .route("/api/chat/message", post(chat::send_message))
        .route("/api/chat/poll", post(chat::poll))
        .route(
            "/api/chat/sessions/:id/messages",
            get(chat::list_session_messages),
        )
        .route("/api/chat/sessions/:id", delete(chat::close_session))
        // Health and metrics
        .route("/api/health", get(system::health))
        .route("/api/metrics", get(system::metrics))
        .route("/api/balancer", get(system::balancer_metrics))
        // Runtime settings
        .route("/api/cache", put(system::set_cache_enabled))
        .route("/api/cache/stats", get(system::cache_stats))
        .route(
            "/api/monitor/thresholds",
            get(system::get_thresholds).put(system::update_thresholds),
        )
        // Persistent connection
        .route("/ws", get(websocket::websocket_handler))
        // Middleware (order matters - request_id should be first)
        .layer(axum::middleware::from_fn(request_id_middleware))
        .layer(
            TraceLayer::new_for_http().make_span_with(|request: &axum::http::Request<_>| {
                tracing::info_span!(
                    "http_request",
                    method = %request.method(),
                    uri = %request.uri(),
                )
            }),
        )
        .layer(CorsLayer::permissive())
        .with_state(state)
}
