//! Health, metrics, and runtime settings endpoints

use crate::balancer::BalancerMetrics;
use crate::cache::CacheStats;
use crate::error::AppError;
use crate::monitor::{
    HealthVerdict, MonitorThresholds, PerformanceMetrics, ThresholdUpdate, ThresholdViolation,
};
use crate::state::AppState;
use axum::{extract::State, http::StatusCode, response::Json};
use serde::{Deserialize, Serialize};
use tracing::info;

/// Health response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// Health verdict
    pub status: HealthVerdict,
    /// Thresholds that do not hold
    pub violated_thresholds: Vec<ThresholdViolation>,
    /// Crate version
    pub version: String,
}

/// Aggregated metrics response
#[derive(Debug, Serialize)]
pub struct MetricsResponse {
    /// Performance monitor counters
    pub performance: PerformanceMetrics,
    /// Response cache statistics
    pub cache: CacheStats,
    /// Load balancer state
    pub balancer: BalancerMetrics,
}

/// Request to toggle the response cache
#[derive(Debug, Deserialize)]
pub struct CacheToggleRequest {
    /// Whether the cache is consulted
    pub enabled: bool,
}

/// GET /api/health - Health verdict; 503 when unhealthy
pub async fn health(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let snapshot = state.monitor.health_status();
    let code = match snapshot.status {
        HealthVerdict::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
        HealthVerdict::Healthy | HealthVerdict::Degraded => StatusCode::OK,
    };

    (
        code,
        Json(HealthResponse {
            status: snapshot.status,
            violated_thresholds: snapshot.violated_thresholds,
            version: env!("CARGO_PKG_VERSION").to_string(),
        }),
    )
}

/// GET /api/metrics - Monitor counters plus cache and balancer state
pub async fn metrics(State(state): State<AppState>) -> Json<MetricsResponse> {
    Json(MetricsResponse {
        performance: state.monitor.metrics(),
        cache: state.cache.stats().await,
        balancer: state.balancer.metrics(),
    })
}

/// GET /api/balancer - Per-resource load
pub async fn balancer_metrics(State(state): State<AppState>) -> Json<BalancerMetrics> {
    Json(state.balancer.metrics())
}

/// GET /api/cache/stats - Cache statistics
pub async fn cache_stats(State(state): State<AppState>) -> Json<CacheStats> {
    Json(state.cache.stats().await)
}

/// PUT /api/cache - Enable or disable the cache at runtime
pub async fn set_cache_enabled(
    State(state): State<AppState>,
    Json(request): Json<CacheToggleRequest>,
) -> Json<CacheStats> {
    state.cache.set_enabled(request.enabled);
    info!(enabled = request.enabled, "Response cache toggled");
    Json(state.cache.stats().await)
}

/// GET /api/monitor/thresholds - Current health thresholds
pub async fn get_thresholds(State(state): State<AppState>) -> Json<MonitorThresholds> {
    Json(state.monitor.thresholds())
}

/// PUT /api/monitor/thresholds - Update health thresholds
pub async fn update_thresholds(
    State(state): State<AppState>,
    Json(update): Json<ThresholdUpdate>,
) -> Result<Json<MonitorThresholds>, AppError> {
    let updated = state.monitor.update_thresholds(update)?;
    info!(?updated, "Monitor thresholds updated");
    Ok(Json(updated))
}
