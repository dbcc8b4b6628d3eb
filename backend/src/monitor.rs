//! Performance monitor
//!
//! Lock-free counters fed by the message path, the cache, the provider
//! client, and the balancer, plus a health verdict computed against
//! thresholds that can be changed at runtime.

use crate::config::MonitorConfig;
use crate::error::AppError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock};
use std::time::{Duration, Instant};
use tracing::warn;

/// Health verdict
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthVerdict {
    /// Every threshold holds
    Healthy,
    /// One threshold is violated
    Degraded,
    /// Several thresholds are violated, or one badly
    Unhealthy,
}

/// Thresholds the health verdict is evaluated against
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MonitorThresholds {
    /// A single response slower than this logs a warning (in milliseconds)
    pub slow_response_ms: u64,
    /// Highest acceptable average response time (in milliseconds)
    pub max_avg_response_ms: f64,
    /// Lowest acceptable cache hit rate
    pub min_cache_hit_rate: f64,
    /// Highest acceptable provider error rate
    pub max_error_rate: f64,
    /// Highest acceptable share of fallback answers
    pub max_fallback_rate: f64,
    /// Samples required before rate thresholds are evaluated
    pub min_samples: u64,
}

impl From<&MonitorConfig> for MonitorThresholds {
    fn from(config: &MonitorConfig) -> Self {
        Self {
            slow_response_ms: config.slow_response_ms,
            max_avg_response_ms: config.max_avg_response_ms,
            min_cache_hit_rate: config.min_cache_hit_rate,
            max_error_rate: config.max_error_rate,
            max_fallback_rate: config.max_fallback_rate,
            min_samples: config.min_samples,
        }
    }
}

impl Default for MonitorThresholds {
    fn default() -> Self {
        Self::from(&MonitorConfig::default())
    }
}

/// Request body for updating thresholds; absent fields are left unchanged
#[derive(Debug, Default, Deserialize)]
pub struct ThresholdUpdate {
    /// New slow-response ceiling (in milliseconds)
    pub slow_response_ms: Option<u64>,
    /// New maximum average response time (in milliseconds)
    pub max_avg_response_ms: Option<f64>,
    /// New minimum cache hit rate
    pub min_cache_hit_rate: Option<f64>,
    /// New maximum provider error rate
    pub max_error_rate: Option<f64>,
    /// New maximum fallback rate
    pub max_fallback_rate: Option<f64>,
    /// New minimum sample count
    pub min_samples: Option<u64>,
}

fn check_rate(name: &str, value: f64) -> Result<f64, AppError> {
    if !(0.0..=1.0).contains(&value) {
        return Err(AppError::InvalidRequest(format!(
            "{} must be between 0.0 and 1.0",
            name
        )));
    }
    Ok(value)
}

/// Validate and apply a threshold update
///
/// # Arguments
/// * `thresholds` - The current thresholds
/// * `update` - The update request with optional fields
///
/// # Returns
/// * `Ok(MonitorThresholds)` - The updated thresholds
/// * `Err(AppError)` - If any field is out of range; nothing is applied
pub fn validate_and_apply_threshold_update(
    mut thresholds: MonitorThresholds,
    update: ThresholdUpdate,
) -> Result<MonitorThresholds, AppError> {
    if let Some(slow) = update.slow_response_ms {
        if slow == 0 {
            return Err(AppError::InvalidRequest(
                "slow_response_ms must be > 0".to_string(),
            ));
        }
        thresholds.slow_response_ms = slow;
    }

    if let Some(avg) = update.max_avg_response_ms {
        if !avg.is_finite() || avg <= 0.0 {
            return Err(AppError::InvalidRequest(
                "max_avg_response_ms must be > 0".to_string(),
            ));
        }
        thresholds.max_avg_response_ms = avg;
    }

    if let Some(rate) = update.min_cache_hit_rate {
        thresholds.min_cache_hit_rate = check_rate("min_cache_hit_rate", rate)?;
    }

    if let Some(rate) = update.max_error_rate {
        thresholds.max_error_rate = check_rate("max_error_rate", rate)?;
    }

    if let Some(rate) = update.max_fallback_rate {
        thresholds.max_fallback_rate = check_rate("max_fallback_rate", rate)?;
    }

    if let Some(samples) = update.min_samples {
        if samples == 0 {
            return Err(AppError::InvalidRequest("min_samples must be > 0".to_string()));
        }
        thresholds.min_samples = samples;
    }

    Ok(thresholds)
}

/// Counter values plus derived rates
#[derive(Debug, Clone, Serialize)]
pub struct PerformanceMetrics {
    /// Live connections opened since start
    pub connections_opened: u64,
    /// Live connections closed since start
    pub connections_closed: u64,
    /// Currently open live connections
    pub active_connections: u64,
    /// Inbound chat messages
    pub messages_received: u64,
    /// Replies delivered
    pub messages_sent: u64,
    /// Responses timed
    pub responses: u64,
    /// Mean response time (in milliseconds)
    pub avg_response_ms: f64,
    /// Slowest response seen (in milliseconds)
    pub max_response_ms: u64,
    /// Responses above the slow-response ceiling
    pub slow_responses: u64,
    /// Cache hits
    pub cache_hits: u64,
    /// Cache misses
    pub cache_misses: u64,
    /// `hits / (hits + misses)`
    pub cache_hit_rate: f64,
    /// Provider calls attempted
    pub provider_calls: u64,
    /// Provider calls that failed (including empty answers)
    pub provider_errors: u64,
    /// `provider_errors / provider_calls`
    pub provider_error_rate: f64,
    /// Answers served from fallback templates
    pub fallbacks_served: u64,
    /// `fallbacks_served / responses`
    pub fallback_rate: f64,
    /// Sessions refused for capacity
    pub capacity_rejections: u64,
    /// Seconds since the monitor was created
    pub uptime_secs: u64,
}

/// A threshold that does not hold
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ThresholdViolation {
    /// Threshold name
    pub threshold: &'static str,
    /// Measured value
    pub observed: f64,
    /// Configured limit
    pub limit: f64,
}

/// Point-in-time aggregate plus health verdict
#[derive(Debug, Clone, Serialize)]
pub struct PerformanceSnapshot {
    /// Health verdict
    pub status: HealthVerdict,
    /// Thresholds that do not hold
    pub violated_thresholds: Vec<ThresholdViolation>,
    /// Counters the verdict was computed from
    pub metrics: PerformanceMetrics,
    /// When the snapshot was taken
    pub timestamp: DateTime<Utc>,
}

fn ratio(numerator: u64, denominator: u64) -> f64 {
    if denominator == 0 {
        0.0
    } else {
        numerator as f64 / denominator as f64
    }
}

/// Shared performance monitor
pub struct PerformanceMonitor {
    connections_opened: AtomicU64,
    connections_closed: AtomicU64,
    messages_received: AtomicU64,
    messages_sent: AtomicU64,
    responses: AtomicU64,
    response_time_total_ms: AtomicU64,
    max_response_ms: AtomicU64,
    slow_responses: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    provider_calls: AtomicU64,
    provider_errors: AtomicU64,
    fallbacks_served: AtomicU64,
    capacity_rejections: AtomicU64,
    slow_response_ms: AtomicU64,
    thresholds: RwLock<MonitorThresholds>,
    started_at: Instant,
}

impl PerformanceMonitor {
    /// Create a monitor with the given thresholds
    pub fn new(thresholds: MonitorThresholds) -> Self {
        Self {
            connections_opened: AtomicU64::new(0),
            connections_closed: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
            messages_sent: AtomicU64::new(0),
            responses: AtomicU64::new(0),
            response_time_total_ms: AtomicU64::new(0),
            max_response_ms: AtomicU64::new(0),
            slow_responses: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
            provider_calls: AtomicU64::new(0),
            provider_errors: AtomicU64::new(0),
            fallbacks_served: AtomicU64::new(0),
            capacity_rejections: AtomicU64::new(0),
            slow_response_ms: AtomicU64::new(thresholds.slow_response_ms),
            thresholds: RwLock::new(thresholds),
            started_at: Instant::now(),
        }
    }

    /// A live connection was opened
    pub fn record_connection_opened(&self) {
        self.connections_opened.fetch_add(1, Ordering::Relaxed);
    }

    /// A live connection was closed
    pub fn record_connection_closed(&self) {
        self.connections_closed.fetch_add(1, Ordering::Relaxed);
    }

    /// An inbound chat message arrived
    pub fn record_message_received(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    /// A reply was handed back to the transport
    pub fn record_message_sent(&self) {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
    }

    /// Time taken to answer one message
    ///
    /// Emits a warning when the response exceeds the slow-response ceiling.
    pub fn record_response_time(&self, elapsed: Duration) {
        let ms = elapsed.as_millis().min(u64::MAX as u128) as u64;
        self.responses.fetch_add(1, Ordering::Relaxed);
        self.response_time_total_ms.fetch_add(ms, Ordering::Relaxed);
        self.max_response_ms.fetch_max(ms, Ordering::Relaxed);

        let ceiling = self.slow_response_ms.load(Ordering::Relaxed);
        if ms > ceiling {
            self.slow_responses.fetch_add(1, Ordering::Relaxed);
            warn!(
                response_time_ms = ms,
                slow_response_ms = ceiling,
                "Slow response"
            );
        }
    }

    /// The cache answered a lookup
    pub fn record_cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    /// The cache had no answer
    pub fn record_cache_miss(&self) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    /// A provider call was attempted
    pub fn record_provider_call(&self) {
        self.provider_calls.fetch_add(1, Ordering::Relaxed);
    }

    /// A provider call failed or returned nothing usable
    pub fn record_provider_error(&self) {
        self.provider_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// An answer came from a fallback template
    pub fn record_fallback_served(&self) {
        self.fallbacks_served.fetch_add(1, Ordering::Relaxed);
    }

    /// The balancer refused a session
    pub fn record_capacity_rejection(&self) {
        self.capacity_rejections.fetch_add(1, Ordering::Relaxed);
    }

    /// Current thresholds
    pub fn thresholds(&self) -> MonitorThresholds {
        self.thresholds
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Validate and apply a threshold update
    pub fn update_thresholds(&self, update: ThresholdUpdate) -> Result<MonitorThresholds, AppError> {
        let mut guard = self
            .thresholds
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let updated = validate_and_apply_threshold_update(guard.clone(), update)?;
        // Published under the write lock so it never trails the thresholds
        self.slow_response_ms
            .store(updated.slow_response_ms, Ordering::Relaxed);
        *guard = updated.clone();
        Ok(updated)
    }

    /// Counter values plus derived rates
    pub fn metrics(&self) -> PerformanceMetrics {
        let opened = self.connections_opened.load(Ordering::Relaxed);
        let closed = self.connections_closed.load(Ordering::Relaxed);
        let responses = self.responses.load(Ordering::Relaxed);
        let total_ms = self.response_time_total_ms.load(Ordering::Relaxed);
        let hits = self.cache_hits.load(Ordering::Relaxed);
        let misses = self.cache_misses.load(Ordering::Relaxed);
        let calls = self.provider_calls.load(Ordering::Relaxed);
        let errors = self.provider_errors.load(Ordering::Relaxed);
        let fallbacks = self.fallbacks_served.load(Ordering::Relaxed);

        PerformanceMetrics {
            connections_opened: opened,
            connections_closed: closed,
            active_connections: opened.saturating_sub(closed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            responses,
            avg_response_ms: ratio(total_ms, responses),
            max_response_ms: self.max_response_ms.load(Ordering::Relaxed),
            slow_responses: self.slow_responses.load(Ordering::Relaxed),
            cache_hits: hits,
            cache_misses: misses,
            cache_hit_rate: ratio(hits, hits + misses),
            provider_calls: calls,
            provider_errors: errors,
            provider_error_rate: ratio(errors, calls),
            fallbacks_served: fallbacks,
            fallback_rate: ratio(fallbacks, responses),
            capacity_rejections: self.capacity_rejections.load(Ordering::Relaxed),
            uptime_secs: self.started_at.elapsed().as_secs(),
        }
    }

    /// Evaluate thresholds against current counters
    pub fn health_status(&self) -> PerformanceSnapshot {
        let metrics = self.metrics();
        let thresholds = self.thresholds();
        let mut violations = Vec::new();
        let mut severe = false;

        if metrics.responses > 0 && metrics.avg_response_ms > thresholds.max_avg_response_ms {
            violations.push(ThresholdViolation {
                threshold: "max_avg_response_ms",
                observed: metrics.avg_response_ms,
                limit: thresholds.max_avg_response_ms,
            });
        }

        let lookups = metrics.cache_hits + metrics.cache_misses;
        if lookups >= thresholds.min_samples
            && metrics.cache_hit_rate < thresholds.min_cache_hit_rate
        {
            violations.push(ThresholdViolation {
                threshold: "min_cache_hit_rate",
                observed: metrics.cache_hit_rate,
                limit: thresholds.min_cache_hit_rate,
            });
        }

        if metrics.provider_calls >= thresholds.min_samples
            && metrics.provider_error_rate > thresholds.max_error_rate
        {
            severe = metrics.provider_error_rate > thresholds.max_error_rate * 2.0;
            violations.push(ThresholdViolation {
                threshold: "max_error_rate",
                observed: metrics.provider_error_rate,
                limit: thresholds.max_error_rate,
            });
        }

        if metrics.responses >= thresholds.min_samples
            && metrics.fallback_rate > thresholds.max_fallback_rate
        {
            violations.push(ThresholdViolation {
                threshold: "max_fallback_rate",
                observed: metrics.fallback_rate,
                limit: thresholds.max_fallback_rate,
            });
        }

        let status = match violations.len() {
            0 => HealthVerdict::Healthy,
            1 if !severe => HealthVerdict::Degraded,
            _ => HealthVerdict::Unhealthy,
        };

        PerformanceSnapshot {
            status,
            violated_thresholds: violations,
            metrics,
            timestamp: Utc::now(),
        }
    }
}

impl Default for PerformanceMonitor {
    fn default() -> Self {
        Self::new(MonitorThresholds::default())
    }
}
