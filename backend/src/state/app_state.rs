// Application state
// Owns the shared components of the chat core; built once at startup and
// handed to every handler

use crate::balancer::SessionLoadBalancer;
use crate::cache::{KeyValueStore, ResponseCache};
use crate::chat::service::ChatService;
use crate::chat::store::SessionStore;
use crate::config::Config;
use crate::fallback::{FallbackOrchestrator, OrchestratorSettings};
use crate::monitor::{MonitorThresholds, PerformanceMonitor};
use crate::provider::TextGenerator;
use std::sync::Arc;

/// Shared application state
///
/// Every component is constructed here and passed explicitly; nothing in
/// the crate keeps global state. Cloning is cheap (all fields are `Arc`).
#[derive(Clone)]
pub struct AppState {
    /// Loaded configuration
    pub config: Arc<Config>,
    /// Response cache
    pub cache: Arc<ResponseCache>,
    /// Cache → provider → template pipeline
    pub orchestrator: Arc<FallbackOrchestrator>,
    /// Session load balancer
    pub balancer: Arc<SessionLoadBalancer>,
    /// Performance monitor
    pub monitor: Arc<PerformanceMonitor>,
    /// Message path shared by every transport
    pub chat: Arc<ChatService>,
}

impl AppState {
    /// Wire the chat core from its external collaborators
    ///
    /// # Arguments
    /// * `config` - Loaded configuration
    /// * `generator` - Text-generation provider
    /// * `kv` - Backing store of the response cache
    /// * `sessions` - Session and message persistence
    pub fn build(
        config: Config,
        generator: Arc<dyn TextGenerator>,
        kv: Arc<dyn KeyValueStore>,
        sessions: Arc<dyn SessionStore>,
    ) -> Self {
        let monitor = Arc::new(PerformanceMonitor::new(MonitorThresholds::from(
            &config.monitor,
        )));
        let cache = Arc::new(ResponseCache::new(kv, &config.cache));
        let orchestrator = Arc::new(FallbackOrchestrator::new(
            generator,
            cache.clone(),
            monitor.clone(),
            OrchestratorSettings::from(&config.provider),
        ));
        let balancer = Arc::new(SessionLoadBalancer::new(&config.balancer));
        let chat = Arc::new(ChatService::new(
            sessions,
            orchestrator.clone(),
            balancer.clone(),
            monitor.clone(),
            &config.sessions,
        ));

        Self {
            config: Arc::new(config),
            cache,
            orchestrator,
            balancer,
            monitor,
            chat,
        }
    }
}
