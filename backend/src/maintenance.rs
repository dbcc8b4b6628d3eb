//! Background maintenance
//!
//! A single ticker that rebalances sessions, sweeps idle sessions, and purges
//! expired cache entries.

use crate::balancer::SessionMove;
use crate::chat::service::ExpiryReport;
use crate::state::AppState;
use chrono::Utc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

/// What one maintenance pass did
#[derive(Debug, Default, Clone)]
pub struct MaintenanceReport {
    /// Sessions moved between resources
    pub moves: Vec<SessionMove>,
    /// Idle sweep outcome
    pub expiry: ExpiryReport,
    /// Cache entries purged
    pub purged: usize,
}

/// Run one maintenance pass
pub async fn run_once(state: &AppState) -> MaintenanceReport {
    let expiry = state.chat.expire_idle(Utc::now()).await;
    let moves = state.balancer.rebalance();
    let purged = state.cache.purge_expired().await;

    debug!(
        moved = moves.len(),
        idled = expiry.idled,
        expired = expiry.expired,
        purged,
        "Maintenance pass complete"
    );

    MaintenanceReport {
        moves,
        expiry,
        purged,
    }
}

/// Spawn the maintenance ticker
///
/// # Arguments
/// * `state` - Shared application state
/// * `period` - Time between passes
/// * `shutdown` - The ticker stops once this flips to `true`
pub fn spawn(
    state: AppState,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period.max(Duration::from_secs(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    run_once(&state).await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("Maintenance task stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryStore;
    use crate::chat::store::MemorySessionStore;
    use crate::config::Config;
    use crate::provider::GeminiGenerator;
    use std::sync::Arc;

    fn state() -> AppState {
        AppState::build(
            Config::default(),
            Arc::new(GeminiGenerator::new("", "test-model")),
            Arc::new(MemoryStore::new()),
            Arc::new(MemorySessionStore::new()),
        )
    }

    #[tokio::test]
    async fn test_run_once_on_empty_state() {
        let report = run_once(&state()).await;
        assert!(report.moves.is_empty());
        assert_eq!(report.expiry, ExpiryReport::default());
        assert_eq!(report.purged, 0);
    }

    #[tokio::test]
    async fn test_ticker_stops_on_shutdown() {
        let (tx, rx) = watch::channel(false);
        let handle = spawn(state(), Duration::from_secs(60), rx);
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("maintenance task should stop")
            .unwrap();
    }
}
