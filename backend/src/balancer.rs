//! Session load balancer
//!
//! Spreads chat sessions across backing resources. Placement is
//! least-loaded-first with a latency penalty:
//!
//! `score = active_sessions + latency_weight * (avg_response_ms / latency_target_ms)`
//!
//! Each resource's load sits behind its own mutex; the session → resource
//! map has a separate short-lived lock, always taken before a resource lock.

use crate::config::BalancerConfig;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Smoothing factor of the rolling response-time average
const EWMA_ALPHA: f64 = 0.2;

/// Suggested wait before retrying after a capacity rejection
pub const CAPACITY_RETRY_AFTER: Duration = Duration::from_secs(5);

/// Resource used when the configuration lists none
const DEFAULT_RESOURCE: &str = "primary";

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Why a session was refused
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CapacityReason {
    /// The global session cap is reached
    GlobalLimit {
        /// Configured cap
        limit: usize,
    },
    /// Every resource is at its per-resource cap
    ResourceLimit {
        /// Configured per-resource cap
        limit: usize,
    },
}

impl std::fmt::Display for CapacityReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CapacityReason::GlobalLimit { limit } => {
                write!(f, "{} concurrent sessions already active", limit)
            }
            CapacityReason::ResourceLimit { limit } => {
                write!(f, "every resource already holds {} sessions", limit)
            }
        }
    }
}

/// The balancer refused a session; retryable
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("System busy: {reason}")]
pub struct CapacityError {
    /// Which cap was hit
    pub reason: CapacityReason,
    /// Suggested wait before retrying
    pub retry_after: Duration,
}

/// Where an admitted session lives
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Placement {
    /// Resource the session is assigned to
    pub resource_id: String,
    /// False when the session was already tracked
    pub newly_admitted: bool,
}

/// One session moved by [`SessionLoadBalancer::rebalance`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionMove {
    /// Session moved
    pub session_id: String,
    /// Resource it left
    pub from: String,
    /// Resource it joined
    pub to: String,
}

/// Per-resource load as reported by [`SessionLoadBalancer::metrics`]
#[derive(Debug, Clone, Serialize)]
pub struct LoadRecord {
    /// Resource identifier
    pub resource_id: String,
    /// Sessions currently assigned
    pub active_sessions: usize,
    /// Rolling average response time (in milliseconds)
    pub avg_response_ms: Option<f64>,
    /// Admissions refused while this resource was the best candidate
    pub rejections: u64,
    /// Current load score
    pub score: f64,
}

/// Balancer-wide metrics
#[derive(Debug, Clone, Serialize)]
pub struct BalancerMetrics {
    /// Sessions currently tracked
    pub active_sessions: usize,
    /// Global cap
    pub max_concurrent_sessions: usize,
    /// Total admissions refused
    pub rejections: u64,
    /// Per-resource load
    pub resources: Vec<LoadRecord>,
}

#[derive(Debug, Default)]
struct ResourceLoad {
    active: usize,
    avg_response_ms: Option<f64>,
    rejections: u64,
}

struct ResourceSlot {
    id: String,
    load: Mutex<ResourceLoad>,
}

/// Shared session load balancer
pub struct SessionLoadBalancer {
    resources: Vec<ResourceSlot>,
    assignments: Mutex<HashMap<String, usize>>,
    active: AtomicUsize,
    rejections: AtomicU64,
    max_concurrent_sessions: usize,
    max_sessions_per_resource: usize,
    latency_target_ms: f64,
    latency_weight: f64,
}

impl SessionLoadBalancer {
    /// Create a balancer from configuration
    pub fn new(config: &BalancerConfig) -> Self {
        let mut ids: Vec<String> = config
            .resources
            .iter()
            .map(|r| r.trim().to_string())
            .filter(|r| !r.is_empty())
            .collect();
        if ids.is_empty() {
            ids.push(DEFAULT_RESOURCE.to_string());
        }

        Self {
            resources: ids
                .into_iter()
                .map(|id| ResourceSlot {
                    id,
                    load: Mutex::new(ResourceLoad::default()),
                })
                .collect(),
            assignments: Mutex::new(HashMap::new()),
            active: AtomicUsize::new(0),
            rejections: AtomicU64::new(0),
            max_concurrent_sessions: config.max_concurrent_sessions,
            max_sessions_per_resource: config.max_sessions_per_resource,
            latency_target_ms: config.latency_target_ms.max(1) as f64,
            latency_weight: config.latency_weight,
        }
    }

    fn score(&self, load: &ResourceLoad) -> f64 {
        let latency = load.avg_response_ms.unwrap_or(0.0) / self.latency_target_ms;
        load.active as f64 + self.latency_weight * latency
    }

    fn over_target(&self, load: &ResourceLoad) -> bool {
        load.avg_response_ms
            .is_some_and(|avg| avg > self.latency_target_ms)
    }

    /// Lowest-score resource with room, ties to the lowest index
    fn best_candidate(&self) -> (Option<usize>, usize) {
        let mut best: Option<(usize, f64)> = None;
        let mut overall: Option<(usize, f64)> = None;
        for (idx, slot) in self.resources.iter().enumerate() {
            let load = lock(&slot.load);
            let score = self.score(&load);
            if overall.map_or(true, |(_, s)| score < s) {
                overall = Some((idx, score));
            }
            if load.active < self.max_sessions_per_resource
                && best.map_or(true, |(_, s)| score < s)
            {
                best = Some((idx, score));
            }
        }
        (best.map(|(idx, _)| idx), overall.map_or(0, |(idx, _)| idx))
    }

    fn reject(&self, target: usize, reason: CapacityReason) -> CapacityError {
        self.rejections.fetch_add(1, Ordering::Relaxed);
        if let Some(slot) = self.resources.get(target) {
            lock(&slot.load).rejections += 1;
        }
        warn!(reason = %reason, "Session admission rejected");
        CapacityError {
            reason,
            retry_after: CAPACITY_RETRY_AFTER,
        }
    }

    /// Admit a session into tracking
    ///
    /// Re-admitting a tracked session succeeds without changing anything.
    ///
    /// # Returns
    /// * `Ok(Placement)` - The resource the session is assigned to
    /// * `Err(CapacityError)` - Global or per-resource capacity is exhausted;
    ///   the active count is unchanged
    pub fn admit(&self, session_id: &str) -> Result<Placement, CapacityError> {
        let mut assignments = lock(&self.assignments);
        if let Some(&idx) = assignments.get(session_id) {
            return Ok(Placement {
                resource_id: self.resources[idx].id.clone(),
                newly_admitted: false,
            });
        }

        let (candidate, least_loaded) = self.best_candidate();
        if assignments.len() >= self.max_concurrent_sessions {
            return Err(self.reject(
                least_loaded,
                CapacityReason::GlobalLimit {
                    limit: self.max_concurrent_sessions,
                },
            ));
        }
        let Some(idx) = candidate else {
            return Err(self.reject(
                least_loaded,
                CapacityReason::ResourceLimit {
                    limit: self.max_sessions_per_resource,
                },
            ));
        };

        lock(&self.resources[idx].load).active += 1;
        assignments.insert(session_id.to_string(), idx);
        self.active.store(assignments.len(), Ordering::Relaxed);

        debug!(
            session_id = %session_id,
            resource_id = %self.resources[idx].id,
            "Session admitted"
        );
        Ok(Placement {
            resource_id: self.resources[idx].id.clone(),
            newly_admitted: true,
        })
    }

    /// Stop tracking a session; returns whether it was tracked
    pub fn release(&self, session_id: &str) -> bool {
        let mut assignments = lock(&self.assignments);
        let Some(idx) = assignments.remove(session_id) else {
            return false;
        };
        let mut load = lock(&self.resources[idx].load);
        load.active = load.active.saturating_sub(1);
        self.active.store(assignments.len(), Ordering::Relaxed);
        debug!(session_id = %session_id, "Session released");
        true
    }

    /// Fold a response time into the owning resource's rolling average
    ///
    /// Unknown sessions are ignored.
    pub fn record_activity(&self, session_id: &str, response_time: Duration) {
        let idx = match lock(&self.assignments).get(session_id) {
            Some(&idx) => idx,
            None => return,
        };
        let sample = response_time.as_secs_f64() * 1_000.0;
        let mut load = lock(&self.resources[idx].load);
        load.avg_response_ms = Some(match load.avg_response_ms {
            Some(avg) => avg + EWMA_ALPHA * (sample - avg),
            None => sample,
        });
    }

    /// Move sessions off resources above the latency target
    ///
    /// A session moves from an over-target resource to the lowest-score
    /// resource that is not over target only while that strictly lowers the
    /// higher of the two scores. Moves repeat until none qualifies, so a
    /// second call with no intervening activity changes nothing.
    pub fn rebalance(&self) -> Vec<SessionMove> {
        let mut assignments = lock(&self.assignments);
        let mut moves = Vec::new();

        loop {
            let snapshot: Vec<(f64, bool, usize)> = self
                .resources
                .iter()
                .map(|slot| {
                    let load = lock(&slot.load);
                    (self.score(&load), self.over_target(&load), load.active)
                })
                .collect();

            let source = snapshot
                .iter()
                .enumerate()
                .filter(|(_, (_, over, active))| *over && *active > 0)
                .max_by(|a, b| a.1 .0.total_cmp(&b.1 .0).then(b.0.cmp(&a.0)))
                .map(|(idx, (score, _, _))| (idx, *score));
            let destination = snapshot
                .iter()
                .enumerate()
                .filter(|(_, (_, over, active))| {
                    !*over && *active < self.max_sessions_per_resource
                })
                .min_by(|a, b| a.1 .0.total_cmp(&b.1 .0).then(a.0.cmp(&b.0)))
                .map(|(idx, (score, _, _))| (idx, *score));

            let (Some((src, src_score)), Some((dst, dst_score))) = (source, destination) else {
                break;
            };
            if dst_score + 1.0 >= src_score {
                break;
            }

            let Some(session_id) = assignments
                .iter()
                .filter(|(_, &idx)| idx == src)
                .map(|(id, _)| id)
                .max()
                .cloned()
            else {
                break;
            };

            lock(&self.resources[src].load).active -= 1;
            lock(&self.resources[dst].load).active += 1;
            assignments.insert(session_id.clone(), dst);

            moves.push(SessionMove {
                session_id,
                from: self.resources[src].id.clone(),
                to: self.resources[dst].id.clone(),
            });
        }

        if !moves.is_empty() {
            info!(moved = moves.len(), "Rebalanced sessions");
        }
        moves
    }

    /// Number of tracked sessions
    pub fn active_sessions(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }

    /// Resource a session is assigned to
    pub fn resource_of(&self, session_id: &str) -> Option<String> {
        lock(&self.assignments)
            .get(session_id)
            .map(|&idx| self.resources[idx].id.clone())
    }

    /// Session → resource assignment, ordered by session id
    pub fn assignment_snapshot(&self) -> BTreeMap<String, String> {
        lock(&self.assignments)
            .iter()
            .map(|(session, &idx)| (session.clone(), self.resources[idx].id.clone()))
            .collect()
    }

    /// Active count, per-resource load, rejection count
    pub fn metrics(&self) -> BalancerMetrics {
        let resources = self
            .resources
            .iter()
            .map(|slot| {
                let load = lock(&slot.load);
                LoadRecord {
                    resource_id: slot.id.clone(),
                    active_sessions: load.active,
                    avg_response_ms: load.avg_response_ms,
                    rejections: load.rejections,
                    score: self.score(&load),
                }
            })
            .collect();

        BalancerMetrics {
            active_sessions: self.active_sessions(),
            max_concurrent_sessions: self.max_concurrent_sessions,
            rejections: self.rejections.load(Ordering::Relaxed),
            resources,
        }
    }
}
