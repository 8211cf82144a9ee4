//! Node Registry — process-wide, concurrency-safe table of configured
//! nodes, their last-known telemetry, liveness, and per-node exclusivity
//! lock.
//!
//! Modeled like `EdgeService`: a struct owned by shared reference and
//! passed into every subsystem (never a module-level singleton), an
//! `ArcSwap`-backed snapshot for lock-free telemetry reads, and
//! `AtomicMetrics`-style atomic counters for anything hot-path. The
//! exclusivity lock is an "acquire on entry, release on scope exit"
//! `tokio::sync::Semaphore` whose `OwnedSemaphorePermit` releases on drop,
//! so every dispatcher exit path — success, error, client disconnect —
//! releases it for free.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::config::{NodeConfig, StaticCapability};

/// Last-known telemetry snapshot for a node. Either absent or fully
/// populated — partial structures are rejected at ingest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Metrics {
    pub cpu_usage_percent: f64,
    pub cpu_model: String,
    pub memory_percent: f64,
    pub gpu_utilization_percent: f64,
    pub gpu_memory_usage_percent: f64,
    pub gpu_temperature_celsius: f64,
    pub models: BTreeSet<String>,
}

/// Immutable, cheaply-cloneable view of a node's dynamic state. Readers
/// (HTTP status, scheduler, alerts) take a clone of this via `ArcSwap`
/// without ever blocking the telemetry writer.
#[derive(Debug, Clone)]
pub struct NodeState {
    pub online: bool,
    pub last_success_at: Option<Instant>,
    pub consecutive_failures: u32,
    pub metrics: Option<Metrics>,
    /// Count of consecutive polls where gpu_utilization_percent >= 95,
    /// tracked here so the Alert Evaluator can apply its "sustained across
    /// two consecutive polls" rule without re-deriving history it doesn't
    /// own.
    pub high_gpu_util_streak: u32,
}

impl Default for NodeState {
    fn default() -> Self {
        Self {
            online: false,
            last_success_at: None,
            consecutive_failures: 0,
            metrics: None,
            high_gpu_util_streak: 0,
        }
    }
}

/// A point-in-time, read-only view combining static config and dynamic
/// state, for the HTTP facade and the scheduler.
#[derive(Debug, Clone)]
pub struct NodeView {
    pub id: u32,
    pub name: String,
    pub monitor_base_url: String,
    pub llm_url: String,
    pub capability: StaticCapability,
    pub state: NodeState,
    pub busy: bool,
}

struct NodeEntry {
    config: NodeConfig,
    state: ArcSwap<NodeState>,
    lock: Arc<Semaphore>,
    /// Monotonic sequence handed out per poll attempt. Poll completions
    /// compare their stamped sequence number against `applied_seq`, so a
    /// late-arriving response for an old poll is discarded instead of
    /// clobbering a more recent update.
    next_seq: AtomicU64,
    applied_seq: AtomicU64,
}

/// The result of one telemetry poll attempt, as the poller reports it.
pub enum PollOutcome {
    Success(Metrics),
    Failure,
}

/// Process-wide node table. Cloning is cheap (it's a thin wrapper around
/// `Arc`-backed maps) and intentional: tests inject their own instance
/// rather than reaching for a singleton.
#[derive(Clone)]
pub struct NodeRegistry {
    nodes: Arc<DashMap<u32, NodeEntry>>,
    offline_failure_threshold: u32,
    offline_staleness: Duration,
}

impl NodeRegistry {
    pub fn new(
        nodes: &[NodeConfig],
        offline_failure_threshold: u32,
        offline_staleness: Duration,
    ) -> Self {
        let map = DashMap::new();
        for cfg in nodes {
            map.insert(
                cfg.id,
                NodeEntry {
                    config: cfg.clone(),
                    state: ArcSwap::from_pointee(NodeState::default()),
                    lock: Arc::new(Semaphore::new(1)),
                    next_seq: AtomicU64::new(0),
                    applied_seq: AtomicU64::new(0),
                },
            );
        }
        Self {
            nodes: Arc::new(map),
            offline_failure_threshold,
            offline_staleness,
        }
    }

    /// Hand out the next poll sequence number for `node_id`, to be stamped
    /// onto the in-flight telemetry request and echoed back into
    /// `update_metrics`.
    pub fn begin_poll(&self, node_id: u32) -> Option<u64> {
        let entry = self.nodes.get(&node_id)?;
        Some(entry.next_seq.fetch_add(1, Ordering::Relaxed))
    }

    /// Apply a poll outcome. Only the Telemetry Poller calls this.
    /// Out-of-order completions (`seq` older than the last applied one)
    /// are discarded silently.
    pub fn update_metrics(&self, node_id: u32, seq: u64, outcome: PollOutcome) {
        let Some(entry) = self.nodes.get(&node_id) else {
            return;
        };

        // CAS loop: only apply if `seq` is newer than whatever is currently
        // applied, and claim it atomically so two late completions racing
        // each other can't both win.
        let mut applied = entry.applied_seq.load(Ordering::Acquire);
        loop {
            if seq < applied {
                return; // strictly stale, discard
            }
            match entry.applied_seq.compare_exchange_weak(
                applied,
                seq,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(current) => applied = current,
            }
        }

        let prev = entry.state.load();
        let now = Instant::now();
        let next = match outcome {
            PollOutcome::Success(metrics) => {
                let high_streak = if metrics.gpu_utilization_percent >= 95.0 {
                    prev.high_gpu_util_streak + 1
                } else {
                    0
                };
                NodeState {
                    online: true,
                    last_success_at: Some(now),
                    consecutive_failures: 0,
                    metrics: Some(metrics),
                    high_gpu_util_streak: high_streak,
                }
            }
            PollOutcome::Failure => {
                let failures = prev.consecutive_failures + 1;
                let stale = prev
                    .last_success_at
                    .map(|t| now.duration_since(t) > self.offline_staleness)
                    .unwrap_or(true);
                let online = prev.online
                    && failures < self.offline_failure_threshold
                    && !stale;
                NodeState {
                    online,
                    last_success_at: prev.last_success_at,
                    consecutive_failures: failures,
                    metrics: prev.metrics.clone(),
                    high_gpu_util_streak: prev.high_gpu_util_streak,
                }
            }
        };
        entry.state.store(Arc::new(next));
    }

    /// Re-derive liveness for every node against the wall clock, for nodes
    /// that have simply stopped being polled at all (no failure reported,
    /// just silence). Called by the poller loop before each round.
    pub fn refresh_staleness(&self, node_id: u32) {
        let Some(entry) = self.nodes.get(&node_id) else {
            return;
        };
        let prev = entry.state.load();
        if !prev.online {
            return;
        }
        let stale = prev
            .last_success_at
            .map(|t| t.elapsed() > self.offline_staleness)
            .unwrap_or(true);
        if stale {
            let mut next = (**prev).clone();
            next.online = false;
            entry.state.store(Arc::new(next));
        }
    }

    /// Immutable snapshot of all nodes, for readers. A node can never
    /// appear both eligible and busy within one snapshot: `busy` is read
    /// from the same semaphore the dispatcher acquires against.
    pub fn snapshot(&self) -> Vec<NodeView> {
        let mut views: Vec<NodeView> = self
            .nodes
            .iter()
            .map(|entry| {
                let state = (**entry.state.load()).clone();
                let busy = entry.lock.available_permits() == 0;
                NodeView {
                    id: entry.config.id,
                    name: entry.config.name.clone(),
                    monitor_base_url: entry.config.monitor_base_url.clone(),
                    llm_url: entry.config.llm_url.clone(),
                    capability: entry.config.capability.unwrap_or_default(),
                    state,
                    busy,
                }
            })
            .collect();
        views.sort_by_key(|v| v.id);
        views
    }

    pub fn get(&self, node_id: u32) -> Option<NodeView> {
        self.snapshot().into_iter().find(|v| v.id == node_id)
    }

    pub fn node_ids(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = self.nodes.iter().map(|e| e.config.id).collect();
        ids.sort_unstable();
        ids
    }

    pub fn online_count(&self) -> usize {
        self.snapshot().iter().filter(|v| v.state.online).count()
    }

    /// Attempt to acquire a node's exclusivity lock. Fails immediately
    /// (never blocks) if the node is offline or already held — the
    /// Scheduler is responsible for picking a different node, not this
    /// method for waiting.
    pub fn try_acquire(&self, node_id: u32) -> Option<OwnedSemaphorePermit> {
        let entry = self.nodes.get(&node_id)?;
        let state = entry.state.load();
        if !state.online {
            return None;
        }
        entry.lock.clone().try_acquire_owned().ok()
    }

    /// Permit-based lock release is automatic (dropping the
    /// `OwnedSemaphorePermit` releases it); this helper exists for call
    /// sites that want to release early and explicitly, without waiting
    /// for the enclosing scope to end.
    pub fn release(&self, permit: OwnedSemaphorePermit) {
        drop(permit);
    }
}
