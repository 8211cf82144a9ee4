//! Telemetry Poller — one logical task per node, polling the node's
//! monitor agent over HTTP and feeding results into the Node Registry.
//!
//! Shaped like the `run_health_checks` background task: a
//! `tokio::time::interval` loop, health checks fanned out in parallel per
//! round, `tracing` at the transitions that matter and silence otherwise.
//! One independent task per node means a single node's failures never
//! affect another node's polling cadence.

use std::time::Duration;

use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Tunables;
use crate::registry::{Metrics, NodeRegistry, PollOutcome};

/// Wire schema for `GET {monitor_base_url}/metrics`. Deliberately has no
/// `#[serde(default)]` anywhere: a missing top-level field must fail to
/// deserialize, which this module treats as a poll failure rather than a
/// partial update — metrics are either absent or fully populated.
#[derive(Debug, Deserialize)]
struct MonitorMetricsResponse {
    cpu_usage_percent: f64,
    cpu_model: String,
    memory: MemorySection,
    gpu: GpuSection,
    models: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct MemorySection {
    percent: f64,
}

#[derive(Debug, Deserialize)]
struct GpuSection {
    utilization_percent: f64,
    memory_usage_percent: f64,
    temperature_celsius: f64,
}

impl From<MonitorMetricsResponse> for Metrics {
    fn from(r: MonitorMetricsResponse) -> Self {
        Metrics {
            cpu_usage_percent: r.cpu_usage_percent,
            cpu_model: r.cpu_model,
            memory_percent: r.memory.percent,
            gpu_utilization_percent: r.gpu.utilization_percent,
            gpu_memory_usage_percent: r.gpu.memory_usage_percent,
            gpu_temperature_celsius: r.gpu.temperature_celsius,
            models: r.models.into_iter().collect(),
        }
    }
}

/// Spawn one polling task per configured node. Returns immediately; tasks
/// run until `shutdown` is cancelled.
pub fn spawn_pollers(
    registry: NodeRegistry,
    client: reqwest::Client,
    tunables: Tunables,
    shutdown: CancellationToken,
) {
    for node_id in registry.node_ids() {
        let registry = registry.clone();
        let client = client.clone();
        let tunables = tunables.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            poll_node_loop(node_id, registry, client, tunables, shutdown).await;
        });
    }
}

async fn poll_node_loop(
    node_id: u32,
    registry: NodeRegistry,
    client: reqwest::Client,
    tunables: Tunables,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(tunables.poll_interval());
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                debug!(node_id, "telemetry poller shutting down");
                return;
            }
            _ = ticker.tick() => {}
        }

        registry.refresh_staleness(node_id);

        let Some(view) = registry.get(node_id) else {
            return; // node removed; nothing left to poll
        };
        let url = format!("{}/metrics", view.monitor_base_url.trim_end_matches('/'));

        let Some(seq) = registry.begin_poll(node_id) else {
            return;
        };

        let outcome = poll_once(&client, &url, tunables.telemetry_timeout()).await;
        let was_online = view.state.online;

        match outcome {
            Ok(metrics) => {
                registry.update_metrics(node_id, seq, PollOutcome::Success(metrics));
                if !was_online {
                    info!(node_id, "node came online");
                }
            }
            Err(e) => {
                warn!(node_id, error = %e, "telemetry poll failed");
                registry.update_metrics(node_id, seq, PollOutcome::Failure);
                if was_online {
                    if let Some(updated) = registry.get(node_id) {
                        if !updated.state.online {
                            warn!(node_id, "node flipped offline");
                        }
                    }
                }
            }
        }
    }
}

async fn poll_once(
    client: &reqwest::Client,
    url: &str,
    timeout: Duration,
) -> Result<Metrics, String> {
    let resp = client
        .get(url)
        .timeout(timeout)
        .send()
        .await
        .map_err(|e| e.to_string())?;

    if !resp.status().is_success() {
        return Err(format!("http status {}", resp.status()));
    }

    let body: MonitorMetricsResponse = resp.json().await.map_err(|e| e.to_string())?;
    Ok(body.into())
}
