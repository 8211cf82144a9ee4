//! Scheduler — a pure function from an immutable registry snapshot plus
//! requirements to a node id.
//!
//! Follows the same `MetricPicker`/`ArcSwap<MetricPicker>` split: scoring
//! is decoupled from locking so it stays trivially testable as a pure
//! function. `MetricPicker` computes its picker from an immutable
//! `BTreeSet<Backend>` snapshot; here the snapshot is `Vec<NodeView>`
//! from the registry.

use std::collections::HashSet;

use crate::config::SchedulerWeights;
use crate::registry::NodeView;

#[derive(Debug, Clone, Default)]
pub struct Requirements {
    pub model: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NoNodeAvailable;

/// `temp_score`: 1.0 at <= 60C, linear decay to 0.0 at >= 90C, 0.0 above.
fn temp_score(celsius: f64) -> f64 {
    if celsius <= 60.0 {
        1.0
    } else if celsius >= 90.0 {
        0.0
    } else {
        1.0 - (celsius - 60.0) / 30.0
    }
}

/// Min-max normalize `raw` capability scores across all configured nodes
/// to [0, 1]. When every node has the same capability (including the
/// single-node case), all nodes normalize to 1.0 — there is no basis to
/// prefer one over another on capability alone, so the term should not
/// penalize anybody.
fn normalize(raw: &[f64]) -> Vec<f64> {
    let min = raw.iter().cloned().fold(f64::INFINITY, f64::min);
    let max = raw.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    if !(max > min) {
        return raw.iter().map(|_| 1.0).collect();
    }
    raw.iter().map(|v| (v - min) / (max - min)).collect()
}

fn is_eligible(node: &NodeView, req: &Requirements, staleness_window: std::time::Duration) -> bool {
    if !node.state.online {
        return false;
    }
    if node.busy {
        return false;
    }
    let Some(metrics) = &node.state.metrics else {
        return false;
    };
    if let Some(model) = &req.model {
        if !metrics.models.contains(model) {
            return false;
        }
    }
    let Some(last_success) = node.state.last_success_at else {
        return false;
    };
    last_success.elapsed() <= staleness_window
}

/// Pick the best eligible node, or `NoNodeAvailable`. Never blocks, never
/// retries internally — retry-with-backoff across `NoAvailableNode` is the
/// Dispatcher's concern, not the Scheduler's.
///
/// `excluded` lets a single dispatch attempt rule out nodes it has already
/// tried and failed over from, without that affecting the capability
/// normalization below (still computed across every configured node).
pub fn pick(
    nodes: &[NodeView],
    req: &Requirements,
    weights: &SchedulerWeights,
    staleness_window: std::time::Duration,
    excluded: &HashSet<u32>,
) -> Result<u32, NoNodeAvailable> {
    // Capability is normalized across all configured nodes, not just the
    // ones eligible for this particular request — otherwise which nodes
    // happen to be busy/offline/excluded at pick time would shift the
    // normalization denominator and, with it, every node's cap_score.
    let raw_caps: Vec<f64> = nodes
        .iter()
        .map(|n| n.capability.vram_gb * 0.5 + n.capability.tflops * 0.5)
        .collect();
    let cap_scores = normalize(&raw_caps);

    let eligible: Vec<(&NodeView, f64)> = nodes
        .iter()
        .zip(cap_scores.iter())
        .filter(|(n, _)| !excluded.contains(&n.id) && is_eligible(n, req, staleness_window))
        .map(|(n, c)| (n, *c))
        .collect();

    if eligible.is_empty() {
        return Err(NoNodeAvailable);
    }

    let mut best: Option<(&NodeView, f64)> = None;
    for (node, cap_score) in eligible {
        // Eligibility already guarantees `metrics` is Some.
        let m = node.state.metrics.as_ref().expect("eligible node has metrics");
        let score = weights.cap * cap_score
            + weights.gpu_util * (1.0 - m.gpu_utilization_percent / 100.0)
            + weights.gpu_mem * (1.0 - m.gpu_memory_usage_percent / 100.0)
            + weights.cpu * (1.0 - m.cpu_usage_percent / 100.0)
            + weights.mem * (1.0 - m.memory_percent / 100.0)
            + weights.temp * temp_score(m.gpu_temperature_celsius);

        best = Some(match best {
            None => (node, score),
            Some((best_node, best_score)) => {
                if score > best_score {
                    (node, score)
                } else if score < best_score {
                    (best_node, best_score)
                } else {
                    // Tie-break: lower gpu utilization wins, then lower node_id.
                    let best_m = best_node.state.metrics.as_ref().unwrap();
                    if m.gpu_utilization_percent < best_m.gpu_utilization_percent {
                        (node, score)
                    } else if m.gpu_utilization_percent > best_m.gpu_utilization_percent {
                        (best_node, best_score)
                    } else if node.id < best_node.id {
                        (node, score)
                    } else {
                        (best_node, best_score)
                    }
                }
            }
        });
    }

    Ok(best.expect("eligible set is non-empty").0.id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StaticCapability;
    use crate::registry::{Metrics, NodeState};
    use std::collections::BTreeSet;
    use std::time::Instant;

    fn node(id: u32, gpu_util: f64, models: &[&str]) -> NodeView {
        NodeView {
            id,
            name: format!("node-{id}"),
            monitor_base_url: String::new(),
            llm_url: String::new(),
            capability: StaticCapability {
                vram_gb: 24.0,
                tflops: 80.0,
            },
            state: NodeState {
                online: true,
                last_success_at: Some(Instant::now()),
                consecutive_failures: 0,
                metrics: Some(Metrics {
                    cpu_usage_percent: 10.0,
                    cpu_model: "x".into(),
                    memory_percent: 10.0,
                    gpu_utilization_percent: gpu_util,
                    gpu_memory_usage_percent: 10.0,
                    gpu_temperature_celsius: 50.0,
                    models: models.iter().map(|s| s.to_string()).collect::<BTreeSet<_>>(),
                }),
                high_gpu_util_streak: 0,
            },
            busy: false,
        }
    }

    fn default_weights() -> SchedulerWeights {
        SchedulerWeights::default()
    }

    fn no_excludes() -> HashSet<u32> {
        HashSet::new()
    }

    #[test]
    fn s1_tie_break_prefers_lower_node_id() {
        let nodes = vec![node(1, 40.0, &["llama3"]), node(2, 40.0, &["llama3"])];
        let picked = pick(
            &nodes,
            &Requirements::default(),
            &default_weights(),
            std::time::Duration::from_secs(10),
            &no_excludes(),
        )
        .unwrap();
        assert_eq!(picked, 1);
    }

    #[test]
    fn s2_model_filter_overrides_score() {
        let mut n1 = node(1, 5.0, &["llama3"]); // would win on score alone
        n1.state.metrics.as_mut().unwrap().gpu_utilization_percent = 0.0;
        let n2 = node(2, 90.0, &["mistral"]);
        let nodes = vec![n1, n2];
        let req = Requirements {
            model: Some("mistral".to_string()),
        };
        let picked = pick(
            &nodes,
            &req,
            &default_weights(),
            std::time::Duration::from_secs(10),
            &no_excludes(),
        )
        .unwrap();
        assert_eq!(picked, 2);
    }

    #[test]
    fn offline_node_never_returned() {
        let mut n1 = node(1, 10.0, &["llama3"]);
        n1.state.online = false;
        let nodes = vec![n1];
        let result = pick(
            &nodes,
            &Requirements::default(),
            &default_weights(),
            std::time::Duration::from_secs(10),
            &no_excludes(),
        );
        assert_eq!(result, Err(NoNodeAvailable));
    }

    #[test]
    fn busy_node_is_ineligible() {
        let mut n1 = node(1, 10.0, &["llama3"]);
        n1.busy = true;
        let nodes = vec![n1];
        let result = pick(
            &nodes,
            &Requirements::default(),
            &default_weights(),
            std::time::Duration::from_secs(10),
            &no_excludes(),
        );
        assert_eq!(result, Err(NoNodeAvailable));
    }

    #[test]
    fn stale_metrics_are_ineligible() {
        let mut n1 = node(1, 10.0, &["llama3"]);
        n1.state.last_success_at = Some(Instant::now() - std::time::Duration::from_secs(100));
        let nodes = vec![n1];
        let result = pick(
            &nodes,
            &Requirements::default(),
            &default_weights(),
            std::time::Duration::from_secs(4),
            &no_excludes(),
        );
        assert_eq!(result, Err(NoNodeAvailable));
    }

    #[test]
    fn no_eligible_nodes_returns_no_node_available() {
        let result = pick(
            &[],
            &Requirements::default(),
            &default_weights(),
            std::time::Duration::from_secs(10),
            &no_excludes(),
        );
        assert_eq!(result, Err(NoNodeAvailable));
    }

    #[test]
    fn higher_capability_node_wins_when_utilization_equal() {
        let mut n1 = node(1, 30.0, &["llama3"]);
        n1.capability = StaticCapability {
            vram_gb: 8.0,
            tflops: 10.0,
        };
        let n2 = node(2, 30.0, &["llama3"]); // default cap 24/80, higher
        let nodes = vec![n1, n2];
        let picked = pick(
            &nodes,
            &Requirements::default(),
            &default_weights(),
            std::time::Duration::from_secs(10),
            &no_excludes(),
        )
        .unwrap();
        assert_eq!(picked, 2);
    }

    #[test]
    fn excluded_node_is_skipped_even_when_top_scorer() {
        // Node 1 is strictly better on every dimension, but a dispatch
        // retry excludes it (it already failed once this call).
        let n1 = node(1, 0.0, &["llama3"]);
        let n2 = node(2, 50.0, &["llama3"]);
        let nodes = vec![n1, n2];
        let mut excluded = HashSet::new();
        excluded.insert(1);

        let picked = pick(
            &nodes,
            &Requirements::default(),
            &default_weights(),
            std::time::Duration::from_secs(10),
            &excluded,
        )
        .unwrap();
        assert_eq!(picked, 2);
    }

    #[test]
    fn excluding_all_nodes_returns_no_node_available() {
        let nodes = vec![node(1, 10.0, &["llama3"])];
        let mut excluded = HashSet::new();
        excluded.insert(1);
        let result = pick(
            &nodes,
            &Requirements::default(),
            &default_weights(),
            std::time::Duration::from_secs(10),
            &excluded,
        );
        assert_eq!(result, Err(NoNodeAvailable));
    }

    #[test]
    fn capability_normalization_is_stable_regardless_of_eligibility() {
        // Three configured nodes with distinct capability; only node 3 is
        // eligible (1 and 2 are offline / busy). Its cap_score must reflect
        // normalization across all three, not just itself (which would
        // trivially normalize to 1.0 either way, so pin the raw score via
        // the tie-break-free weighted total against a node of known rank).
        let mut n1 = node(1, 10.0, &["llama3"]);
        n1.capability = StaticCapability {
            vram_gb: 8.0,
            tflops: 10.0,
        };
        n1.state.online = false;

        let mut n2 = node(2, 10.0, &["llama3"]);
        n2.capability = StaticCapability {
            vram_gb: 16.0,
            tflops: 20.0,
        };
        n2.busy = true;

        let mut n3 = node(3, 10.0, &["llama3"]);
        n3.capability = StaticCapability {
            vram_gb: 24.0,
            tflops: 80.0,
        };

        let nodes = vec![n1, n2, n3];
        let picked = pick(
            &nodes,
            &Requirements::default(),
            &default_weights(),
            std::time::Duration::from_secs(10),
            &no_excludes(),
        )
        .unwrap();
        // Only node 3 is eligible; this mainly guards against a panic or a
        // divide-by-zero if normalization were (incorrectly) recomputed
        // over the single-element eligible set.
        assert_eq!(picked, 3);
    }
}
