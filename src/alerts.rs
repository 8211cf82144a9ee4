//! Alert Evaluator — a pure function over a Registry snapshot. Derived,
//! not stored, following the same "pure function over an immutable
//! snapshot" shape as the Scheduler.

use serde::Serialize;

use crate::config::Tunables;
use crate::registry::NodeView;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertLevel {
    Warning,
    Critical,
}

#[derive(Debug, Clone, Serialize)]
pub struct Alert {
    pub level: AlertLevel,
    pub message: String,
    pub node_id: Option<u32>,
}

/// Evaluate all alert rules against a fresh registry snapshot.
pub fn evaluate(nodes: &[NodeView], tunables: &Tunables) -> Vec<Alert> {
    let mut alerts = Vec::new();

    for node in nodes {
        if !node.state.online {
            let offline_for = node
                .state
                .last_success_at
                .map(|t| t.elapsed())
                .unwrap_or(tunables.offline_alert_delay());
            if offline_for >= tunables.offline_alert_delay() {
                alerts.push(Alert {
                    level: AlertLevel::Critical,
                    message: format!(
                        "{} has been offline for {}s",
                        node.name,
                        offline_for.as_secs()
                    ),
                    node_id: Some(node.id),
                });
            }
        }

        let Some(metrics) = &node.state.metrics else {
            continue;
        };

        if metrics.gpu_temperature_celsius >= 85.0 {
            alerts.push(Alert {
                level: AlertLevel::Critical,
                message: format!(
                    "{} GPU temperature at {:.1}C",
                    node.name, metrics.gpu_temperature_celsius
                ),
                node_id: Some(node.id),
            });
        }

        if metrics.gpu_memory_usage_percent >= 90.0 {
            alerts.push(Alert {
                level: AlertLevel::Warning,
                message: format!(
                    "{} GPU memory usage at {:.1}%",
                    node.name, metrics.gpu_memory_usage_percent
                ),
                node_id: Some(node.id),
            });
        }

        if metrics.memory_percent >= 90.0 {
            alerts.push(Alert {
                level: AlertLevel::Warning,
                message: format!(
                    "{} system memory usage at {:.1}%",
                    node.name, metrics.memory_percent
                ),
                node_id: Some(node.id),
            });
        }

        if node.state.high_gpu_util_streak >= 2 {
            alerts.push(Alert {
                level: AlertLevel::Warning,
                message: format!(
                    "{} GPU utilization at {:.1}% for 2+ consecutive polls",
                    node.name, metrics.gpu_utilization_percent
                ),
                node_id: Some(node.id),
            });
        }
    }

    alerts
}
