//! Per-endpoint handler functions for the Public HTTP Facade.

use axum::extract::{Multipart, Path, State};
use axum::http::{HeaderMap, HeaderValue};
use axum::response::sse::Sse;
use axum::response::{IntoResponse, Json, Response};
use serde::Serialize;
use serde_json::Value;

use super::AppState;
use crate::alerts;
use crate::batch::Job;
use crate::error::GatewayError;
use crate::registry::NodeView;

#[derive(Debug, Serialize)]
pub struct NodeStatusDto {
    pub id: u32,
    pub name: String,
    pub online: bool,
    pub busy: bool,
    pub consecutive_failures: u32,
    pub last_success_age_secs: Option<f64>,
    pub metrics: Option<NodeMetricsDto>,
}

#[derive(Debug, Serialize)]
pub struct NodeMetricsDto {
    pub cpu_usage_percent: f64,
    pub cpu_model: String,
    pub memory_percent: f64,
    pub gpu_utilization_percent: f64,
    pub gpu_memory_usage_percent: f64,
    pub gpu_temperature_celsius: f64,
    pub models: Vec<String>,
    pub locked: bool,
}

impl From<NodeView> for NodeStatusDto {
    fn from(v: NodeView) -> Self {
        let busy = v.busy;
        NodeStatusDto {
            id: v.id,
            name: v.name,
            online: v.state.online,
            busy,
            consecutive_failures: v.state.consecutive_failures,
            last_success_age_secs: v.state.last_success_at.map(|t| t.elapsed().as_secs_f64()),
            metrics: v.state.metrics.map(|m| NodeMetricsDto {
                cpu_usage_percent: m.cpu_usage_percent,
                cpu_model: m.cpu_model,
                memory_percent: m.memory_percent,
                gpu_utilization_percent: m.gpu_utilization_percent,
                gpu_memory_usage_percent: m.gpu_memory_usage_percent,
                gpu_temperature_celsius: m.gpu_temperature_celsius,
                models: m.models.into_iter().collect(),
                locked: busy,
            }),
        }
    }
}

pub async fn status_all(State(state): State<AppState>) -> Json<Vec<NodeStatusDto>> {
    let nodes: Vec<NodeStatusDto> = state
        .registry
        .snapshot()
        .into_iter()
        .map(NodeStatusDto::from)
        .collect();
    Json(nodes)
}

pub async fn alerts(State(state): State<AppState>) -> Json<Vec<alerts::Alert>> {
    let snapshot = state.registry.snapshot();
    Json(alerts::evaluate(&snapshot, &state.tunables))
}

pub async fn models(State(state): State<AppState>) -> Json<Vec<String>> {
    let snapshot = state.registry.snapshot();
    let mut set = std::collections::BTreeSet::new();
    for node in snapshot.into_iter().filter(|n| n.state.online) {
        if let Some(metrics) = node.state.metrics {
            set.extend(metrics.models);
        }
    }
    Json(set.into_iter().collect())
}

#[derive(Debug, Serialize)]
pub struct HealthDto {
    pub online_nodes: usize,
    pub total_nodes: usize,
    pub uptime_secs: f64,
    pub requests: crate::metrics::MetricsSnapshot,
}

pub async fn health(State(state): State<AppState>) -> Json<HealthDto> {
    let snapshot = state.registry.snapshot();
    Json(HealthDto {
        online_nodes: snapshot.iter().filter(|n| n.state.online).count(),
        total_nodes: snapshot.len(),
        uptime_secs: state.start_time.elapsed().as_secs_f64(),
        requests: state.metrics.snapshot(),
    })
}

pub async fn chat_completions(State(state): State<AppState>, Json(body): Json<Value>) -> Response {
    let streaming = body.get("stream").and_then(|v| v.as_bool()).unwrap_or(false);
    state.metrics.record_start();

    if streaming {
        match state.dispatcher.clone().dispatch_streaming(body).await {
            Ok(stream) => {
                state.metrics.record_end(true);
                Sse::new(stream).into_response()
            }
            Err(e) => {
                state.metrics.record_end(false);
                e.into_response()
            }
        }
    } else {
        match state.dispatcher.dispatch_buffered(body).await {
            Ok(resp) => {
                state.metrics.record_end(true);
                let mut headers = HeaderMap::new();
                if let Ok(val) = HeaderValue::from_str(&resp.node_id.to_string()) {
                    headers.insert("X-Assigned-Node", val);
                }
                if let Ok(val) = HeaderValue::from_str(&resp.node_name) {
                    headers.insert("X-Assigned-Node-Name", val);
                }
                (headers, Json(resp.body)).into_response()
            }
            Err(e) => {
                state.metrics.record_end(false);
                e.into_response()
            }
        }
    }
}

pub async fn dataset_upload(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<Value>, GatewayError> {
    let mut items: Option<Vec<Value>> = None;
    let mut data_count: Option<i64> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| GatewayError::BadRequest(e.to_string()))?
    {
        match field.name() {
            Some("file") => {
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| GatewayError::BadRequest(e.to_string()))?;
                let parsed: Value = serde_json::from_slice(&bytes)
                    .map_err(|e| GatewayError::BadDataset(format!("invalid JSON: {e}")))?;
                let array = parsed
                    .as_array()
                    .ok_or_else(|| GatewayError::BadDataset("dataset must be a JSON array".into()))?
                    .clone();
                items = Some(array);
            }
            Some("data_count") => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| GatewayError::BadRequest(e.to_string()))?;
                data_count = Some(
                    text.trim()
                        .parse::<i64>()
                        .map_err(|_| GatewayError::BadRequest("data_count must be an integer".into()))?,
                );
            }
            _ => {}
        }
    }

    let items = items.ok_or_else(|| GatewayError::BadDataset("missing 'file' field".into()))?;
    let job_id = state.jobs.create_job(items, data_count).await?;
    Ok(Json(serde_json::json!({ "job_id": job_id })))
}

pub async fn dataset_status(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Json<Job>, GatewayError> {
    let job = state.jobs.status(&job_id).await?;
    Ok(Json(job))
}
