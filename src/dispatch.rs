//! Request Dispatcher — proxies a chat completion under per-node
//! exclusivity, streaming the upstream LLM daemon's response back to the
//! caller with the mandatory `node_assigned` SSE event first.
//!
//! Follows `EdgeService`'s `upstream_peer`/`ProxyHttp` pipeline shape:
//! pick a backend, hold a per-request guard for its lifetime, record
//! success/failure against it, and release unconditionally on every exit
//! path. `EdgeService` does this with Pingora's `Session`/`HttpPeer`
//! machinery talking to an L4 proxy; this gateway instead pumps an HTTP
//! byte stream through `reqwest` and re-emits it as axum SSE, since the
//! payload here is an application-level chat protocol, not an opaque TCP
//! stream — the same producer/consumer pair with backpressure either way.

use std::collections::HashSet;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::response::sse::Event;
use bytes::{Buf, BytesMut};
use futures_util::{Stream, StreamExt};
use serde_json::Value;
use tokio::sync::OwnedSemaphorePermit;
use tracing::{info, warn};

use crate::config::Tunables;
use crate::error::GatewayError;
use crate::registry::{NodeRegistry, NodeView, PollOutcome};
use crate::scheduler::{self, Requirements};
use crate::sse;

pub struct Dispatcher {
    registry: NodeRegistry,
    client: reqwest::Client,
    tunables: Tunables,
}

/// Result of a non-streaming dispatch: the upstream's parsed JSON body
/// plus which node served it, so the caller can set `X-Assigned-Node`.
pub struct BufferedResponse {
    pub body: Value,
    pub node_id: u32,
    pub node_name: String,
}

/// Distinguishes a buffered-mode failure that happened before the upstream
/// ever answered (failover candidate, same as the streaming path) from one
/// that happened after a successful status line — the body read or parse
/// came back truncated or malformed, which is a terminal error for this
/// batch item rather than a reason to try another node.
enum BufferedFailure {
    Connect(String),
    Truncated(String),
}

impl std::fmt::Display for BufferedFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BufferedFailure::Connect(msg) => write!(f, "{msg}"),
            BufferedFailure::Truncated(msg) => write!(f, "{msg}"),
        }
    }
}

impl Dispatcher {
    pub fn new(registry: NodeRegistry, client: reqwest::Client, tunables: Tunables) -> Self {
        Self {
            registry,
            client,
            tunables,
        }
    }

    fn max_attempts(&self) -> usize {
        self.tunables
            .dispatcher_max_attempts
            .min(self.registry.online_count().max(1))
    }

    fn model_requirement(body: &Value) -> Requirements {
        Requirements {
            model: body
                .get("model")
                .and_then(|v| v.as_str())
                .map(|s| s.to_string()),
        }
    }

    /// Ask the Scheduler for a node and acquire its exclusivity lock,
    /// retrying the pick up to `dispatcher_max_attempts` times with a
    /// fixed backoff when acquisition loses a race. `excluded` is node ids
    /// this dispatch call has already tried and failed over from, so a
    /// repeated pick within the same call never lands back on them.
    async fn acquire_node(
        &self,
        req: &Requirements,
        excluded: &HashSet<u32>,
    ) -> Result<(NodeView, OwnedSemaphorePermit), GatewayError> {
        let attempts = self.tunables.dispatcher_max_attempts.max(1);
        for attempt in 0..attempts {
            let snapshot = self.registry.snapshot();
            let node_id = scheduler::pick(
                &snapshot,
                req,
                &self.tunables.weights,
                self.tunables.staleness_window(),
                excluded,
            )
            .map_err(|_| GatewayError::NoAvailableNode)?;

            if let Some(permit) = self.registry.try_acquire(node_id) {
                let view = self
                    .registry
                    .get(node_id)
                    .ok_or_else(|| GatewayError::Internal("node vanished after pick".into()))?;
                return Ok((view, permit));
            }

            if attempt + 1 < attempts {
                tokio::time::sleep(Duration::from_millis(
                    self.tunables.dispatcher_lock_retry_backoff_ms,
                ))
                .await;
            }
        }
        Err(GatewayError::NoAvailableNode)
    }

    /// Record an advisory failure against a node after a pre-stream
    /// failover, marking the node's consecutive_failures advisory
    /// counter. Reuses the same ordering machinery the Telemetry Poller
    /// uses, since both are "a poll came back bad".
    fn mark_advisory_failure(&self, node_id: u32) {
        if let Some(seq) = self.registry.begin_poll(node_id) {
            self.registry.update_metrics(node_id, seq, PollOutcome::Failure);
        }
    }

    /// Streaming chat completion. Returns a stream of SSE events whose
    /// first item is always `node_assigned`, established before the
    /// dispatcher even attempts the upstream call, so the first SSE event
    /// is strictly `node_assigned` by construction.
    pub async fn dispatch_streaming(
        self: Arc<Self>,
        body: Value,
    ) -> Result<impl Stream<Item = Result<Event, Infallible>>, GatewayError> {
        let req = Self::model_requirement(&body);
        let attempts = self.max_attempts();
        let mut last_err = GatewayError::NoAvailableNode;
        let mut excluded: HashSet<u32> = HashSet::new();

        for attempt in 0..attempts {
            let (view, permit) = self.acquire_node(&req, &excluded).await?;
            match self.open_upstream_stream(&view, &body).await {
                Ok(upstream) => {
                    info!(node_id = view.id, node_name = %view.name, "chat stream dispatched");
                    return Ok(Self::build_event_stream(
                        view.id,
                        view.name,
                        upstream,
                        permit,
                        self.tunables.dispatcher_idle_read_timeout(),
                    ));
                }
                Err(e) => {
                    warn!(node_id = view.id, error = %e, attempt, "pre-stream upstream failure, failing over");
                    self.mark_advisory_failure(view.id);
                    drop(permit);
                    excluded.insert(view.id);
                    last_err = GatewayError::UpstreamUnavailable(e);
                    if attempt + 1 >= attempts {
                        break;
                    }
                }
            }
        }
        Err(last_err)
    }

    /// Non-streaming chat completion: buffer the upstream response into a
    /// single JSON object.
    pub async fn dispatch_buffered(&self, body: Value) -> Result<BufferedResponse, GatewayError> {
        let req = Self::model_requirement(&body);
        let attempts = self.max_attempts();
        let mut last_err = GatewayError::NoAvailableNode;
        let mut excluded: HashSet<u32> = HashSet::new();

        for attempt in 0..attempts {
            let (view, permit) = self.acquire_node(&req, &excluded).await?;
            let result = self
                .client
                .post(&view.llm_url)
                .json(&body)
                .timeout(self.tunables.batch_item_deadline())
                .send()
                .await;

            let outcome = async {
                let resp = result.map_err(BufferedFailure::Connect)?;
                if !resp.status().is_success() {
                    return Err(BufferedFailure::Connect(format!("http status {}", resp.status())));
                }
                resp.json::<Value>()
                    .await
                    .map_err(|e| BufferedFailure::Truncated(e.to_string()))
            }
            .await;

            // Lock is released as soon as we're done with this node,
            // regardless of success or failure (permit dropped here).
            drop(permit);

            match outcome {
                Ok(parsed) => {
                    return Ok(BufferedResponse {
                        body: parsed,
                        node_id: view.id,
                        node_name: view.name,
                    });
                }
                Err(e) => {
                    warn!(node_id = view.id, error = %e, attempt, "buffered dispatch failed, failing over");
                    self.mark_advisory_failure(view.id);
                    excluded.insert(view.id);
                    last_err = match e {
                        BufferedFailure::Connect(msg) => GatewayError::UpstreamUnavailable(msg),
                        BufferedFailure::Truncated(msg) => GatewayError::UpstreamTruncated(msg),
                    };
                    if attempt + 1 >= attempts {
                        break;
                    }
                }
            }
        }
        Err(last_err)
    }

    /// Open the upstream POST and confirm the response started
    /// successfully. Anything that fails here is "before the first
    /// proxied byte" and is eligible for failover.
    async fn open_upstream_stream(
        &self,
        view: &NodeView,
        body: &Value,
    ) -> Result<impl Stream<Item = Result<bytes::Bytes, reqwest::Error>>, String> {
        let resp = self
            .client
            .post(&view.llm_url)
            .json(body)
            .timeout(Duration::from_secs(self.tunables.dispatcher_connect_timeout_secs))
            .send()
            .await
            .map_err(|e| e.to_string())?;

        if !resp.status().is_success() {
            return Err(format!("http status {}", resp.status()));
        }

        Ok(resp.bytes_stream())
    }

    /// Build the full SSE event stream: `node_assigned` first, then one
    /// `data:` frame per upstream newline-delimited JSON chunk, then
    /// `data: [DONE]` on clean end-of-stream or an in-band error frame on
    /// a mid-stream break. `permit` is moved into the generator so it is
    /// held for exactly the stream's lifetime and dropped — releasing the
    /// node — on every exit path: completion, error, or the client
    /// dropping the response early.
    fn build_event_stream(
        node_id: u32,
        node_name: String,
        mut upstream: impl Stream<Item = Result<bytes::Bytes, reqwest::Error>> + Unpin + 'static,
        permit: OwnedSemaphorePermit,
        idle_timeout: Duration,
    ) -> impl Stream<Item = Result<Event, Infallible>> {
        async_stream::stream! {
            let _permit = permit; // released when this generator is dropped
            yield Ok(sse::node_assigned_event(node_id, &node_name));

            let mut buf = BytesMut::new();
            loop {
                let next = tokio::time::timeout(idle_timeout, upstream.next()).await;
                match next {
                    Err(_elapsed) => {
                        warn!(node_id, "upstream stream idle-timed out");
                        yield Ok(sse::error_event("upstream idle timeout"));
                        return;
                    }
                    Ok(None) => break,
                    Ok(Some(Err(e))) => {
                        warn!(node_id, error = %e, "upstream stream broke mid-response");
                        yield Ok(sse::error_event("upstream truncated"));
                        return;
                    }
                    Ok(Some(Ok(chunk))) => {
                        buf.extend_from_slice(&chunk);
                        while let Some(pos) = buf.iter().position(|b| *b == b'\n') {
                            let line = buf.split_to(pos + 1);
                            let mut line = &line[..];
                            if line.last() == Some(&b'\n') {
                                line = &line[..line.len() - 1];
                            }
                            if !line.is_empty() {
                                if let Ok(text) = std::str::from_utf8(line) {
                                    yield Ok(sse::data_event(text.trim_end_matches('\r')));
                                }
                            }
                        }
                    }
                }
            }

            if !buf.is_empty() {
                if let Ok(text) = std::str::from_utf8(&buf) {
                    let text = text.trim();
                    if !text.is_empty() {
                        yield Ok(sse::data_event(text));
                    }
                }
            }

            yield Ok(sse::done_event());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NodeConfig;
    use std::time::Duration as StdDuration;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn tunables() -> Tunables {
        Tunables::default()
    }

    async fn make_registry_with_online_node(llm_url: String) -> NodeRegistry {
        let reg = NodeRegistry::new(
            &[NodeConfig {
                id: 1,
                name: "node-1".into(),
                monitor_base_url: "http://unused".into(),
                llm_url,
                capability: None,
            }],
            3,
            StdDuration::from_secs(15),
        );
        let seq = reg.begin_poll(1).unwrap();
        reg.update_metrics(
            1,
            seq,
            PollOutcome::Success(crate::registry::Metrics {
                cpu_usage_percent: 10.0,
                cpu_model: "x".into(),
                memory_percent: 10.0,
                gpu_utilization_percent: 10.0,
                gpu_memory_usage_percent: 10.0,
                gpu_temperature_celsius: 40.0,
                models: std::collections::BTreeSet::from(["llama3".to_string()]),
            }),
        );
        reg
    }

    #[tokio::test]
    async fn buffered_dispatch_returns_assigned_node() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "choices": [{"message": {"content": "hi"}}]
            })))
            .mount(&server)
            .await;

        let registry = make_registry_with_online_node(format!("{}/chat", server.uri())).await;
        let dispatcher = Dispatcher::new(registry, reqwest::Client::new(), tunables());

        let result = dispatcher
            .dispatch_buffered(serde_json::json!({"messages": [], "stream": false}))
            .await
            .unwrap();

        assert_eq!(result.node_id, 1);
        assert_eq!(result.body["choices"][0]["message"]["content"], "hi");
    }

    #[tokio::test]
    async fn no_nodes_online_yields_no_available_node() {
        let registry = NodeRegistry::new(&[], 3, StdDuration::from_secs(15));
        let dispatcher = Dispatcher::new(registry, reqwest::Client::new(), tunables());
        let result = dispatcher
            .dispatch_buffered(serde_json::json!({"messages": []}))
            .await;
        assert!(matches!(result, Err(GatewayError::NoAvailableNode)));
    }

    #[tokio::test]
    async fn exclusivity_lock_prevents_concurrent_dispatch_to_same_node() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"ok": true})))
            .mount(&server)
            .await;

        let registry = make_registry_with_online_node(format!("{}/chat", server.uri())).await;
        let req = Requirements::default();
        let dispatcher = Dispatcher::new(registry.clone(), reqwest::Client::new(), tunables());

        let (view, _permit) = dispatcher.acquire_node(&req, &HashSet::new()).await.unwrap();
        assert_eq!(view.id, 1);
        assert!(registry.get(1).unwrap().busy);

        // Second acquisition must fail while the first permit is held,
        // exhausting its retries and returning NoAvailableNode.
        let second = dispatcher.acquire_node(&req, &HashSet::new()).await;
        assert!(matches!(second, Err(GatewayError::NoAvailableNode)));
    }

    async fn make_registry_with_two_online_nodes(llm_url_1: String, llm_url_2: String) -> NodeRegistry {
        let reg = NodeRegistry::new(
            &[
                NodeConfig {
                    id: 1,
                    name: "node-1".into(),
                    monitor_base_url: "http://unused".into(),
                    llm_url: llm_url_1,
                    capability: None,
                },
                NodeConfig {
                    id: 2,
                    name: "node-2".into(),
                    monitor_base_url: "http://unused".into(),
                    llm_url: llm_url_2,
                    capability: None,
                },
            ],
            3,
            StdDuration::from_secs(15),
        );
        for id in [1, 2] {
            let seq = reg.begin_poll(id).unwrap();
            reg.update_metrics(
                id,
                seq,
                PollOutcome::Success(crate::registry::Metrics {
                    cpu_usage_percent: 10.0,
                    cpu_model: "x".into(),
                    memory_percent: 10.0,
                    gpu_utilization_percent: 10.0,
                    gpu_memory_usage_percent: 10.0,
                    gpu_temperature_celsius: 40.0,
                    models: std::collections::BTreeSet::from(["llama3".to_string()]),
                }),
            );
        }
        reg
    }

    #[tokio::test]
    async fn buffered_dispatch_fails_over_to_second_node_after_503() {
        let bad = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&bad)
            .await;

        let good = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"ok": true})))
            .mount(&good)
            .await;

        // Node 1 scores highest (tie-break on lower id) but its llm_url
        // returns 503 immediately; the retry must fail over to node 2
        // rather than picking node 1 again.
        let registry =
            make_registry_with_two_online_nodes(format!("{}/chat", bad.uri()), format!("{}/chat", good.uri()))
                .await;
        let dispatcher = Dispatcher::new(registry, reqwest::Client::new(), tunables());

        let result = dispatcher
            .dispatch_buffered(serde_json::json!({"messages": [], "stream": false}))
            .await
            .unwrap();

        assert_eq!(result.node_id, 2);
        assert_eq!(result.body["ok"], true);
    }

    #[tokio::test]
    async fn streaming_dispatch_fails_over_to_second_node_after_503() {
        let bad = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&bad)
            .await;

        let good = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat"))
            .respond_with(ResponseTemplate::new(200).set_body(bytes::Bytes::from_static(
                b"{\"choices\":[{\"delta\":{\"content\":\"hi\"}}]}\n",
            )))
            .mount(&good)
            .await;

        let registry =
            make_registry_with_two_online_nodes(format!("{}/chat", bad.uri()), format!("{}/chat", good.uri()))
                .await;
        let dispatcher = Arc::new(Dispatcher::new(registry, reqwest::Client::new(), tunables()));

        let mut stream = dispatcher
            .dispatch_streaming(serde_json::json!({"messages": [], "stream": true}))
            .await
            .unwrap();

        let first = stream.next().await.unwrap().unwrap();
        let rendered = format!("{:?}", first);
        assert!(rendered.contains("node_assigned"));
        assert!(rendered.contains("\"node_id\":2"), "expected node_assigned for node 2, got: {rendered}");
    }

    #[tokio::test]
    async fn mid_stream_break_yields_error_frame_with_no_second_node_assigned() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_raw(b"{\"partial\":true".to_vec(), "application/json")
                    .append_header("Content-Length", "4096"),
            )
            .mount(&server)
            .await;

        let registry = make_registry_with_online_node(format!("{}/chat", server.uri())).await;
        let dispatcher = Arc::new(Dispatcher::new(registry, reqwest::Client::new(), tunables()));

        let stream = dispatcher
            .dispatch_streaming(serde_json::json!({"messages": [], "stream": true}))
            .await
            .unwrap();
        let events: Vec<_> = stream.collect().await;
        let rendered: Vec<String> = events.iter().map(|e| format!("{:?}", e)).collect();

        let node_assigned_count = rendered.iter().filter(|r| r.contains("node_assigned")).count();
        assert_eq!(node_assigned_count, 1, "node_assigned must appear exactly once, never on failover mid-stream");

        let saw_error_frame = rendered.iter().any(|r| r.contains("\"error\""));
        assert!(saw_error_frame, "expected an in-band error frame after the connection broke mid-response");
    }
}
