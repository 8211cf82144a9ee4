//! Batch Job Engine — fans a dataset out across the same Scheduler/
//! Dispatcher live chat uses, through a bounded worker pool, with
//! incremental, append-only progress.
//!
//! Follows the same concurrency idiom as `EdgeService`: shared `Arc`
//! state, `tokio::spawn` worker tasks pulling from a common cursor,
//! atomics for progress counters instead of a single coarse lock (mirrors
//! `AtomicMetrics`). Per-job locking means each job is an independent
//! `tokio::sync::RwLock`, so one job's read traffic never contends with
//! another job's writers, and a read may observe an in-progress snapshot.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use dashmap::DashMap;
use serde::Serialize;
use time::OffsetDateTime;
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::Tunables;
use crate::dispatch::Dispatcher;
use crate::error::GatewayError;
use crate::registry::NodeRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResultEntry {
    pub original: serde_json::Value,
    pub output: serde_json::Value,
}

/// A batch job's full, serializable state. `results` is append-only for
/// the job's lifetime; ordering here is completion order, not input
/// order — see the module doc on `JobEngine` for why, and `DESIGN.md`
/// for the recorded decision.
#[derive(Debug, Clone, Serialize)]
pub struct Job {
    pub job_id: String,
    pub status: JobStatus,
    pub total_items: usize,
    pub processed_items: usize,
    pub results: Vec<ResultEntry>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

pub struct JobEngine {
    registry: NodeRegistry,
    dispatcher: Arc<Dispatcher>,
    tunables: Tunables,
    jobs: Arc<DashMap<String, Arc<RwLock<Job>>>>,
    /// Insertion order for the LRU eviction cap.
    order: Arc<Mutex<VecDeque<String>>>,
}

impl JobEngine {
    pub fn new(registry: NodeRegistry, dispatcher: Arc<Dispatcher>, tunables: Tunables) -> Self {
        Self {
            registry,
            dispatcher,
            tunables,
            jobs: Arc::new(DashMap::new()),
            order: Arc::new(Mutex::new(VecDeque::new())),
        }
    }

    /// Validate, allocate, and kick off a dataset job. Returns the new
    /// job id immediately; processing continues in the background.
    pub async fn create_job(
        &self,
        items: Vec<serde_json::Value>,
        data_count: Option<i64>,
    ) -> Result<String, GatewayError> {
        if let Some(count) = data_count {
            if count == 0 {
                return Err(GatewayError::BadDataset(
                    "data_count must be positive".to_string(),
                ));
            }
        }

        let items = match data_count {
            Some(count) if count > 0 => {
                items.into_iter().take(count as usize).collect::<Vec<_>>()
            }
            _ => items,
        };

        let job_id = Uuid::new_v4().simple().to_string();
        let now = OffsetDateTime::now_utc();
        let job = Job {
            job_id: job_id.clone(),
            status: JobStatus::Running,
            total_items: items.len(),
            processed_items: 0,
            results: Vec::new(),
            created_at: now,
            updated_at: now,
        };
        let job = Arc::new(RwLock::new(job));
        self.jobs.insert(job_id.clone(), job.clone());
        self.evict_if_needed(&job_id).await;

        info!(job_id = %job_id, total_items = items.len(), "batch job created");

        if items.is_empty() {
            let mut guard = job.write().await;
            guard.status = JobStatus::Completed;
            guard.updated_at = OffsetDateTime::now_utc();
        } else {
            self.spawn_workers(job_id.clone(), job, items);
        }

        Ok(job_id)
    }

    pub async fn status(&self, job_id: &str) -> Result<Job, GatewayError> {
        let entry = self
            .jobs
            .get(job_id)
            .ok_or_else(|| GatewayError::JobNotFound(job_id.to_string()))?;
        let guard = entry.read().await;
        Ok(guard.clone())
    }

    async fn evict_if_needed(&self, new_id: &str) {
        let mut order = self.order.lock().await;
        order.push_back(new_id.to_string());
        while order.len() > self.tunables.job_lru_cap {
            if let Some(oldest) = order.pop_front() {
                self.jobs.remove(&oldest);
            }
        }
    }

    fn spawn_workers(
        &self,
        job_id: String,
        job: Arc<RwLock<Job>>,
        items: Vec<serde_json::Value>,
    ) {
        let worker_count = self
            .tunables
            .max_workers
            .min(self.registry.online_count().max(1))
            .min(items.len())
            .max(1);

        let items = Arc::new(items);
        let cursor = Arc::new(AtomicUsize::new(0));
        let dispatcher = self.dispatcher.clone();
        let deadline = self.tunables.batch_item_deadline();

        for _ in 0..worker_count {
            let items = items.clone();
            let cursor = cursor.clone();
            let dispatcher = dispatcher.clone();
            let job = job.clone();
            let job_id = job_id.clone();

            tokio::spawn(async move {
                loop {
                    let idx = cursor.fetch_add(1, Ordering::Relaxed);
                    if idx >= items.len() {
                        break;
                    }
                    let item = items[idx].clone();
                    let request = serde_json::json!({
                        "messages": [{
                            "role": "user",
                            "content": item.to_string(),
                        }],
                        "stream": false,
                    });

                    let outcome = tokio::time::timeout(deadline, dispatcher.dispatch_buffered(request)).await;

                    let output = match outcome {
                        Ok(Ok(resp)) => resp.body,
                        Ok(Err(e)) => {
                            warn!(job_id = %job_id, idx, error = %e, "batch item failed");
                            serde_json::json!({ "error": e.to_string() })
                        }
                        Err(_elapsed) => {
                            warn!(job_id = %job_id, idx, "batch item deadline exceeded");
                            serde_json::json!({ "error": "item deadline exceeded" })
                        }
                    };

                    let mut guard = job.write().await;
                    guard.results.push(ResultEntry {
                        original: item,
                        output,
                    });
                    guard.processed_items += 1;
                    guard.updated_at = OffsetDateTime::now_utc();
                    if guard.processed_items >= guard.total_items {
                        guard.status = JobStatus::Completed;
                    }
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NodeConfig;
    use crate::registry::PollOutcome;
    use std::time::Duration;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn online_registry(llm_url: String) -> NodeRegistry {
        let reg = NodeRegistry::new(
            &[NodeConfig {
                id: 1,
                name: "node-1".into(),
                monitor_base_url: "http://unused".into(),
                llm_url,
                capability: None,
            }],
            3,
            Duration::from_secs(15),
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
                models: std::collections::BTreeSet::new(),
            }),
        );
        reg
    }

    #[tokio::test]
    async fn s6_batch_job_processes_capped_items() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"ok": true})))
            .mount(&server)
            .await;

        let registry = online_registry(format!("{}/chat", server.uri())).await;
        let dispatcher = Arc::new(Dispatcher::new(registry.clone(), reqwest::Client::new(), Tunables::default()));
        let engine = JobEngine::new(registry, dispatcher, Tunables::default());

        let items = vec![
            serde_json::json!({"q": "a"}),
            serde_json::json!({"q": "b"}),
            serde_json::json!({"q": "c"}),
        ];
        let job_id = engine.create_job(items, Some(2)).await.unwrap();

        // Poll until completed (workers run in background tasks).
        let mut job = engine.status(&job_id).await.unwrap();
        for _ in 0..100 {
            if job.status == JobStatus::Completed {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
            job = engine.status(&job_id).await.unwrap();
        }

        assert_eq!(job.total_items, 2);
        assert_eq!(job.processed_items, 2);
        assert_eq!(job.results.len(), 2);
        assert_eq!(job.status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn data_count_zero_is_rejected() {
        let registry = online_registry("http://unused".into()).await;
        let dispatcher = Arc::new(Dispatcher::new(registry.clone(), reqwest::Client::new(), Tunables::default()));
        let engine = JobEngine::new(registry, dispatcher, Tunables::default());

        let result = engine
            .create_job(vec![serde_json::json!({"q": "a"})], Some(0))
            .await;
        assert!(matches!(result, Err(GatewayError::BadDataset(_))));
    }

    #[tokio::test]
    async fn repeated_submission_yields_independent_jobs() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"ok": true})))
            .mount(&server)
            .await;

        let registry = online_registry(format!("{}/chat", server.uri())).await;
        let dispatcher = Arc::new(Dispatcher::new(registry.clone(), reqwest::Client::new(), Tunables::default()));
        let engine = JobEngine::new(registry, dispatcher, Tunables::default());

        let items = vec![serde_json::json!({"q": "a"})];
        let job_a = engine.create_job(items.clone(), None).await.unwrap();
        let job_b = engine.create_job(items, None).await.unwrap();
        assert_ne!(job_a, job_b);
    }

    #[tokio::test]
    async fn unknown_job_is_not_found() {
        let registry = online_registry("http://unused".into()).await;
        let dispatcher = Arc::new(Dispatcher::new(registry.clone(), reqwest::Client::new(), Tunables::default()));
        let engine = JobEngine::new(registry, dispatcher, Tunables::default());
        assert!(matches!(
            engine.status("does-not-exist").await,
            Err(GatewayError::JobNotFound(_))
        ));
    }
}
