//! Startup configuration: static node list plus tunables.
//!
//! Loaded once from a TOML file (`INFEROPS_CONFIG`, default
//! `./inferops.toml`) with environment variable overrides for every
//! tunable via a layered `config::Config` builder.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Static capability declared for a node at startup.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct StaticCapability {
    pub vram_gb: f64,
    pub tflops: f64,
}

impl Default for StaticCapability {
    /// Neutral baseline used when a node declares no capability.
    fn default() -> Self {
        Self {
            vram_gb: 16.0,
            tflops: 20.0,
        }
    }
}

/// A single configured node: identity and capability, declared at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub id: u32,
    pub name: String,
    pub monitor_base_url: String,
    pub llm_url: String,
    #[serde(default)]
    pub capability: Option<StaticCapability>,
}

/// Scheduler scoring weights. Must sum to ~1.0; not enforced at load time
/// beyond a sanity warning, since an operator might deliberately bias them.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SchedulerWeights {
    pub cap: f64,
    pub gpu_util: f64,
    pub gpu_mem: f64,
    pub cpu: f64,
    pub mem: f64,
    pub temp: f64,
}

impl Default for SchedulerWeights {
    fn default() -> Self {
        Self {
            cap: 0.30,
            gpu_util: 0.25,
            gpu_mem: 0.15,
            cpu: 0.10,
            mem: 0.10,
            temp: 0.10,
        }
    }
}

/// Tunables with spec-mandated defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Tunables {
    pub poll_interval_ms: u64,
    pub telemetry_timeout_ms: u64,
    pub offline_failure_threshold: u32,
    pub offline_staleness_secs: u64,
    pub offline_alert_delay_secs: u64,
    pub max_workers: usize,
    pub batch_item_deadline_secs: u64,
    pub dispatcher_connect_timeout_secs: u64,
    pub dispatcher_idle_read_timeout_secs: u64,
    pub dispatcher_max_attempts: usize,
    pub dispatcher_lock_retry_backoff_ms: u64,
    pub job_lru_cap: usize,
    pub weights: SchedulerWeights,
}

impl Default for Tunables {
    fn default() -> Self {
        Self {
            poll_interval_ms: 2_000,
            telemetry_timeout_ms: 1_500,
            offline_failure_threshold: 3,
            offline_staleness_secs: 15,
            offline_alert_delay_secs: 30,
            max_workers: 8,
            batch_item_deadline_secs: 300,
            dispatcher_connect_timeout_secs: 5,
            dispatcher_idle_read_timeout_secs: 60,
            dispatcher_max_attempts: 3,
            dispatcher_lock_retry_backoff_ms: 50,
            job_lru_cap: 256,
            weights: SchedulerWeights::default(),
        }
    }
}

impl Tunables {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn telemetry_timeout(&self) -> Duration {
        Duration::from_millis(self.telemetry_timeout_ms)
    }

    pub fn staleness_window(&self) -> Duration {
        // "fresh metrics" = updated within 2 x poll_interval.
        self.poll_interval() * 2
    }

    pub fn offline_staleness(&self) -> Duration {
        Duration::from_secs(self.offline_staleness_secs)
    }

    pub fn offline_alert_delay(&self) -> Duration {
        Duration::from_secs(self.offline_alert_delay_secs)
    }

    pub fn dispatcher_idle_read_timeout(&self) -> Duration {
        Duration::from_secs(self.dispatcher_idle_read_timeout_secs)
    }

    pub fn batch_item_deadline(&self) -> Duration {
        Duration::from_secs(self.batch_item_deadline_secs)
    }
}

/// Top-level gateway configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub bind: String,
    pub nodes: Vec<NodeConfig>,
    #[serde(default)]
    pub tunables: Tunables,
}

impl Config {
    /// Load from `path`, then apply environment variable overrides for
    /// tunables, via a layered `config::Config` builder.
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path))
            .add_source(config::Environment::with_prefix("INFEROPS").separator("__"))
            .build()?;

        let cfg: Config = settings.try_deserialize()?;
        Ok(cfg)
    }

    /// Load from the `INFEROPS_CONFIG` environment variable, defaulting to
    /// `./inferops.toml`.
    pub fn from_env() -> anyhow::Result<Self> {
        let path = std::env::var("INFEROPS_CONFIG").unwrap_or_else(|_| "inferops.toml".into());
        Self::load(std::path::Path::new(&path))
    }
}
