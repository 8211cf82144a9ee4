//! InferOps gateway binary entry point: load configuration, bring up the
//! Node Registry and telemetry pollers, then serve the Public HTTP
//! Facade until a shutdown signal arrives.

use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::info;

use inferops_gateway::api::{self, AppState};
use inferops_gateway::batch::JobEngine;
use inferops_gateway::config::Config;
use inferops_gateway::dispatch::Dispatcher;
use inferops_gateway::metrics::AtomicMetrics;
use inferops_gateway::registry::NodeRegistry;
use inferops_gateway::telemetry;

#[derive(Debug, Parser)]
#[command(name = "inferops-gateway", about = "GPU inference node gateway")]
struct Cli {
    /// Path to the TOML configuration file. Overrides INFEROPS_CONFIG.
    #[arg(long, env = "INFEROPS_CONFIG")]
    config: Option<String>,
}

fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?;

    rt.block_on(run(cli))
}

async fn run(cli: Cli) -> Result<()> {
    let cfg = match cli.config {
        Some(path) => Config::load(std::path::Path::new(&path))?,
        None => Config::from_env()?,
    };
    info!(nodes = cfg.nodes.len(), bind = %cfg.bind, "configuration loaded");

    let registry = NodeRegistry::new(
        &cfg.nodes,
        cfg.tunables.offline_failure_threshold,
        cfg.tunables.offline_staleness(),
    );

    let client = reqwest::Client::builder()
        .build()
        .context("failed to build HTTP client")?;

    let shutdown = CancellationToken::new();
    telemetry::spawn_pollers(registry.clone(), client.clone(), cfg.tunables.clone(), shutdown.clone());

    let dispatcher = Arc::new(Dispatcher::new(registry.clone(), client, cfg.tunables.clone()));
    let jobs = Arc::new(JobEngine::new(registry.clone(), dispatcher.clone(), cfg.tunables.clone()));

    let state = AppState {
        registry,
        dispatcher,
        jobs,
        tunables: cfg.tunables,
        metrics: Arc::new(AtomicMetrics::new()),
        start_time: Instant::now(),
        shutdown: shutdown.clone(),
    };

    let app = api::router(state);
    let listener = tokio::net::TcpListener::bind(&cfg.bind)
        .await
        .with_context(|| format!("failed to bind {}", cfg.bind))?;
    info!(bind = %cfg.bind, "inferops gateway listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(wait_for_shutdown(shutdown))
        .await
        .context("server error")?;

    info!("inferops gateway stopped");
    Ok(())
}

async fn wait_for_shutdown(shutdown: CancellationToken) {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.ok();
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("shutdown signal received");
    shutdown.cancel();
}
