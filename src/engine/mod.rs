pub mod config;
pub mod error;
pub mod metrics;
pub mod models;
pub mod queue;
pub mod sandbox;
pub mod sanitize;
pub mod store;
pub mod workspace;
pub mod worker;

#[cfg(test)]
mod testing;

use std::sync::Arc;

use anyhow::Context;
use tokio::sync::watch;

use crate::engine::{
    config::EngineConfig,
    metrics::WorkerMetrics,
    queue::RedisJobQueue,
    sandbox::{DockerRuntime, LanguageRegistry, Orchestrator},
    store::RedisStatusStore,
    worker::Worker,
    workspace::WorkspaceManager,
};

pub async fn run() -> anyhow::Result<()> {
    let config = match EngineConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            init_tracing("info");
            tracing::error!(error = %err, "refusing to start");
            return Err(err).context("invalid worker configuration");
        }
    };
    init_tracing(&config.log_level);

    let registry = LanguageRegistry::builtin()
        .with_image_overrides(&config.sandbox.image_overrides)
        .context("invalid language configuration")?;

    tokio::fs::create_dir_all(&config.workspace.local_base)
        .await
        .with_context(|| {
            format!(
                "failed to prepare workspace base {}",
                config.workspace.local_base.display()
            )
        })?;

    let client = redis::Client::open(config.redis_url.as_str()).context("invalid REDIS_URL")?;
    let queue = Arc::new(RedisJobQueue::connect(&client, config.queue_name.clone()).await?);
    let store = Arc::new(
        RedisStatusStore::connect(&client, config.status_key_prefix.clone())
            .await
            .context("failed to open status store connection")?,
    );

    let runtime = DockerRuntime::connect(config.sandbox.pull_images, config.sandbox.pull_timeout)?;
    if let Err(err) = runtime.ping().await {
        tracing::warn!(error = %format!("{err:#}"), "sandbox runtime unreachable, jobs will fail until it is up");
    }
    let orchestrator = Orchestrator::new(Arc::new(runtime), &config.sandbox);

    let worker = Worker::new(
        queue,
        store,
        registry,
        WorkspaceManager::new(&config.workspace),
        orchestrator,
        Arc::new(WorkerMetrics::new()),
    )
    .with_polling(config.dequeue_poll, config.dequeue_backoff);

    tracing::info!(
        queue = %config.queue_name,
        local_base = %config.workspace.local_base.display(),
        host_base = %config.workspace.host_base.display(),
        timeout_ms = config.sandbox.limits.timeout_ms,
        memory_mb = config.sandbox.limits.memory_mb,
        "sandbox worker ready"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        tracing::info!("shutdown requested, finishing in-flight job");
        let _ = shutdown_tx.send(true);
    });

    worker.run(shutdown_rx).await;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if tokio::signal::ctrl_c().await.is_err() {
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                tracing::warn!(error = %err, "cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

fn init_tracing(log_level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .json()
        .with_current_span(false)
        .with_span_list(false)
        .init();
}
