//! Stream indexer binary

use anyhow::Context;
use stream_indexer::{IndexerConfig, StreamIndexer, WorkQueue};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Config file from the first argument, environment otherwise
    let config = match std::env::args().nth(1) {
        Some(path) => IndexerConfig::from_file(&path)
            .with_context(|| format!("Failed to load config from {}", path))?,
        None => IndexerConfig::from_env().context("Failed to load config from environment")?,
    };

    // Initialize tracing
    let filter = EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into());
    if config.logging.json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    tracing::info!(service = %config.service_name, "Starting stream indexer");

    let indexer = StreamIndexer::open(config)?;
    let worker = indexer.start_worker();

    let pending = indexer.queue().len().await?;
    tracing::info!(pending_tasks = pending, "Replay worker running");

    tokio::signal::ctrl_c().await?;

    tracing::info!("Shutting down stream indexer");
    worker.shutdown().await?;

    let status = worker.status();
    tracing::info!(
        recomputed = status.recomputed,
        failed = status.failed,
        "Replay worker totals"
    );
    Ok(())
}
