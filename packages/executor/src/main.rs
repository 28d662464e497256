// Job executor daemon entry point.

use std::sync::Arc;

use anyhow::{Context, Result};
use executor_core::dispatch::Dispatcher;
use executor_core::handlers;
use executor_core::{Config, ExecutorContext};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,executor_core=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting job executor");

    // Configuration problems are fatal; the supervisor restarts us once
    // the environment is fixed.
    let config = Config::from_env().context("Failed to load configuration")?;
    tracing::info!(worker_id = %config.worker_id, "Configuration loaded");

    let ctx: Arc<ExecutorContext> =
        ExecutorContext::production(config).context("Failed to build executor context")?;

    let registry = Arc::new(handlers::build_registry());
    tracing::info!(
        handlers = registry.registered_types().len(),
        periodics = registry.periodic_types().len(),
        "Handler registry built"
    );

    let dispatcher = Dispatcher::new(ctx, registry);

    // Crash recovery: jobs this worker id left running are orphans from a
    // previous incarnation.
    let recovered = dispatcher
        .recover_orphans()
        .await
        .context("Startup orphan recovery failed")?;
    if recovered > 0 {
        tracing::warn!(count = recovered, "Recovered orphaned jobs from previous run");
    }

    // Make sure the periodic control loops have a scheduled run.
    dispatcher
        .seed_periodics()
        .await
        .context("Failed to seed periodic jobs")?;

    dispatcher.run_until_shutdown().await
}
