//! Capacity allocator.
//!
//! Hosts the allocation engine and keeps dedicated nodes converged by running
//! the reconcile worker until shutdown.

use std::sync::Arc;

use anyhow::{Context, Result};
use capacity_allocator::{
    catalog::PlanCatalog,
    collaborators::{
        HttpHypervisor, HttpMetricsSource, Hypervisor, MetricsSource, MockHypervisor,
        MockMetricsSource,
    },
    config::{Config, StoreBackend},
    engine::CapacityEngine,
    reconciler::ReconcileWorker,
    store::{Database, MemoryStore, Store},
};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    // Prefer RUST_LOG, fall back to CAPACITY_LOG_LEVEL
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting capacity allocator");

    let catalog = match &config.catalog_path {
        Some(path) => PlanCatalog::from_path(path)
            .with_context(|| format!("loading plan catalog from {}", path.display()))?,
        None => PlanCatalog::builtin().context("loading built-in plan catalog")?,
    };
    info!(
        catalog_version = catalog.version(),
        catalog_digest = %catalog.digest(),
        plans = catalog.list_plans().len(),
        "Plan catalog loaded"
    );

    let store: Arc<dyn Store> = match config.store_backend {
        StoreBackend::Memory => {
            warn!("Using in-memory store; state is lost on exit");
            Arc::new(MemoryStore::new())
        }
        StoreBackend::Postgres => {
            let db = match Database::connect(&config.database).await {
                Ok(db) => {
                    info!("Database connection established");
                    db
                }
                Err(e) => {
                    error!(error = %e, "Failed to connect to database");
                    return Err(e.into());
                }
            };

            if config.dev_mode {
                info!("Running database migrations (dev mode)");
                if let Err(e) = db.run_migrations().await {
                    error!(error = %e, "Failed to run migrations");
                    return Err(e.into());
                }
            }
            Arc::new(db.store())
        }
    };

    let (hypervisor, metrics): (Arc<dyn Hypervisor>, Arc<dyn MetricsSource>) =
        if config.mock_collaborators {
            warn!("Using mock hypervisor and metrics source");
            (
                Arc::new(MockHypervisor::new()),
                Arc::new(MockMetricsSource::new()),
            )
        } else {
            info!(
                hypervisor_url = %config.hypervisor_url,
                metrics_url = %config.metrics_url,
                "Using HTTP collaborators"
            );
            (
                Arc::new(HttpHypervisor::new(
                    config.hypervisor_url.clone(),
                    config.engine.hypervisor_timeout,
                )?),
                Arc::new(HttpMetricsSource::new(
                    config.metrics_url.clone(),
                    config.engine.metrics_timeout,
                )?),
            )
        };

    let engine = CapacityEngine::new(
        Arc::new(catalog),
        store.clone(),
        hypervisor,
        metrics,
        &config.engine,
    );

    if let Err(e) = store.health_check().await {
        error!(error = %e, "Store health check failed");
        return Err(e.into());
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let worker = ReconcileWorker::new(
        Arc::new(engine.reconciler(config.pending_grace)),
        config.reconcile_interval,
    );
    let worker_handle = tokio::spawn({
        let shutdown_rx = shutdown_rx.clone();
        async move {
            worker.run(shutdown_rx).await;
        }
    });

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("Received shutdown signal");

    let _ = shutdown_tx.send(true);

    info!("Waiting for workers to shut down...");
    let shutdown_timeout = std::time::Duration::from_secs(10);
    if let Err(e) = tokio::time::timeout(shutdown_timeout, worker_handle).await {
        warn!(error = %e, "Reconcile worker did not shut down in time");
    }

    info!("Capacity allocator shutdown complete");
    Ok(())
}
