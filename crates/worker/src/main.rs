use std::sync::Arc;

use anyhow::Context;
use threatlens_db::{PgAnalysisStore, PgJobQueue};
use threatlens_events::ProgressBus;
use threatlens_worker::{build_analysis_worker, init_tracing, WorkerConfig, WorkerPool};
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing("threatlens_worker=debug,threatlens_pipeline=debug");

    // --- Configuration ---
    let config = WorkerConfig::from_env()?;
    tracing::info!(
        concurrency = config.concurrency,
        vision_url = %config.vision_url,
        secondary_url = %config.secondary_url,
        "Loaded worker configuration",
    );

    // --- Database ---
    let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?;
    let pool = threatlens_db::create_pool(&database_url)
        .await
        .context("Failed to connect to database")?;
    threatlens_db::health_check(&pool)
        .await
        .context("Database health check failed")?;
    threatlens_db::run_migrations(&pool)
        .await
        .context("Failed to run database migrations")?;
    tracing::info!("Database ready");

    // --- Pipeline ---
    let store = Arc::new(PgAnalysisStore::new(pool.clone()));
    let queue = Arc::new(PgJobQueue::with_lock_duration(pool, config.lock_duration));
    let bus = Arc::new(ProgressBus::default());
    let worker = Arc::new(build_analysis_worker(&config, store, bus));

    let pool = WorkerPool::new(queue, worker, config.concurrency, config.poll_interval);
    let cancel = CancellationToken::new();
    let handle = {
        let cancel = cancel.clone();
        tokio::spawn(async move { pool.run(cancel).await })
    };

    shutdown_signal().await;
    cancel.cancel();
    handle.await.context("Worker pool task failed")?;

    tracing::info!("Graceful shutdown complete");
    Ok(())
}

/// Wait for SIGINT or (on Unix) SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("Received SIGINT, draining in-flight analyses"),
        () = terminate => tracing::info!("Received SIGTERM, draining in-flight analyses"),
    }
}
