use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use threatlens_api::config::ServerConfig;
use threatlens_api::router::build_app_router;
use threatlens_api::state::AppState;
use threatlens_db::{
    AnalysisStore, InMemoryAnalysisStore, InMemoryJobQueue, JobQueue, PgAnalysisStore, PgJobQueue,
};
use threatlens_events::ProgressBus;
use threatlens_pipeline::AnalysisService;
use threatlens_worker::{build_analysis_worker, init_tracing, WorkerConfig, WorkerPool};
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing("threatlens_api=debug,threatlens_pipeline=debug,tower_http=debug");

    // --- Configuration ---
    let config = ServerConfig::from_env()?;
    let worker_config = WorkerConfig::from_env()?;
    tracing::info!(host = %config.host, port = %config.port, "Loaded server configuration");

    // --- Persistence ---
    let (store, queue): (Arc<dyn AnalysisStore>, Arc<dyn JobQueue>) =
        match std::env::var("DATABASE_URL") {
            Ok(database_url) => {
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
                let store: Arc<dyn AnalysisStore> = Arc::new(PgAnalysisStore::new(pool.clone()));
                let queue: Arc<dyn JobQueue> =
                    Arc::new(PgJobQueue::with_lock_duration(pool, worker_config.lock_duration));
                (store, queue)
            }
            Err(_) => {
                tracing::warn!("DATABASE_URL not set, analyses are kept in memory only");
                let store: Arc<dyn AnalysisStore> = Arc::new(InMemoryAnalysisStore::new());
                let queue: Arc<dyn JobQueue> =
                    Arc::new(InMemoryJobQueue::with_lock_duration(worker_config.lock_duration));
                (store, queue)
            }
        };

    // --- Embedded worker pool ---
    let bus = Arc::new(ProgressBus::default());
    let worker = Arc::new(build_analysis_worker(
        &worker_config,
        Arc::clone(&store),
        Arc::clone(&bus),
    ));
    let pool = WorkerPool::new(
        Arc::clone(&queue),
        worker,
        worker_config.concurrency,
        worker_config.poll_interval,
    );
    let shutdown = CancellationToken::new();
    let pool_handle = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move { pool.run(shutdown).await })
    };

    // --- App state ---
    let state = AppState {
        service: AnalysisService::new(store, queue),
        bus,
        config: Arc::new(config.clone()),
        shutdown: shutdown.clone(),
    };
    let app = build_app_router(state, &config)?;

    // --- Start server ---
    let addr = SocketAddr::new(
        config.host.parse().context("Invalid HOST address")?,
        config.port,
    );
    tracing::info!(%addr, "Starting server");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("Failed to bind to address")?;

    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            shutdown_signal().await;
            shutdown.cancel();
        }
    });

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.clone().cancelled_owned())
        .await
        .context("Server error")?;

    // --- Post-shutdown cleanup ---
    tracing::info!("Server stopped accepting connections, draining worker pool");
    if tokio::time::timeout(Duration::from_secs(config.shutdown_timeout_secs), pool_handle)
        .await
        .is_err()
    {
        tracing::warn!(
            lock_duration_ms = worker_config.lock_duration.as_millis() as u64,
            "Worker pool did not drain before the shutdown timeout; unfinished jobs are reclaimed once their queue lock expires",
        );
    }

    tracing::info!("Graceful shutdown complete");
    Ok(())
}

/// Wait for a termination signal to initiate graceful shutdown.
///
/// Handles both SIGINT (Ctrl-C) and SIGTERM (on Unix).
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
        () = ctrl_c => tracing::info!("Received SIGINT, starting graceful shutdown"),
        () = terminate => tracing::info!("Received SIGTERM, starting graceful shutdown"),
    }
}
