//! Dataport Server - Main entry point

use anyhow::{Context, Result};
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use dataport_common::logging::{init_logging, LogConfig};
use serde_json::json;
use sqlx::postgres::PgPoolOptions;
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tokio::signal;
use tracing::{error, info, warn};

use dataport_server::{
    config::Config,
    features,
    jobs::{ExportWorker, ImportWorker, JobQueue, JobStore, PgJobStore, WorkerRegistry},
    middleware,
    records::{PgRecordStore, RecordStore},
    storage::StorageService,
};

#[tokio::main]
async fn main() -> Result<()> {
    let log_config = LogConfig::default()
        .with_file_prefix("dataport-server")
        .with_filter_directives("dataport_server=debug,tower_http=debug,sqlx=warn")
        .merge_lookup(|key| std::env::var(key).ok())?;
    let _log_guard = init_logging(&log_config)?;

    info!("Starting Dataport Server");

    let config = Config::load()?;
    info!(
        "Configuration loaded - server will bind to {}:{}",
        config.server.host, config.server.port
    );

    let db_pool = PgPoolOptions::new()
        .max_connections(config.database.max_connections)
        .min_connections(config.database.min_connections)
        .acquire_timeout(Duration::from_secs(config.database.connect_timeout_secs))
        .idle_timeout(Duration::from_secs(config.database.idle_timeout_secs))
        .connect(&config.database.url)
        .await
        .context("Failed to connect to the database")?;

    info!("Database connection pool established");

    sqlx::migrate!("../../migrations")
        .run(&db_pool)
        .await
        .context("Failed to run migrations")?;

    info!("Database migrations completed");

    let storage = StorageService::live(db_pool.clone());
    match storage.active_backend().await {
        Some(backend) => info!(backend = %backend, "Storage backend available"),
        None => warn!("No storage service configured; imports and exports will fail until one is"),
    }

    let job_store: Arc<dyn JobStore> = Arc::new(PgJobStore::new(db_pool.clone()));
    let record_store: Arc<dyn RecordStore> = Arc::new(PgRecordStore::new(db_pool.clone()));
    let workers = WorkerRegistry::new(
        Arc::new(ImportWorker::new(
            job_store.clone(),
            record_store.clone(),
            storage.clone(),
            config.jobs.clone(),
        )),
        Arc::new(ExportWorker::new(
            job_store.clone(),
            record_store,
            storage,
            config.jobs.clone(),
        )),
    );
    let queue = JobQueue::new(job_store.clone(), workers, config.jobs.clone());
    info!(
        owner = queue.owner(),
        max_concurrent = config.jobs.max_concurrent,
        "Job queue ready"
    );

    if config.jobs.reconcile_interval_secs > 0 {
        spawn_reconciler(queue.clone(), config.jobs.reconcile_interval_secs);
    }

    let app = create_router(db_pool, features::FeatureState {
        queue: queue.clone(),
        jobs: job_store,
    });

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;
    info!("Server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    drain_jobs(&queue, config.server.shutdown_timeout_secs).await;
    info!("Server shut down gracefully");

    Ok(())
}

/// Create the application router with all routes and middleware
fn create_router(db: sqlx::PgPool, feature_state: features::FeatureState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .with_state(db)
        .nest("/api/v1", features::router(feature_state))
        .layer(middleware::tracing_layer())
}

/// Health check handler
async fn health_check(State(db): State<sqlx::PgPool>) -> Result<Response, StatusCode> {
    match sqlx::query("SELECT 1").fetch_one(&db).await {
        Ok(_) => Ok((
            StatusCode::OK,
            Json(json!({
                "status": "healthy",
                "database": "connected"
            })),
        )
            .into_response()),
        Err(e) => {
            error!("Database health check failed: {:?}", e);
            Err(StatusCode::SERVICE_UNAVAILABLE)
        },
    }
}

/// Periodically sweep leases and pick up PENDING rows
fn spawn_reconciler(queue: JobQueue, interval_secs: u64) {
    info!(interval_secs, "Periodic job reconciliation enabled");
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs));
        loop {
            ticker.tick().await;
            if let Err(e) = queue.reclaim_expired_leases().await {
                error!("Lease sweep failed: {}", e);
            }
            if let Err(e) = queue.process_pending_jobs().await {
                error!("Pending job scan failed: {}", e);
            }
        }
    });
}

/// Give running jobs a chance to finish before the process exits
async fn drain_jobs(queue: &JobQueue, timeout_secs: u64) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(timeout_secs);
    loop {
        let running = queue.in_flight().await;
        if running == 0 {
            return;
        }
        if tokio::time::Instant::now() >= deadline {
            // Leases of these jobs expire and the next sweep picks them up
            error!(running, "Shutdown timeout reached with jobs still running");
            return;
        }
        info!(running, "Waiting for running jobs to finish");
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            },
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, starting graceful shutdown");
        },
        _ = terminate => {
            info!("Received terminate signal, starting graceful shutdown");
        },
    }
}
