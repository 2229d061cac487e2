/// Server setup and initialization
///
/// Wires together all components: storage, node registry, suspension hub,
/// run manager, triggers, queue worker and HTTP routes.

use crate::{
    api::{create_run_routes, create_webhook_routes, AppState},
    config::Config,
    queue::{store::SqliteJobQueue, worker::QueueWorker, JobQueue},
    runtime::{
        bus::{LocalResumeBus, PgResumeBus, ResumeBus},
        executor::register_builtin_nodes,
        manager::RunManager,
        scheduler::CronTriggerSource,
        suspension::SuspensionHub,
        triggers::TriggerManager,
    },
    workflow::{
        registry::NodeRegistry,
        storage::{ExecutionRecordStore, SqliteExecutionRecordStore},
    },
};
use anyhow::{Context, Result};
use axum::{routing::get, Router};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::{str::FromStr, sync::Arc};
use tokio::{net::TcpListener, sync::watch};
use tracing_subscriber::EnvFilter;

/// A fully wired application: router plus the background pieces it needs
pub struct App {
    pub router: Router,
    pub state: AppState,
    /// Present when this process runs a queue worker
    pub worker: Option<QueueWorker>,
}

/// Open (and create if missing) the SQLite database behind `url`
pub async fn connect_database(url: &str) -> Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str(url)
        .with_context(|| format!("Invalid database url: {}", url))?
        .create_if_missing(true);

    if let Some(parent) = options.get_filename().parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            tracing::info!("📁 Creating data directory: {}", parent.display());
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create data directory {}", parent.display()))?;
        }
    }

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await
        .with_context(|| format!("Failed to open database {}", url))?;
    Ok(pool)
}

/// Create the main application with all routes and background components
pub async fn create_app(config: Config) -> Result<App> {
    tracing::info!("🗄️ Opening database: {}", config.database.url);
    let pool = connect_database(&config.database.url).await?;

    let records = SqliteExecutionRecordStore::new(pool.clone());
    records.init_schema().await.context("Failed to initialize execution records")?;
    let records: Arc<dyn ExecutionRecordStore> = Arc::new(records);

    tracing::info!("📊 Initializing node registry");
    let registry = Arc::new(NodeRegistry::new());
    register_builtin_nodes(&registry)?;

    let bus: Arc<dyn ResumeBus> = match &config.bus.postgres_url {
        Some(url) => {
            tracing::info!("📡 Connecting resume bus on channel '{}'", config.bus.channel);
            Arc::new(PgResumeBus::connect(url, &config.bus.channel).await?)
        }
        None => {
            tracing::info!("📡 Using in-process resume bus");
            Arc::new(LocalResumeBus::new())
        }
    };
    let hub = Arc::new(SuspensionHub::new(bus));
    Arc::clone(&hub).listen().await?;

    let mut runs =
        RunManager::new(Arc::clone(&registry), Arc::clone(&hub), &config.runs).with_records(Arc::clone(&records));
    let mut worker_queue = None;
    if config.queue.enabled {
        tracing::info!("📦 Initializing job queue (max {} attempts)", config.queue.max_attempts);
        let queue = SqliteJobQueue::new(pool.clone(), config.queue.max_attempts);
        queue.init_schema().await.context("Failed to initialize job queue")?;
        let queue: Arc<dyn JobQueue> = Arc::new(queue);
        runs = runs.with_queue(Arc::clone(&queue));
        worker_queue = Some(queue);
    }
    let runs = Arc::new(runs);

    let worker = worker_queue.map(|queue| {
        QueueWorker::new(
            Arc::clone(&runs),
            queue,
            Arc::clone(&records),
            config.queue.poll_interval(),
        )
    });

    tracing::info!("⏰ Initializing trigger manager and cron source");
    let triggers = Arc::new(TriggerManager::new(Arc::clone(&runs)));
    let scheduler = Arc::new(CronTriggerSource::new(Arc::clone(&triggers)).await?);
    scheduler.start().await?;

    let state = AppState {
        runs,
        triggers,
        scheduler,
        records: Some(records),
    };

    tracing::info!("📡 Creating HTTP router with all endpoints");
    let router = Router::new()
        .route("/healthz", get(health_check))
        .merge(create_run_routes())
        .merge(create_webhook_routes())
        .with_state(state.clone());

    tracing::info!("✅ Application initialized successfully");
    Ok(App { router, state, worker })
}

/// Start the HTTP server with the given configuration
///
/// Logging honours `RUST_LOG` and defaults to `info`.
pub async fn start_server(config: Config) -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .with_thread_ids(true)
        .with_level(true)
        .init();

    tracing::info!("Starting Mechaflow server...");

    let App { router, state, worker } = create_app(config.clone()).await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let worker_handle = worker.map(|worker| tokio::spawn(worker.run(shutdown_rx)));

    let bind_addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = TcpListener::bind(&bind_addr).await?;
    tracing::info!("Server listening on http://{}", bind_addr);

    axum::serve(listener, router.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("⏹️ Shutting down");
    let _ = shutdown_tx.send(true);
    if let Some(handle) = worker_handle {
        let _ = handle.await;
    }
    if let Err(e) = state.scheduler.stop().await {
        tracing::warn!("⚠️ Cron trigger source did not stop cleanly: {}", e);
    }
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("❌ Failed to listen for shutdown signal: {}", e);
    }
}

async fn health_check() -> &'static str {
    "ok"
}
