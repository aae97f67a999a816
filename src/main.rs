use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

use studiobook::booking::BookingService;
use studiobook::catalog::StaticCatalog;
use studiobook::config::{Config, StorageKind};
use studiobook::engine::{Engine, EngineConfig};
use studiobook::http::{self, AppState};
use studiobook::notify::NotifyHub;
use studiobook::payment::PaymentService;
use studiobook::store::postgres::PgStore;
use studiobook::store::{BookingRepository, PaymentRepository};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("studiobook=info")),
        )
        .init();

    let config = Config::from_env()?;
    studiobook::observability::init(config.metrics_port)?;

    let catalog = match &config.catalog_path {
        Some(path) => StaticCatalog::load(path)?,
        None => {
            tracing::warn!("STUDIOBOOK_CATALOG not set, starting with an empty catalog");
            StaticCatalog::new()
        }
    };
    info!("catalog: {} rooms", catalog.room_count());

    // Kept for compaction on shutdown.
    let mut engine: Option<Arc<Engine>> = None;
    let (bookings_repo, payments_repo): (Arc<dyn BookingRepository>, Arc<dyn PaymentRepository>) =
        match config.storage {
            StorageKind::Embedded => {
                std::fs::create_dir_all(&config.data_dir)?;
                let e = Arc::new(Engine::new(
                    config.wal_path(),
                    EngineConfig {
                        lock_timeout: config.lock_timeout,
                        compact_threshold: config.compact_threshold,
                    },
                )?);
                engine = Some(e.clone());
                let bookings: Arc<dyn BookingRepository> = e.clone();
                let payments: Arc<dyn PaymentRepository> = e;
                (bookings, payments)
            }
            StorageKind::Postgres => {
                let url = config.database_url.as_deref().unwrap_or_default();
                let store = Arc::new(
                    PgStore::connect(url, config.db_max_connections, config.lock_timeout).await?,
                );
                let bookings: Arc<dyn BookingRepository> = store.clone();
                let payments: Arc<dyn PaymentRepository> = store;
                (bookings, payments)
            }
        };

    let hub = Arc::new(NotifyHub::new());
    let bookings = Arc::new(BookingService::new(
        bookings_repo,
        Arc::new(catalog),
        hub,
        config.storage_timeout,
    ));
    let payments = Arc::new(PaymentService::new(
        payments_repo,
        bookings.clone(),
        config.gateway.clone(),
        config.storage_timeout,
    ));
    let app = http::router(AppState { bookings, payments }, config.request_timeout);

    let addr = format!("{}:{}", config.bind, config.port);
    let listener = TcpListener::bind(&addr).await?;
    info!("studiobook listening on {addr}");
    info!("  storage: {:?}", config.storage);
    info!("  data_dir: {}", config.data_dir.display());
    info!("  payment test mode: {}", config.gateway.test_mode);
    info!(
        "  metrics: {}",
        config
            .metrics_port
            .map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics"))
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    if let Some(engine) = engine {
        info!("compacting WAL before exit");
        if let Err(e) = engine.compact_wal().await {
            tracing::error!("WAL compaction failed: {e}");
        }
    }
    info!("studiobook stopped");
    Ok(())
}

/// Resolves on ctrl-c or SIGTERM. In-flight requests drain before `serve` returns.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("failed to listen for ctrl-c: {e}");
        }
    };
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                tracing::error!("failed to register SIGTERM handler: {e}");
                ctrl_c.await;
            }
        }
    }
    #[cfg(not(unix))]
    ctrl_c.await;
    info!("shutdown signal received");
}
