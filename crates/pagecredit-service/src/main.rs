//! pagecredit service entry point.

use std::sync::Arc;
use std::time::Duration;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use pagecredit_service::config::StoreBackend;
use pagecredit_service::jobs::{HttpProcessor, NoopProcessor, Processor};
use pagecredit_service::{create_router, AppState, ServiceConfig};
use pagecredit_store::{MemoryStore, PgStore, Store};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,pagecredit=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting pagecredit service");

    let config = ServiceConfig::from_env();

    tracing::info!(
        listen_addr = %config.listen_addr,
        instance_id = %config.instance_id,
        store_backend = ?config.store_backend,
        rate_limit_backend = ?config.rate_limit_backend,
        processor_configured = config.processor_url.is_some(),
        plans = config.pricing.plans.len(),
        "Service configuration loaded"
    );

    let store = open_store(&config).await?;
    let processor = build_processor(&config)?;

    let state = Arc::new(AppState::new(store, config.clone(), processor));
    state.spawn_background_tasks();

    let resumed = state.jobs.resume_incomplete().await?;
    if resumed > 0 {
        tracing::info!(resumed, "Resumed unfinished jobs");
    }

    let app = create_router(Arc::clone(&state));

    tracing::info!(listen_addr = %config.listen_addr, "Starting HTTP server");
    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

async fn open_store(config: &ServiceConfig) -> Result<Arc<dyn Store>, Box<dyn std::error::Error>> {
    match config.store_backend {
        StoreBackend::Memory => {
            tracing::warn!("Using in-memory store - all data is lost on restart");
            Ok(Arc::new(MemoryStore::new()))
        }
        StoreBackend::Postgres => {
            let url = config
                .database_url
                .as_deref()
                .ok_or("DATABASE_URL is required for the postgres backend")?;
            tracing::info!("Connecting to PostgreSQL");
            Ok(Arc::new(
                PgStore::connect(url, config.database_max_connections).await?,
            ))
        }
        StoreBackend::RocksDb => open_rocks(config),
    }
}

#[cfg(feature = "rocksdb-backend")]
fn open_rocks(config: &ServiceConfig) -> Result<Arc<dyn Store>, Box<dyn std::error::Error>> {
    tracing::info!(path = %config.data_dir, "Opening RocksDB store");
    Ok(Arc::new(pagecredit_store::RocksStore::open(&config.data_dir)?))
}

#[cfg(not(feature = "rocksdb-backend"))]
fn open_rocks(_config: &ServiceConfig) -> Result<Arc<dyn Store>, Box<dyn std::error::Error>> {
    Err("STORE_BACKEND=rocksdb requires building with the rocksdb-backend feature".into())
}

fn build_processor(config: &ServiceConfig) -> Result<Arc<dyn Processor>, Box<dyn std::error::Error>> {
    match &config.processor_url {
        Some(url) => {
            tracing::info!(url = %url, "Using HTTP processing engine");
            Ok(Arc::new(HttpProcessor::new(
                url.clone(),
                Duration::from_secs(config.processor_timeout_seconds),
            )?))
        }
        None => {
            tracing::warn!("PROCESSOR_URL not configured - files are not actually processed");
            Ok(Arc::new(NoopProcessor))
        }
    }
}
