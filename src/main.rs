mod aggregator;
mod api;
mod config;
mod db;
mod detector;
mod error;
mod events;
mod fetcher;
mod rate_limiter;
mod retry;
mod scheduler;
mod types;

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::api::{router, ApiState, LatencyStats};
use crate::config::{Config, RunMode, StoreBackend, CHANNEL_CAPACITY};
use crate::db::{DocumentStore, MemoryStore, SqliteStore};
use crate::error::Result;
use crate::events::{EventLog, EventPublisher, EventSink, EventWriter, MemoryEventLog, SqliteEventLog};
use crate::fetcher::{MarketSource, PagedFetcher};
use crate::scheduler::SyncScheduler;
use crate::types::OutcomeStatus;

const EVENT_FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() {
    let cfg = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Config error: {e}");
            std::process::exit(1);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(&cfg.log_level))
        .init();

    match run(cfg).await {
        Ok(true) => {}
        Ok(false) => std::process::exit(2),
        Err(e) => {
            error!("Fatal error: {e}");
            std::process::exit(1);
        }
    }
}

/// Returns false when a one-shot cycle did not succeed.
async fn run(cfg: Config) -> Result<bool> {
    cfg.target.validate()?;

    // --- Store and event sink ---
    let mut event_writer = None;
    let (store, sink, event_log): (Arc<dyn DocumentStore>, Arc<dyn EventSink>, Arc<dyn EventLog>) =
        match cfg.store_backend {
            StoreBackend::Sqlite => {
                let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", cfg.db_path))?
                    .create_if_missing(true)
                    .journal_mode(SqliteJournalMode::Wal);

                let pool = SqlitePoolOptions::new().connect_with(options.clone()).await?;
                sqlx::migrate!("./migrations").run(&pool).await?;
                info!("Database ready at {}", cfg.db_path);

                // Events get their own pool so they keep flowing while the
                // scheduler closes the document store.
                let events_pool = SqlitePoolOptions::new()
                    .max_connections(1)
                    .connect_with(options)
                    .await?;
                let (publisher, events_rx) = EventPublisher::channel(CHANNEL_CAPACITY);
                let writer = EventWriter::new(events_pool.clone(), events_rx);
                event_writer = Some(tokio::spawn(async move { writer.run().await }));

                let store: Arc<dyn DocumentStore> =
                    Arc::new(SqliteStore::new(pool, cfg.target.collection.clone()));
                let sink: Arc<dyn EventSink> = Arc::new(publisher);
                let log: Arc<dyn EventLog> = Arc::new(SqliteEventLog::new(events_pool));
                (store, sink, log)
            }
            StoreBackend::Memory => {
                warn!("STORE_BACKEND=memory: synced markets are not persisted");
                let memory_log = Arc::new(MemoryEventLog::new(CHANNEL_CAPACITY));
                let store: Arc<dyn DocumentStore> = Arc::new(MemoryStore::new());
                let sink: Arc<dyn EventSink> = memory_log.clone();
                let log: Arc<dyn EventLog> = memory_log;
                (store, sink, log)
            }
        };

    // --- Upstream client ---
    let source: Arc<dyn MarketSource> = Arc::new(PagedFetcher::new(&cfg)?);
    info!(
        api_url = %cfg.api_url,
        rate_limit = cfg.rate_limit_per_sec,
        page_size = cfg.page_size,
        "Upstream client ready"
    );

    let latency = Arc::new(LatencyStats::new()?);
    let scheduler = SyncScheduler::new(
        cfg.clone(),
        source,
        Arc::clone(&store),
        sink,
        Arc::clone(&latency),
    );

    if cfg.run_mode == RunMode::Once {
        let result = scheduler.run_once().await;
        scheduler.stop().await;
        flush_events(scheduler, event_writer).await;
        return Ok(result?.status == OutcomeStatus::Success);
    }

    scheduler.start()?;

    // HTTP API server
    let api_state = ApiState { scheduler: Arc::clone(&scheduler), store, events: event_log, latency };
    let app = router(api_state);
    let bind_addr = format!("0.0.0.0:{}", cfg.api_port);
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!("HTTP API listening on {bind_addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    scheduler.stop().await;
    flush_events(scheduler, event_writer).await;
    Ok(true)
}

/// Drop the last publisher handle and let the writer drain what is queued.
async fn flush_events(scheduler: Arc<SyncScheduler>, writer: Option<JoinHandle<()>>) {
    drop(scheduler);
    if let Some(handle) = writer {
        match tokio::time::timeout(EVENT_FLUSH_TIMEOUT, handle).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("Event writer ended abnormally: {e}"),
            Err(_) => warn!("Event writer did not drain within {EVENT_FLUSH_TIMEOUT:?}"),
        }
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {e}");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
