use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};

use crate::api::latency::{LatencyStats, LatencySummary};
use crate::db::{DocumentStore, StoreQuery};
use crate::error::AppError;
use crate::events::{EngineEvent, EventLog};
use crate::scheduler::SyncScheduler;
use crate::types::{MarketDocument, SchedulerStatus, SyncOutcome};

const DEFAULT_MARKETS_LIMIT: usize = 100;
const MAX_MARKETS_LIMIT: usize = 1000;
const DEFAULT_EVENTS_LIMIT: usize = 50;
const MAX_EVENTS_LIMIT: usize = 500;

#[derive(Clone)]
pub struct ApiState {
    pub scheduler: Arc<SyncScheduler>,
    pub store: Arc<dyn DocumentStore>,
    pub events: Arc<dyn EventLog>,
    pub latency: Arc<LatencyStats>,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/status", get(get_status))
        .route("/sync/run", post(post_sync_run))
        .route("/sync/trigger", post(post_sync_trigger))
        .route("/sync/stop", post(post_sync_stop))
        .route("/markets", get(get_markets))
        .route("/markets/:ticker", get(get_market))
        .route("/events/recent", get(get_recent_events))
        .route("/stats/latency", get(get_stats_latency))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Query param structs
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
pub struct MarketsQuery {
    pub status: Option<String>,
    pub event_ticker: Option<String>,
    pub limit: Option<usize>,
}

#[derive(Deserialize)]
pub struct RecentEventsQuery {
    pub limit: Option<usize>,
}

// ---------------------------------------------------------------------------
// Response types
// ---------------------------------------------------------------------------

#[derive(Serialize)]
pub struct StatusResponse {
    #[serde(flatten)]
    pub scheduler: SchedulerStatus,
    pub stored_markets: u64,
}

#[derive(Serialize)]
pub struct AcceptedResponse {
    pub accepted: bool,
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn get_status(State(state): State<ApiState>) -> Result<Json<StatusResponse>, AppError> {
    let scheduler = state.scheduler.status();
    // The store is released once the scheduler stops.
    let stored_markets = state.store.count().await.unwrap_or(0);
    Ok(Json(StatusResponse { scheduler, stored_markets }))
}

async fn post_sync_run(State(state): State<ApiState>) -> Result<Json<SyncOutcome>, AppError> {
    let outcome = state.scheduler.run_once().await?;
    Ok(Json(outcome))
}

async fn post_sync_trigger(
    State(state): State<ApiState>,
) -> Result<(StatusCode, Json<AcceptedResponse>), AppError> {
    state.scheduler.trigger()?;
    Ok((StatusCode::ACCEPTED, Json(AcceptedResponse { accepted: true })))
}

async fn post_sync_stop(State(state): State<ApiState>) -> Json<SchedulerStatus> {
    state.scheduler.stop().await;
    Json(state.scheduler.status())
}

async fn get_markets(
    State(state): State<ApiState>,
    Query(params): Query<MarketsQuery>,
) -> Result<Json<Vec<MarketDocument>>, AppError> {
    let limit = params.limit.unwrap_or(DEFAULT_MARKETS_LIMIT);
    if limit == 0 || limit > MAX_MARKETS_LIMIT {
        return Err(AppError::Validation(format!(
            "limit must be between 1 and {MAX_MARKETS_LIMIT}, got {limit}"
        )));
    }

    let query = StoreQuery {
        status: params.status.filter(|s| !s.is_empty()),
        event_ticker: params.event_ticker.filter(|s| !s.is_empty()),
        limit,
    };
    Ok(Json(state.store.query(&query).await?))
}

async fn get_market(
    State(state): State<ApiState>,
    Path(ticker): Path<String>,
) -> Result<(StatusCode, Json<serde_json::Value>), AppError> {
    match state.store.get(&ticker).await? {
        Some(doc) => Ok((StatusCode::OK, Json(serde_json::to_value(doc)?))),
        None => Ok((
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "error": format!("market {ticker} not found") })),
        )),
    }
}

async fn get_recent_events(
    State(state): State<ApiState>,
    Query(params): Query<RecentEventsQuery>,
) -> Result<Json<Vec<EngineEvent>>, AppError> {
    let limit = params.limit.unwrap_or(DEFAULT_EVENTS_LIMIT).clamp(1, MAX_EVENTS_LIMIT);
    Ok(Json(state.events.recent(limit).await?))
}

async fn get_stats_latency(State(state): State<ApiState>) -> Json<LatencySummary> {
    Json(state.latency.summary())
}
