//! Engine events: one structured record per cycle outcome, delivered
//! fire-and-forget so a slow or broken sink never stalls the scheduler.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::db::models::{from_millis, to_millis, EngineEventRow};
use crate::error::{store_error, Result};
use crate::types::{OutcomeStatus, SyncOutcome};

pub const EVENT_SYNC_COMPLETED: &str = "market_sync_completed";
pub const EVENT_SYNC_FAILED: &str = "market_sync_failed";
pub const EVENT_SYNC_SKIPPED: &str = "market_sync_skipped";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineEvent {
    pub name: String,
    pub project: String,
    pub timestamp: DateTime<Utc>,
    pub metadata: Value,
}

impl EngineEvent {
    pub fn new(name: &str, project: &str, metadata: Value) -> Self {
        Self {
            name: name.to_string(),
            project: project.to_string(),
            timestamp: Utc::now(),
            metadata,
        }
    }

    /// Completed for success and partial outcomes, failed otherwise.
    pub fn from_outcome(project: &str, outcome: &SyncOutcome) -> Self {
        let name = match outcome.status {
            OutcomeStatus::Failure => EVENT_SYNC_FAILED,
            OutcomeStatus::Success | OutcomeStatus::Partial => EVENT_SYNC_COMPLETED,
        };
        let metadata = serde_json::to_value(outcome).unwrap_or(Value::Null);
        Self { timestamp: outcome.finished_at, ..Self::new(name, project, metadata) }
    }
}

/// Receives engine events. Must return without waiting on delivery.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: EngineEvent);
}

/// Read side for the control API.
#[async_trait]
pub trait EventLog: Send + Sync {
    /// Newest first.
    async fn recent(&self, limit: usize) -> Result<Vec<EngineEvent>>;
}

// ---------------------------------------------------------------------------
// Channel-backed publisher + SQLite writer task
// ---------------------------------------------------------------------------

pub struct EventPublisher {
    tx: mpsc::Sender<EngineEvent>,
}

impl EventPublisher {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<EngineEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

impl EventSink for EventPublisher {
    fn emit(&self, event: EngineEvent) {
        if let Err(e) = self.tx.try_send(event) {
            warn!("Event channel unavailable, dropping event: {e}");
        }
    }
}

/// Persists published events to `engine_events`. Runs as a dedicated task.
pub struct EventWriter {
    pool: sqlx::SqlitePool,
    rx: mpsc::Receiver<EngineEvent>,
}

impl EventWriter {
    pub fn new(pool: sqlx::SqlitePool, rx: mpsc::Receiver<EngineEvent>) -> Self {
        Self { pool, rx }
    }

    /// Drains until every publisher is dropped.
    pub async fn run(mut self) {
        while let Some(event) = self.rx.recv().await {
            if let Err(e) = self.write_event(&event).await {
                error!(event = %event.name, "Event write error: {e}");
            }
        }
    }

    async fn write_event(&self, event: &EngineEvent) -> Result<()> {
        let metadata = serde_json::to_string(&event.metadata)?;
        sqlx::query(
            "INSERT INTO engine_events (event_name, project, timestamp, metadata) VALUES (?, ?, ?, ?)",
        )
        .bind(&event.name)
        .bind(&event.project)
        .bind(to_millis(event.timestamp))
        .bind(metadata)
        .execute(&self.pool)
        .await
        .map_err(store_error)?;
        Ok(())
    }
}

pub struct SqliteEventLog {
    pool: sqlx::SqlitePool,
}

impl SqliteEventLog {
    pub fn new(pool: sqlx::SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl EventLog for SqliteEventLog {
    async fn recent(&self, limit: usize) -> Result<Vec<EngineEvent>> {
        let rows: Vec<EngineEventRow> = sqlx::query_as(
            r#"
            SELECT event_name, project, timestamp, metadata
            FROM engine_events
            ORDER BY timestamp DESC, id DESC
            LIMIT ?
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(store_error)?;

        rows.into_iter()
            .map(|r| {
                Ok(EngineEvent {
                    name: r.event_name,
                    project: r.project,
                    timestamp: from_millis(r.timestamp)?,
                    metadata: serde_json::from_str(&r.metadata)?,
                })
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// In-process sink for STORE_BACKEND=memory
// ---------------------------------------------------------------------------

/// Keeps the newest `capacity` events in memory and mirrors each to the log.
pub struct MemoryEventLog {
    events: Mutex<VecDeque<EngineEvent>>,
    capacity: usize,
}

impl MemoryEventLog {
    pub fn new(capacity: usize) -> Self {
        Self { events: Mutex::new(VecDeque::new()), capacity: capacity.max(1) }
    }
}

impl EventSink for MemoryEventLog {
    fn emit(&self, event: EngineEvent) {
        info!(event = %event.name, project = %event.project, metadata = %event.metadata, "Engine event");
        if let Ok(mut events) = self.events.lock() {
            if events.len() == self.capacity {
                events.pop_front();
            }
            events.push_back(event);
        }
    }
}

#[async_trait]
impl EventLog for MemoryEventLog {
    async fn recent(&self, limit: usize) -> Result<Vec<EngineEvent>> {
        let events = match self.events.lock() {
            Ok(events) => events,
            Err(poisoned) => poisoned.into_inner(),
        };
        Ok(events.iter().rev().take(limit).cloned().collect())
    }
}
