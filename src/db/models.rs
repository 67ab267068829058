/// Database row types matching `migrations/0001_market_documents.sql`.
/// Timestamps are stored as epoch milliseconds.
use chrono::{DateTime, Utc};

use crate::error::{AppError, Result};
use crate::types::{Market, MarketDocument};

#[derive(Debug, sqlx::FromRow)]
pub struct MarketDocumentRow {
    pub ticker: String,
    pub fingerprint: String,
    pub body: String,
    pub created_at: i64,
    pub updated_at: i64,
    pub last_synced_at: i64,
}

impl MarketDocumentRow {
    pub fn into_document(self) -> Result<MarketDocument> {
        let market: Market = serde_json::from_str(&self.body).map_err(|e| {
            AppError::store(format!("corrupt document body for {}: {e}", self.ticker), false)
        })?;
        Ok(MarketDocument {
            market,
            fingerprint: self.fingerprint,
            last_synced_at: from_millis(self.last_synced_at)?,
            created_at: from_millis(self.created_at)?,
            updated_at: from_millis(self.updated_at)?,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
pub struct FingerprintRow {
    pub ticker: String,
    pub fingerprint: String,
}

#[derive(Debug, sqlx::FromRow)]
pub struct EngineEventRow {
    pub event_name: String,
    pub project: String,
    pub timestamp: i64,
    pub metadata: String,
}

pub fn to_millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

pub fn from_millis(ms: i64) -> Result<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp_millis(ms)
        .ok_or_else(|| AppError::store(format!("timestamp out of range: {ms}"), false))
}
