use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{QueryBuilder, Sqlite, SqlitePool};
use tracing::{debug, info};

use crate::db::models::{to_millis, FingerprintRow, MarketDocumentRow};
use crate::error::{store_error, Result};
use crate::types::MarketDocument;

/// Statuses still worth a stale re-fetch. `settled` and `determined` are
/// included so a market's final result lands after it stops trading.
pub const ACTIVE_STATUSES: [&str; 5] = ["initialized", "active", "open", "settled", "determined"];

/// Tickers per `IN (...)` list; keeps well under SQLite's bind limit.
const IN_CHUNK: usize = 500;

/// Equality filters for reading documents back out.
#[derive(Debug, Clone, Default)]
pub struct StoreQuery {
    pub status: Option<String>,
    pub event_ticker: Option<String>,
    pub limit: usize,
}

/// Persistent document store keyed by ticker within one collection.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Stored fingerprints for whichever of `tickers` exist.
    async fn fingerprints(&self, tickers: &[String]) -> Result<HashMap<String, String>>;

    async fn get(&self, ticker: &str) -> Result<Option<MarketDocument>>;

    /// Upsert all documents atomically. `created_at` of existing records is kept.
    async fn upsert_batch(&self, docs: &[MarketDocument]) -> Result<()>;

    async fn query(&self, query: &StoreQuery) -> Result<Vec<MarketDocument>>;

    /// Active-status tickers last synced before `cutoff`, oldest first.
    async fn stale_active_tickers(&self, cutoff: DateTime<Utc>, limit: usize) -> Result<Vec<String>>;

    async fn count(&self) -> Result<u64>;

    async fn close(&self);
}

pub struct SqliteStore {
    pool: SqlitePool,
    collection: String,
    closed: AtomicBool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool, collection: impl Into<String>) -> Self {
        Self { pool, collection: collection.into(), closed: AtomicBool::new(false) }
    }
}

#[async_trait]
impl DocumentStore for SqliteStore {
    async fn fingerprints(&self, tickers: &[String]) -> Result<HashMap<String, String>> {
        let mut found = HashMap::with_capacity(tickers.len());

        for chunk in tickers.chunks(IN_CHUNK) {
            let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
                "SELECT ticker, fingerprint FROM market_documents WHERE collection = ",
            );
            qb.push_bind(self.collection.as_str());
            qb.push(" AND ticker IN (");
            let mut list = qb.separated(", ");
            for t in chunk {
                list.push_bind(t.as_str());
            }
            list.push_unseparated(")");

            let rows = qb
                .build_query_as::<FingerprintRow>()
                .fetch_all(&self.pool)
                .await
                .map_err(store_error)?;
            found.extend(rows.into_iter().map(|r| (r.ticker, r.fingerprint)));
        }

        debug!(requested = tickers.len(), found = found.len(), "Fingerprint lookup");
        Ok(found)
    }

    async fn get(&self, ticker: &str) -> Result<Option<MarketDocument>> {
        let row: Option<MarketDocumentRow> = sqlx::query_as(
            r#"
            SELECT ticker, fingerprint, body, created_at, updated_at, last_synced_at
            FROM market_documents
            WHERE collection = ? AND ticker = ?
            "#,
        )
        .bind(&self.collection)
        .bind(ticker)
        .fetch_optional(&self.pool)
        .await
        .map_err(store_error)?;

        row.map(MarketDocumentRow::into_document).transpose()
    }

    async fn upsert_batch(&self, docs: &[MarketDocument]) -> Result<()> {
        if docs.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await.map_err(store_error)?;

        for doc in docs {
            let m = &doc.market;
            let body = serde_json::to_string(m)?;

            sqlx::query(
                r#"
                INSERT INTO market_documents (
                    collection, ticker, event_ticker, series_ticker, status, close_ts,
                    fingerprint, body, created_at, updated_at, last_synced_at
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(collection, ticker) DO UPDATE SET
                    event_ticker   = excluded.event_ticker,
                    series_ticker  = excluded.series_ticker,
                    status         = excluded.status,
                    close_ts       = excluded.close_ts,
                    fingerprint    = excluded.fingerprint,
                    body           = excluded.body,
                    updated_at     = excluded.updated_at,
                    last_synced_at = excluded.last_synced_at
                "#,
            )
            .bind(&self.collection)
            .bind(&m.ticker)
            .bind(&m.event_ticker)
            .bind(&m.series_ticker)
            .bind(&m.status)
            .bind(m.close_time.timestamp())
            .bind(&doc.fingerprint)
            .bind(body)
            .bind(to_millis(doc.created_at))
            .bind(to_millis(doc.updated_at))
            .bind(to_millis(doc.last_synced_at))
            .execute(&mut *tx)
            .await
            .map_err(store_error)?;
        }

        tx.commit().await.map_err(store_error)?;
        Ok(())
    }

    async fn query(&self, query: &StoreQuery) -> Result<Vec<MarketDocument>> {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
            "SELECT ticker, fingerprint, body, created_at, updated_at, last_synced_at \
             FROM market_documents WHERE collection = ",
        );
        qb.push_bind(self.collection.as_str());
        if let Some(status) = &query.status {
            qb.push(" AND status = ").push_bind(status.as_str());
        }
        if let Some(ev) = &query.event_ticker {
            qb.push(" AND event_ticker = ").push_bind(ev.as_str());
        }
        qb.push(" ORDER BY ticker LIMIT ").push_bind(query.limit as i64);

        let rows = qb
            .build_query_as::<MarketDocumentRow>()
            .fetch_all(&self.pool)
            .await
            .map_err(store_error)?;

        rows.into_iter().map(MarketDocumentRow::into_document).collect()
    }

    async fn stale_active_tickers(&self, cutoff: DateTime<Utc>, limit: usize) -> Result<Vec<String>> {
        let mut qb: QueryBuilder<Sqlite> =
            QueryBuilder::new("SELECT ticker FROM market_documents WHERE collection = ");
        qb.push_bind(self.collection.as_str());
        qb.push(" AND status IN (");
        let mut list = qb.separated(", ");
        for s in ACTIVE_STATUSES {
            list.push_bind(s);
        }
        list.push_unseparated(")");
        qb.push(" AND last_synced_at < ").push_bind(to_millis(cutoff));
        qb.push(" ORDER BY last_synced_at LIMIT ").push_bind(limit as i64);

        qb.build_query_scalar::<String>()
            .fetch_all(&self.pool)
            .await
            .map_err(store_error)
    }

    async fn count(&self) -> Result<u64> {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM market_documents WHERE collection = ?")
            .bind(&self.collection)
            .fetch_one(&self.pool)
            .await
            .map_err(store_error)?;
        Ok(n.max(0) as u64)
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.pool.close().await;
            info!(collection = %self.collection, "Document store closed");
        }
    }
}
