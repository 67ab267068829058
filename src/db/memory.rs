use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::info;

use crate::db::store::{DocumentStore, StoreQuery, ACTIVE_STATUSES};
use crate::error::{AppError, Result};
use crate::types::MarketDocument;

/// Process-local store with the same semantics as `SqliteStore`.
/// Selected with `STORE_BACKEND=memory`; documents do not survive a restart.
#[derive(Default)]
pub struct MemoryStore {
    docs: DashMap<String, MarketDocument>,
    closed: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(AppError::store("store is closed", false));
        }
        Ok(())
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn fingerprints(&self, tickers: &[String]) -> Result<HashMap<String, String>> {
        self.ensure_open()?;
        Ok(tickers
            .iter()
            .filter_map(|t| self.docs.get(t).map(|d| (t.clone(), d.fingerprint.clone())))
            .collect())
    }

    async fn get(&self, ticker: &str) -> Result<Option<MarketDocument>> {
        self.ensure_open()?;
        Ok(self.docs.get(ticker).map(|d| d.value().clone()))
    }

    async fn upsert_batch(&self, docs: &[MarketDocument]) -> Result<()> {
        self.ensure_open()?;
        for doc in docs {
            let mut doc = doc.clone();
            if let Some(existing) = self.docs.get(doc.ticker()) {
                doc.created_at = existing.created_at;
            }
            self.docs.insert(doc.market.ticker.clone(), doc);
        }
        Ok(())
    }

    async fn query(&self, query: &StoreQuery) -> Result<Vec<MarketDocument>> {
        self.ensure_open()?;
        let mut out: Vec<MarketDocument> = self
            .docs
            .iter()
            .filter(|d| query.status.as_ref().map_or(true, |s| &d.market.status == s))
            .filter(|d| query.event_ticker.as_ref().map_or(true, |e| &d.market.event_ticker == e))
            .map(|d| d.value().clone())
            .collect();
        out.sort_by(|a, b| a.market.ticker.cmp(&b.market.ticker));
        out.truncate(query.limit);
        Ok(out)
    }

    async fn stale_active_tickers(&self, cutoff: DateTime<Utc>, limit: usize) -> Result<Vec<String>> {
        self.ensure_open()?;
        let mut stale: Vec<(DateTime<Utc>, String)> = self
            .docs
            .iter()
            .filter(|d| ACTIVE_STATUSES.contains(&d.market.status.as_str()))
            .filter(|d| d.last_synced_at < cutoff)
            .map(|d| (d.last_synced_at, d.key().clone()))
            .collect();
        stale.sort();
        Ok(stale.into_iter().take(limit).map(|(_, t)| t).collect())
    }

    async fn count(&self) -> Result<u64> {
        self.ensure_open()?;
        Ok(self.docs.len() as u64)
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            info!(documents = self.docs.len(), "Memory store closed");
        }
    }
}
