use std::sync::Arc;

use futures_util::stream::{self, StreamExt};
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::config::{Config, RetryPolicy};
use crate::db::store::DocumentStore;
use crate::retry::with_backoff;
use crate::types::MarketDocument;

/// A batch that could not be written. Its documents are untouched in the store.
#[derive(Debug, Clone, Serialize)]
pub struct BatchFailure {
    pub batch: usize,
    pub tickers: Vec<String>,
    pub attempts: u32,
    pub error: String,
}

#[derive(Debug, Default)]
pub struct WriteReport {
    /// Tickers whose batch committed.
    pub written: Vec<String>,
    pub failures: Vec<BatchFailure>,
    /// Store calls made across all batches, retries included.
    pub attempts: u32,
}

impl WriteReport {
    pub fn failed_items(&self) -> usize {
        self.failures.iter().map(|f| f.tickers.len()).sum()
    }
}

/// Chunks documents into batches and writes them with bounded concurrency.
/// Each batch retries transient store failures on its own backoff timer; a
/// failed batch never stops the others.
pub struct BulkSyncWriter {
    store: Arc<dyn DocumentStore>,
    batch_size: usize,
    concurrency: usize,
    retry: RetryPolicy,
}

impl BulkSyncWriter {
    pub fn new(store: Arc<dyn DocumentStore>, batch_size: usize, concurrency: usize, retry: RetryPolicy) -> Self {
        Self {
            store,
            batch_size: batch_size.max(1),
            concurrency: concurrency.max(1),
            retry,
        }
    }

    pub fn from_config(store: Arc<dyn DocumentStore>, cfg: &Config) -> Self {
        Self::new(store, cfg.batch_size, cfg.write_concurrency, cfg.retry.clone())
    }

    /// Write `docs`. Batches not yet started when `cancel` flips to true are
    /// reported as failures and never submitted.
    pub async fn write(&self, docs: Vec<MarketDocument>, cancel: &watch::Receiver<bool>) -> WriteReport {
        let batches: Vec<Vec<MarketDocument>> =
            docs.chunks(self.batch_size).map(|c| c.to_vec()).collect();
        let total = batches.len();

        let results: Vec<BatchResult> = stream::iter(batches.into_iter().enumerate())
            .map(|(idx, batch)| self.write_batch(idx, batch, cancel))
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        let mut report = WriteReport::default();
        for r in results {
            match r {
                BatchResult::Written { tickers, attempts } => {
                    report.attempts += attempts;
                    report.written.extend(tickers);
                }
                BatchResult::Failed(failure) => {
                    report.attempts += failure.attempts;
                    report.failures.push(failure);
                }
            }
        }
        report.failures.sort_by_key(|f| f.batch);

        debug!(
            batches = total,
            written = report.written.len(),
            failed_batches = report.failures.len(),
            "Bulk write finished"
        );
        report
    }

    async fn write_batch(
        &self,
        idx: usize,
        batch: Vec<MarketDocument>,
        cancel: &watch::Receiver<bool>,
    ) -> BatchResult {
        let tickers: Vec<String> = batch.iter().map(|d| d.ticker().to_string()).collect();

        if *cancel.borrow() {
            return BatchResult::Failed(BatchFailure {
                batch: idx,
                tickers,
                attempts: 0,
                error: "cancelled before submission".to_string(),
            });
        }

        let label = format!("batch-{idx}");
        let (result, attempts) =
            with_backoff(&self.retry, &label, || self.store.upsert_batch(&batch)).await;

        match result {
            Ok(()) => BatchResult::Written { tickers, attempts },
            Err(e) => {
                warn!(batch = idx, items = tickers.len(), attempts, "Batch write failed: {e}");
                BatchResult::Failed(BatchFailure { batch: idx, tickers, attempts, error: e.to_string() })
            }
        }
    }
}

enum BatchResult {
    Written { tickers: Vec<String>, attempts: u32 },
    Failed(BatchFailure),
}
