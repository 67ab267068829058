use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use futures_util::StreamExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::aggregator::{fetch_all, fetch_pages};
use crate::api::latency::LatencyStats;
use crate::config::{Config, STALE_SCAN_LIMIT, STALE_TICKERS_PER_REQUEST};
use crate::db::{BulkSyncWriter, DocumentStore};
use crate::detector::classify;
use crate::error::{AppError, Result};
use crate::events::{EngineEvent, EventSink, EVENT_SYNC_SKIPPED};
use crate::fetcher::MarketSource;
use crate::types::{
    Classification, Market, MarketDocument, MarketFilter, OutcomeStatus, SchedulerState,
    SchedulerStatus, SyncOutcome, TriggerPolicy, TriggerSource,
};

/// Drives sync cycles on a fixed interval or on demand.
///
/// At most one cycle runs at a time. A trigger that arrives while a cycle is
/// running is dropped (and counted) or queued behind it, per `TriggerPolicy`.
/// `stop()` flips a cancellation flag that the cycle checks between pages and
/// before each write batch; in-flight requests always complete.
pub struct SyncScheduler {
    cfg: Config,
    source: Arc<dyn MarketSource>,
    store: Arc<dyn DocumentStore>,
    writer: BulkSyncWriter,
    events: Arc<dyn EventSink>,
    latency: Arc<LatencyStats>,
    inner: Mutex<Inner>,
    /// Held for the whole of a cycle.
    cycle_guard: tokio::sync::Mutex<()>,
    /// Mirrors the guard for `status()`, which must not touch the lock.
    cycle_running: AtomicBool,
    cancel_tx: watch::Sender<bool>,
    loop_handle: Mutex<Option<JoinHandle<()>>>,
    released: AtomicBool,
}

struct Inner {
    state: SchedulerState,
    cycles_run: u64,
    cycles_skipped: u64,
    last_outcome: Option<SyncOutcome>,
}

/// Markets of one cycle, de-duplicated by ticker. A repeated ticker keeps its
/// first position and takes the latest content.
#[derive(Default)]
struct Collected {
    markets: Vec<Market>,
    index: HashMap<String, usize>,
}

impl Collected {
    fn push(&mut self, market: Market) {
        match self.index.get(&market.ticker) {
            Some(&i) => self.markets[i] = market,
            None => {
                self.index.insert(market.ticker.clone(), self.markets.len());
                self.markets.push(market);
            }
        }
    }

    fn contains(&self, ticker: &str) -> bool {
        self.index.contains_key(ticker)
    }
}

impl SyncScheduler {
    pub fn new(
        cfg: Config,
        source: Arc<dyn MarketSource>,
        store: Arc<dyn DocumentStore>,
        events: Arc<dyn EventSink>,
        latency: Arc<LatencyStats>,
    ) -> Arc<Self> {
        let writer = BulkSyncWriter::from_config(Arc::clone(&store), &cfg);
        let (cancel_tx, _) = watch::channel(false);
        Arc::new(Self {
            cfg,
            source,
            store,
            writer,
            events,
            latency,
            inner: Mutex::new(Inner {
                state: SchedulerState::Idle,
                cycles_run: 0,
                cycles_skipped: 0,
                last_outcome: None,
            }),
            cycle_guard: tokio::sync::Mutex::new(()),
            cycle_running: AtomicBool::new(false),
            cancel_tx,
            loop_handle: Mutex::new(None),
            released: AtomicBool::new(false),
        })
    }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn is_cancelled(&self) -> bool {
        *self.cancel_tx.borrow()
    }

    // -----------------------------------------------------------------------
    // Control surface
    // -----------------------------------------------------------------------

    /// Idle -> Running. Spawns the periodic loop; its first tick fires at once.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        self.cfg.target.validate()?;
        if self.cfg.crawl_interval.is_zero() {
            return Err(AppError::Config("crawl interval must be at least one minute".to_string()));
        }

        {
            let mut inner = self.inner();
            if inner.state != SchedulerState::Idle {
                return Err(AppError::InvalidState(format!("cannot start from {}", inner.state)));
            }
            inner.state = SchedulerState::Running;
        }

        let this = Arc::clone(self);
        let handle = tokio::spawn(async move { this.run_loop().await });
        *self.loop_handle.lock().unwrap_or_else(|p| p.into_inner()) = Some(handle);

        info!(
            project = %self.cfg.target.project,
            collection = %self.cfg.target.collection,
            interval_secs = self.cfg.crawl_interval.as_secs(),
            policy = ?self.cfg.trigger_policy,
            "Sync scheduler started"
        );
        Ok(())
    }

    /// Running -> Stopping -> Stopped (or Idle -> Stopped). Waits for the loop
    /// and any in-flight cycle, then releases the source and store. Calling it
    /// again is a no-op.
    pub async fn stop(&self) {
        {
            let mut inner = self.inner();
            match inner.state {
                SchedulerState::Stopping | SchedulerState::Stopped => return,
                SchedulerState::Idle => inner.state = SchedulerState::Stopped,
                SchedulerState::Running => inner.state = SchedulerState::Stopping,
            }
        }
        info!("Sync scheduler stopping");
        self.cancel_tx.send_replace(true);

        let handle = self.loop_handle.lock().unwrap_or_else(|p| p.into_inner()).take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!("Sync loop ended abnormally: {e}");
            }
        }

        // Wait out a manual cycle that may still hold the guard.
        drop(self.cycle_guard.lock().await);
        self.release().await;

        self.inner().state = SchedulerState::Stopped;
        info!("Sync scheduler stopped");
    }

    /// One cycle now, bypassing the timer. Allowed while idle or running.
    pub async fn run_once(&self) -> Result<SyncOutcome> {
        self.ensure_accepting()?;
        self.guarded_cycle(TriggerSource::Manual).await
    }

    /// Fire-and-forget `run_once`, for the control API.
    pub fn trigger(self: &Arc<Self>) -> Result<()> {
        self.ensure_accepting()?;
        let this = Arc::clone(self);
        tokio::spawn(async move {
            match this.guarded_cycle(TriggerSource::Manual).await {
                Ok(_) | Err(AppError::CycleInProgress) => {}
                Err(e) => warn!("Triggered sync not run: {e}"),
            }
        });
        Ok(())
    }

    pub fn status(&self) -> SchedulerStatus {
        let cycle_in_progress = self.cycle_running.load(Ordering::SeqCst);
        let inner = self.inner();
        SchedulerStatus {
            state: inner.state,
            interval_secs: self.cfg.crawl_interval.as_secs(),
            trigger_policy: self.cfg.trigger_policy,
            cycles_run: inner.cycles_run,
            cycles_skipped: inner.cycles_skipped,
            cycle_in_progress,
            last_outcome: inner.last_outcome.clone(),
        }
    }

    fn ensure_accepting(&self) -> Result<()> {
        match self.inner().state {
            SchedulerState::Idle | SchedulerState::Running => Ok(()),
            other => Err(AppError::InvalidState(format!("scheduler is {other}"))),
        }
    }

    // -----------------------------------------------------------------------
    // Loop and guard
    // -----------------------------------------------------------------------

    async fn run_loop(self: Arc<Self>) {
        let mut cancel = self.cancel_tx.subscribe();
        let mut ticker = interval(self.cfg.crawl_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // The first tick completes immediately.
        let mut trigger = TriggerSource::Startup;

        loop {
            if *cancel.borrow() {
                break;
            }
            tokio::select! {
                _ = ticker.tick() => {}
                _ = cancel.changed() => break,
            }
            if *cancel.borrow() {
                break;
            }

            match self.guarded_cycle(trigger).await {
                Ok(_) | Err(AppError::CycleInProgress) => {}
                Err(e) => warn!("Scheduled sync not run: {e}"),
            }
            trigger = TriggerSource::Timer;
        }
        debug!("Sync loop exited");
    }

    async fn guarded_cycle(&self, trigger: TriggerSource) -> Result<SyncOutcome> {
        let _guard = match self.cfg.trigger_policy {
            TriggerPolicy::Drop => match self.cycle_guard.try_lock() {
                Ok(guard) => guard,
                Err(_) => {
                    self.record_skip(trigger);
                    return Err(AppError::CycleInProgress);
                }
            },
            TriggerPolicy::Queue => self.cycle_guard.lock().await,
        };

        if self.is_cancelled() {
            return Err(AppError::InvalidState("scheduler is stopping".to_string()));
        }

        self.cycle_running.store(true, Ordering::SeqCst);
        let outcome = self.run_cycle(trigger).await;
        self.cycle_running.store(false, Ordering::SeqCst);

        let mut inner = self.inner();
        inner.cycles_run += 1;
        inner.last_outcome = Some(outcome.clone());
        Ok(outcome)
    }

    fn record_skip(&self, trigger: TriggerSource) {
        let skipped = {
            let mut inner = self.inner();
            inner.cycles_skipped += 1;
            inner.cycles_skipped
        };
        info!(trigger = %trigger, skipped, "Sync trigger skipped: a cycle is already in progress");
        self.events.emit(EngineEvent::new(
            EVENT_SYNC_SKIPPED,
            &self.cfg.target.project,
            serde_json::json!({ "trigger": trigger, "cycles_skipped": skipped }),
        ));
    }

    async fn release(&self) {
        if !self.released.swap(true, Ordering::SeqCst) {
            self.source.close().await;
            self.store.close().await;
        }
    }

    // -----------------------------------------------------------------------
    // Cycle
    // -----------------------------------------------------------------------

    async fn run_cycle(&self, trigger: TriggerSource) -> SyncOutcome {
        let clock = Instant::now();
        let mut outcome = SyncOutcome::begin(trigger, Utc::now());
        let cancel = self.cancel_tx.subscribe();

        info!(trigger = %trigger, "Market sync starting");

        if let Err(e) = self.sync(&mut outcome, &cancel).await {
            outcome.status = OutcomeStatus::Failure;
            outcome.error = Some(e.to_string());
        }

        let elapsed = clock.elapsed();
        outcome.finished_at = Utc::now();
        outcome.duration_ms = elapsed.as_millis() as u64;
        self.latency.record(elapsed);

        match outcome.status {
            OutcomeStatus::Failure => error!(
                trigger = %trigger,
                seen = outcome.seen,
                duration_ms = outcome.duration_ms,
                "Market sync failed: {}",
                outcome.error.as_deref().unwrap_or("unknown error"),
            ),
            status => info!(
                trigger = %trigger,
                status = %status,
                seen = outcome.seen,
                created = outcome.created,
                updated = outcome.updated,
                unchanged = outcome.unchanged,
                failed = outcome.failed,
                written = outcome.written(),
                stale_refreshed = outcome.stale_refreshed,
                duration_ms = outcome.duration_ms,
                "Market sync {status}: +{} created, ~{} updated, {} unchanged, {} failed",
                outcome.created,
                outcome.updated,
                outcome.unchanged,
                outcome.failed,
            ),
        }

        self.events.emit(EngineEvent::from_outcome(&self.cfg.target.project, &outcome));
        outcome
    }

    /// Fetch, classify, write. An `Err` here is a failed cycle; batch failures
    /// and stale-refresh problems are recorded on `outcome` instead.
    async fn sync(&self, outcome: &mut SyncOutcome, cancel: &watch::Receiver<bool>) -> Result<()> {
        let now = Utc::now();
        let window = Duration::from_secs(self.cfg.close_window_hours.saturating_mul(3600));
        let filter = MarketFilter::closing_within(now, window, self.cfg.statuses.clone())
            .with_event_ticker(self.cfg.event_ticker.clone())
            .with_series_ticker(self.cfg.series_ticker.clone());

        let mut collected = Collected::default();
        let mut notes: Vec<String> = Vec::new();
        let mut cancelled = false;

        {
            let pages = fetch_pages(self.source.as_ref(), filter, self.cfg.page_size);
            futures_util::pin_mut!(pages);
            while let Some(page) = pages.next().await {
                let page = page?;
                outcome.seen += page.markets.len();
                for market in page.markets {
                    collected.push(market);
                }
                if *cancel.borrow() {
                    cancelled = true;
                    break;
                }
            }
        }

        if !cancelled {
            if let Some(stale_after) = self.cfg.stale_after {
                self.refresh_stale(stale_after, &mut collected, outcome, &mut notes, cancel).await;
            }
        }

        let tickers: Vec<String> = collected.markets.iter().map(|m| m.ticker.clone()).collect();
        let stored = self.store.fingerprints(&tickers).await?;

        let synced_at = Utc::now();
        let mut classes: HashMap<String, Classification> = HashMap::with_capacity(tickers.len());
        let mut docs = Vec::new();
        for market in collected.markets {
            let (class, fp) = classify(&market, stored.get(&market.ticker).map(String::as_str));
            classes.insert(market.ticker.clone(), class);
            match class {
                Classification::Unchanged => outcome.unchanged += 1,
                Classification::Create | Classification::Update => {
                    docs.push(MarketDocument::new(market, fp, synced_at));
                }
            }
        }

        let pending = docs.len();
        let report = self.writer.write(docs, cancel).await;

        for ticker in &report.written {
            match classes.get(ticker) {
                Some(Classification::Create) => outcome.created += 1,
                Some(Classification::Update) => outcome.updated += 1,
                _ => {}
            }
        }
        outcome.failed = report.failed_items();

        if cancelled || report.failures.iter().any(|f| f.attempts == 0) {
            cancelled = true;
            notes.push("cancelled by stop".to_string());
        }
        if let Some(first) = report.failures.iter().find(|f| f.attempts > 0) {
            notes.push(format!(
                "{} of {} batches failed (first: batch {} after {} attempts: {})",
                report.failures.len(),
                pending.div_ceil(self.cfg.batch_size.max(1)),
                first.batch,
                first.attempts,
                first.error,
            ));
        }

        outcome.status = if !report.failures.is_empty() && report.written.is_empty() && !cancelled {
            OutcomeStatus::Failure
        } else if !report.failures.is_empty() || cancelled {
            OutcomeStatus::Partial
        } else {
            OutcomeStatus::Success
        };
        if !notes.is_empty() {
            outcome.error = Some(notes.join("; "));
        }
        Ok(())
    }

    /// Re-fetch active markets the store has not seen for `stale_after`,
    /// skipping anything the main walk already returned.
    async fn refresh_stale(
        &self,
        stale_after: Duration,
        collected: &mut Collected,
        outcome: &mut SyncOutcome,
        notes: &mut Vec<String>,
        cancel: &watch::Receiver<bool>,
    ) {
        let cutoff = match chrono::Duration::from_std(stale_after) {
            Ok(age) => Utc::now() - age,
            Err(_) => return,
        };

        let stale = match self.store.stale_active_tickers(cutoff, STALE_SCAN_LIMIT).await {
            Ok(tickers) => tickers,
            Err(e) => {
                warn!("Stale market scan failed: {e}");
                notes.push(format!("stale scan failed: {e}"));
                return;
            }
        };
        let stale: Vec<String> = stale.into_iter().filter(|t| !collected.contains(t)).collect();
        if stale.is_empty() {
            return;
        }
        debug!(count = stale.len(), "Refreshing stale markets");

        for chunk in stale.chunks(STALE_TICKERS_PER_REQUEST) {
            if *cancel.borrow() {
                return;
            }
            let filter = MarketFilter::for_tickers(chunk.to_vec());
            let markets = fetch_all(self.source.as_ref(), filter, self.cfg.page_size);
            futures_util::pin_mut!(markets);
            while let Some(item) = markets.next().await {
                match item {
                    Ok(market) => {
                        if !collected.contains(&market.ticker) {
                            outcome.stale_refreshed += 1;
                        }
                        collected.push(market);
                    }
                    Err(e) => {
                        warn!(tickers = chunk.len(), "Stale market refresh failed: {e}");
                        notes.push(format!("stale refresh failed: {e}"));
                        break;
                    }
                }
            }
        }

        if outcome.stale_refreshed > 0 {
            info!(refreshed = outcome.stale_refreshed, "Stale markets refreshed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator::tests::{market, ScriptedSource};
    use crate::config::{RetryPolicy, StoreTarget};
    use crate::db::memory::MemoryStore;
    use crate::db::writer::tests::FlakyStore;
    use crate::detector::fingerprint;
    use crate::events::{EVENT_SYNC_COMPLETED, EVENT_SYNC_FAILED};
    use crate::types::{PageRequest, PageResult};
    use async_trait::async_trait;
    use tokio::sync::Semaphore;

    #[derive(Default)]
    struct RecordingSink {
        events: Mutex<Vec<EngineEvent>>,
    }

    impl RecordingSink {
        fn names(&self) -> Vec<String> {
            self.events.lock().unwrap().iter().map(|e| e.name.clone()).collect()
        }
    }

    impl EventSink for RecordingSink {
        fn emit(&self, event: EngineEvent) {
            self.events.lock().unwrap().push(event);
        }
    }

    /// Blocks every fetch until a permit is released.
    struct GatedSource {
        inner: ScriptedSource,
        gate: Semaphore,
    }

    #[async_trait]
    impl MarketSource for GatedSource {
        async fn fetch_page(&self, request: &PageRequest) -> Result<PageResult> {
            let _permit = self.gate.acquire().await.unwrap();
            self.inner.fetch_page(request).await
        }
    }

    /// Main walk returns `listed`; ticker-filtered requests return `by_ticker`.
    struct SplitSource {
        listed: Vec<Market>,
        by_ticker: Vec<Market>,
        ticker_requests: Mutex<Vec<Vec<String>>>,
    }

    #[async_trait]
    impl MarketSource for SplitSource {
        async fn fetch_page(&self, request: &PageRequest) -> Result<PageResult> {
            let markets = if request.filter.tickers.is_empty() {
                self.listed.clone()
            } else {
                self.ticker_requests.lock().unwrap().push(request.filter.tickers.clone());
                self.by_ticker
                    .iter()
                    .filter(|m| request.filter.tickers.contains(&m.ticker))
                    .cloned()
                    .collect()
            };
            Ok(PageResult { markets, next_cursor: None, rejected: 0 })
        }
    }

    fn cfg() -> Config {
        Config {
            target: StoreTarget { project: "proj".into(), collection: "markets".into() },
            crawl_interval: Duration::from_secs(60),
            stale_after: None,
            retry: RetryPolicy {
                max_attempts: 2,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(5),
                jitter: false,
            },
            ..Config::default()
        }
    }

    fn build(
        cfg: Config,
        source: Arc<dyn MarketSource>,
        store: Arc<dyn DocumentStore>,
    ) -> (Arc<SyncScheduler>, Arc<RecordingSink>) {
        let sink = Arc::new(RecordingSink::default());
        let latency = Arc::new(LatencyStats::new().unwrap());
        let scheduler = SyncScheduler::new(cfg, source, store, sink.clone(), latency);
        (scheduler, sink)
    }

    async fn wait_until(cond: impl Fn() -> bool) {
        for _ in 0..2_000 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn second_identical_run_writes_nothing() {
        let source = Arc::new(ScriptedSource::default().page("", &["A", "B"], None));
        let store = Arc::new(FlakyStore::default());
        let (scheduler, sink) = build(cfg(), source, store.clone());

        let first = scheduler.run_once().await.unwrap();
        assert_eq!((first.created, first.updated, first.unchanged), (2, 0, 0));
        assert_eq!(first.status, OutcomeStatus::Success);

        let second = scheduler.run_once().await.unwrap();
        assert_eq!((second.created, second.updated, second.unchanged), (0, 0, 2));
        assert_eq!(second.status, OutcomeStatus::Success);
        assert_eq!(store.upsert_calls.load(Ordering::SeqCst), 1);

        assert_eq!(sink.names(), vec![EVENT_SYNC_COMPLETED, EVENT_SYNC_COMPLETED]);
        let status = scheduler.status();
        assert_eq!(status.cycles_run, 2);
        assert_eq!(status.last_outcome.unwrap().unchanged, 2);
    }

    #[tokio::test]
    async fn unchanged_market_is_never_written() {
        let source = Arc::new(ScriptedSource::default().page("", &["T1"], None));
        let store = Arc::new(FlakyStore::default());
        let m = market("T1");
        let fp = fingerprint(&m);
        store.inner.upsert_batch(&[MarketDocument::new(m, fp, Utc::now())]).await.unwrap();
        let (scheduler, _) = build(cfg(), source, store.clone());

        let outcome = scheduler.run_once().await.unwrap();

        assert_eq!(outcome.unchanged, 1);
        assert_eq!(outcome.written(), 0);
        assert_eq!(store.upsert_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn changed_fingerprint_is_an_update() {
        let source = Arc::new(ScriptedSource::default().page("", &["T1"], None));
        let store = Arc::new(MemoryStore::new());
        let seeded = Utc::now() - chrono::Duration::hours(1);
        store.upsert_batch(&[MarketDocument::new(market("T1"), "h1".into(), seeded)]).await.unwrap();
        let (scheduler, _) = build(cfg(), source, store.clone());

        let outcome = scheduler.run_once().await.unwrap();

        assert_eq!((outcome.created, outcome.updated), (0, 1));
        let doc = store.get("T1").await.unwrap().unwrap();
        assert_eq!(doc.fingerprint, fingerprint(&market("T1")));
        assert_eq!(doc.created_at, seeded);
        assert!(doc.last_synced_at > seeded);
    }

    #[tokio::test]
    async fn upstream_error_on_page_two_fails_the_cycle() {
        let source = Arc::new(
            ScriptedSource::default().page("", &["A", "B"], Some("P2")).failing("P2"),
        );
        let store = Arc::new(MemoryStore::new());
        let (scheduler, sink) = build(cfg(), source, store.clone());

        let outcome = scheduler.run_once().await.unwrap();

        assert_eq!(outcome.status, OutcomeStatus::Failure);
        assert_eq!(outcome.seen, 2);
        assert!(outcome.error.as_deref().unwrap().contains("500"));
        assert_eq!(store.count().await.unwrap(), 0);
        assert_eq!(sink.names(), vec![EVENT_SYNC_FAILED]);
    }

    #[tokio::test]
    async fn duplicate_tickers_are_written_once() {
        let source = Arc::new(
            ScriptedSource::default()
                .page("", &["A", "B"], Some("P2"))
                .page("P2", &["A"], None),
        );
        let store = Arc::new(MemoryStore::new());
        let (scheduler, _) = build(cfg(), source, store.clone());

        let outcome = scheduler.run_once().await.unwrap();

        assert_eq!(outcome.seen, 3);
        assert_eq!(outcome.created, 2);
        assert_eq!(store.count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn failed_batch_leaves_other_batches_written() {
        let source = Arc::new(ScriptedSource::default().page("", &["A", "B", "C", "D"], None));
        let store = Arc::new(FlakyStore::failing_permanently(&["B"]));
        let (scheduler, _) = build(Config { batch_size: 2, ..cfg() }, source, store.clone());

        let outcome = scheduler.run_once().await.unwrap();

        assert_eq!(outcome.status, OutcomeStatus::Partial);
        assert_eq!(outcome.created, 2);
        assert_eq!(outcome.failed, 2);
        assert!(outcome.error.as_deref().unwrap().contains("batch 0"));
        assert!(store.get("C").await.unwrap().is_some());
        assert!(store.get("A").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn batch_exhausting_transient_retries_does_not_stop_later_batches() {
        let source = Arc::new(ScriptedSource::default().page("", &["A", "B", "C", "D"], None));
        let store = Arc::new(FlakyStore::failing_transiently("B", 10));
        let (scheduler, _) = build(Config { batch_size: 1, ..cfg() }, source, store.clone());

        let outcome = scheduler.run_once().await.unwrap();

        assert_eq!(outcome.status, OutcomeStatus::Partial);
        assert_eq!((outcome.created, outcome.failed), (3, 1));
        let error = outcome.error.as_deref().unwrap();
        assert!(error.contains("batch 1 after 2 attempts"), "{error}");
        assert!(error.contains("locked"), "{error}");
        assert_eq!(store.upsert_calls.load(Ordering::SeqCst), 5);
        for ticker in ["A", "C", "D"] {
            assert!(store.get(ticker).await.unwrap().is_some(), "{ticker} not written");
        }
        assert!(store.get("B").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn every_batch_failing_is_a_failure() {
        let source = Arc::new(ScriptedSource::default().page("", &["A", "B"], None));
        let store = Arc::new(FlakyStore::failing_permanently(&["A", "B"]));
        let (scheduler, _) = build(Config { batch_size: 1, ..cfg() }, source, store);

        let outcome = scheduler.run_once().await.unwrap();

        assert_eq!(outcome.status, OutcomeStatus::Failure);
        assert_eq!(outcome.failed, 2);
        assert_eq!(outcome.written(), 0);
    }

    #[tokio::test]
    async fn stale_active_markets_are_refetched_by_ticker() {
        let store = Arc::new(MemoryStore::new());
        let old = Utc::now() - chrono::Duration::hours(2);
        store
            .upsert_batch(&[
                MarketDocument::new(market("OLD"), "h-old".into(), old),
                MarketDocument::new(market("A"), "h-a".into(), old),
            ])
            .await
            .unwrap();

        let source = Arc::new(SplitSource {
            listed: vec![market("A")],
            by_ticker: vec![market("OLD")],
            ticker_requests: Mutex::new(Vec::new()),
        });
        let cfg = Config { stale_after: Some(Duration::from_secs(300)), ..cfg() };
        let (scheduler, _) = build(cfg, source.clone(), store.clone());

        let outcome = scheduler.run_once().await.unwrap();

        assert_eq!(outcome.stale_refreshed, 1);
        assert_eq!(outcome.updated, 2);
        assert_eq!(*source.ticker_requests.lock().unwrap(), vec![vec!["OLD".to_string()]]);
        assert!(store.get("OLD").await.unwrap().unwrap().last_synced_at > old);
    }

    #[tokio::test]
    async fn start_requires_a_project() {
        let mut cfg = cfg();
        cfg.target.project = String::new();
        let source = Arc::new(ScriptedSource::default());
        let (scheduler, _) = build(cfg, source, Arc::new(MemoryStore::new()));

        assert!(matches!(scheduler.start(), Err(AppError::Config(_))));
        assert_eq!(scheduler.status().state, SchedulerState::Idle);
    }

    #[tokio::test]
    async fn stop_twice_is_a_no_op() {
        let source = Arc::new(ScriptedSource::default().page("", &["A"], None));
        let store = Arc::new(MemoryStore::new());
        let (scheduler, _) = build(cfg(), source, store.clone());

        scheduler.start().unwrap();
        assert!(matches!(scheduler.start(), Err(AppError::InvalidState(_))));
        scheduler.stop().await;
        scheduler.stop().await;

        assert_eq!(scheduler.status().state, SchedulerState::Stopped);
        assert!(matches!(scheduler.run_once().await, Err(AppError::InvalidState(_))));
        assert!(scheduler.trigger().is_err());
        assert!(store.count().await.is_err(), "store released on stop");
    }

    #[tokio::test]
    async fn stop_before_start_goes_straight_to_stopped() {
        let (scheduler, _) =
            build(cfg(), Arc::new(ScriptedSource::default()), Arc::new(MemoryStore::new()));
        scheduler.stop().await;
        assert_eq!(scheduler.status().state, SchedulerState::Stopped);
        assert!(matches!(scheduler.start(), Err(AppError::InvalidState(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn periodic_loop_runs_on_interval() {
        let source = Arc::new(ScriptedSource::default().page("", &["A"], None));
        let (scheduler, _) = build(cfg(), source.clone(), Arc::new(MemoryStore::new()));

        scheduler.start().unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        let first = scheduler.status().last_outcome.unwrap();
        assert_eq!(first.trigger, TriggerSource::Startup);

        tokio::time::sleep(Duration::from_secs(129)).await;
        let status = scheduler.status();
        assert!(status.cycles_run >= 3);
        assert_eq!(status.last_outcome.unwrap().trigger, TriggerSource::Timer);
        scheduler.stop().await;
        let calls = source.calls();
        tokio::time::sleep(Duration::from_secs(300)).await;
        assert_eq!(source.calls(), calls, "no cycles after stop");
    }

    #[tokio::test]
    async fn overlapping_trigger_is_dropped_and_counted() {
        let source = Arc::new(GatedSource {
            inner: ScriptedSource::default().page("", &["A"], None),
            gate: Semaphore::new(0),
        });
        let (scheduler, sink) = build(cfg(), source.clone(), Arc::new(MemoryStore::new()));

        let running = {
            let s = Arc::clone(&scheduler);
            tokio::spawn(async move { s.run_once().await })
        };
        wait_until(|| scheduler.status().cycle_in_progress).await;

        assert!(matches!(scheduler.run_once().await, Err(AppError::CycleInProgress)));
        assert_eq!(scheduler.status().cycles_skipped, 1);
        assert!(sink.names().contains(&EVENT_SYNC_SKIPPED.to_string()));

        source.gate.add_permits(1);
        let outcome = running.await.unwrap().unwrap();
        assert_eq!(outcome.created, 1);
        assert_eq!(scheduler.status().cycles_run, 1);
    }

    #[tokio::test]
    async fn queue_policy_runs_after_current_cycle() {
        let source = Arc::new(GatedSource {
            inner: ScriptedSource::default().page("", &["A"], None),
            gate: Semaphore::new(0),
        });
        let cfg = Config { trigger_policy: TriggerPolicy::Queue, ..cfg() };
        let (scheduler, _) = build(cfg, source.clone(), Arc::new(MemoryStore::new()));

        let first = {
            let s = Arc::clone(&scheduler);
            tokio::spawn(async move { s.run_once().await })
        };
        wait_until(|| scheduler.status().cycle_in_progress).await;
        let second = {
            let s = Arc::clone(&scheduler);
            tokio::spawn(async move { s.run_once().await })
        };

        source.gate.add_permits(1);
        assert_eq!(first.await.unwrap().unwrap().created, 1);
        assert_eq!(second.await.unwrap().unwrap().unchanged, 1);
        assert_eq!(scheduler.status().cycles_skipped, 0);
    }

    #[tokio::test]
    async fn stop_mid_cycle_finishes_request_and_skips_remaining_work() {
        // Page two is never scripted: fetching it would panic the source.
        let source = Arc::new(GatedSource {
            inner: ScriptedSource::default().page("", &["A", "B"], Some("P2")),
            gate: Semaphore::new(0),
        });
        let store = Arc::new(MemoryStore::new());
        let (scheduler, _) = build(cfg(), source.clone(), store.clone());

        let running = {
            let s = Arc::clone(&scheduler);
            tokio::spawn(async move { s.run_once().await })
        };
        wait_until(|| scheduler.status().cycle_in_progress).await;

        let stopping = {
            let s = Arc::clone(&scheduler);
            tokio::spawn(async move { s.stop().await })
        };
        wait_until(|| scheduler.is_cancelled()).await;
        source.gate.add_permits(1);

        let outcome = running.await.unwrap().unwrap();
        stopping.await.unwrap();

        assert_eq!(outcome.status, OutcomeStatus::Partial);
        assert_eq!(outcome.seen, 2);
        assert_eq!(outcome.failed, 2);
        assert_eq!(outcome.written(), 0);
        assert_eq!(source.inner.calls(), 1);
        assert_eq!(scheduler.status().state, SchedulerState::Stopped);
    }

    #[tokio::test]
    async fn trigger_runs_in_background() {
        let source = Arc::new(ScriptedSource::default().page("", &["A"], None));
        let (scheduler, _) = build(cfg(), source, Arc::new(MemoryStore::new()));

        scheduler.trigger().unwrap();
        wait_until(|| scheduler.status().cycles_run == 1).await;
        assert_eq!(scheduler.status().last_outcome.unwrap().trigger, TriggerSource::Manual);
    }
}
