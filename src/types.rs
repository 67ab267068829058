use std::collections::BTreeMap;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::AppError;

// ---------------------------------------------------------------------------
// Market
// ---------------------------------------------------------------------------

/// One upstream market listing. `ticker` is the identity; every other field is
/// mutable upstream state and feeds the fingerprint.
///
/// Prices are integer cents, volumes integer contracts. Numeric fields must be
/// JSON numbers: an item carrying `"yes_bid": "12"` fails to deserialize and is
/// rejected by the fetcher. The `*_dollars` fields are the upstream's decimal
/// strings and are kept verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Market {
    pub ticker: String,
    pub event_ticker: String,
    #[serde(default)]
    pub series_ticker: Option<String>,
    #[serde(default)]
    pub market_type: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub subtitle: String,
    #[serde(default)]
    pub yes_sub_title: String,
    #[serde(default)]
    pub no_sub_title: String,
    pub status: String,
    #[serde(default)]
    pub yes_bid: i64,
    #[serde(default)]
    pub yes_ask: i64,
    #[serde(default)]
    pub no_bid: i64,
    #[serde(default)]
    pub no_ask: i64,
    #[serde(default)]
    pub last_price: i64,
    #[serde(default)]
    pub previous_price: i64,
    #[serde(default)]
    pub previous_yes_bid: i64,
    #[serde(default)]
    pub previous_yes_ask: i64,
    #[serde(default)]
    pub volume: i64,
    #[serde(default)]
    pub volume_24h: i64,
    #[serde(default)]
    pub open_interest: i64,
    #[serde(default)]
    pub liquidity: i64,
    #[serde(default)]
    pub notional_value: i64,
    #[serde(default)]
    pub tick_size: i64,
    #[serde(default)]
    pub result: String,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub can_close_early: bool,
    #[serde(default)]
    pub open_time: Option<DateTime<Utc>>,
    pub close_time: DateTime<Utc>,
    #[serde(default)]
    pub expiration_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub latest_expiration_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub settlement_timer_seconds: i64,
    #[serde(default)]
    pub response_price_units: String,
    #[serde(default)]
    pub notional_value_dollars: String,
    #[serde(default)]
    pub yes_bid_dollars: String,
    #[serde(default)]
    pub yes_ask_dollars: String,
    #[serde(default)]
    pub no_bid_dollars: String,
    #[serde(default)]
    pub no_ask_dollars: String,
    #[serde(default)]
    pub last_price_dollars: String,
    #[serde(default)]
    pub previous_yes_bid_dollars: String,
    #[serde(default)]
    pub previous_yes_ask_dollars: String,
    #[serde(default)]
    pub previous_price_dollars: String,
    #[serde(default)]
    pub liquidity_dollars: String,
    #[serde(default)]
    pub expiration_value: String,
    #[serde(default)]
    pub risk_limit_cents: i64,
    #[serde(default)]
    pub rules_primary: String,
    #[serde(default)]
    pub rules_secondary: String,
    /// Absent until the market settles.
    #[serde(default)]
    pub settlement_value: Option<i64>,
    #[serde(default)]
    pub settlement_value_dollars: String,
    #[serde(default)]
    pub price_level_structure: String,
    /// Each range as the upstream sends it, e.g. `{"start", "end", "step"}`.
    #[serde(default)]
    pub price_ranges: Vec<BTreeMap<String, String>>,
}

// ---------------------------------------------------------------------------
// Filters and pages
// ---------------------------------------------------------------------------

/// Status values accepted by the upstream `status` query parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusFilter {
    Unopened,
    Open,
    Closed,
    Settled,
}

impl std::fmt::Display for StatusFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            StatusFilter::Unopened => "unopened",
            StatusFilter::Open => "open",
            StatusFilter::Closed => "closed",
            StatusFilter::Settled => "settled",
        };
        write!(f, "{s}")
    }
}

impl FromStr for StatusFilter {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "unopened" => Ok(StatusFilter::Unopened),
            "open" => Ok(StatusFilter::Open),
            "closed" => Ok(StatusFilter::Closed),
            "settled" => Ok(StatusFilter::Settled),
            other => Err(AppError::Config(format!("unknown market status filter: {other}"))),
        }
    }
}

/// Filter passed verbatim to every page request of one walk. Built once per
/// cycle and never mutated afterwards.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MarketFilter {
    pub statuses: Vec<StatusFilter>,
    pub event_ticker: Option<String>,
    pub series_ticker: Option<String>,
    pub tickers: Vec<String>,
    /// Epoch seconds.
    pub min_close_ts: Option<i64>,
    /// Epoch seconds.
    pub max_close_ts: Option<i64>,
}

impl MarketFilter {
    /// Markets with the given statuses closing inside `[now, now + window]`.
    pub fn closing_within(now: DateTime<Utc>, window: Duration, statuses: Vec<StatusFilter>) -> Self {
        let window_secs = i64::try_from(window.as_secs()).unwrap_or(i64::MAX);
        let now_ts = now.timestamp();
        Self {
            statuses,
            min_close_ts: Some(now_ts),
            max_close_ts: Some(now_ts.saturating_add(window_secs)),
            ..Self::default()
        }
    }

    pub fn for_tickers(tickers: Vec<String>) -> Self {
        Self { tickers, ..Self::default() }
    }

    pub fn with_event_ticker(mut self, event_ticker: Option<String>) -> Self {
        self.event_ticker = event_ticker;
        self
    }

    pub fn with_series_ticker(mut self, series_ticker: Option<String>) -> Self {
        self.series_ticker = series_ticker;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRequest {
    pub filter: MarketFilter,
    pub cursor: Option<String>,
    pub limit: u32,
}

#[derive(Debug, Clone, Default)]
pub struct PageResult {
    pub markets: Vec<Market>,
    /// `None` once the walk is exhausted.
    pub next_cursor: Option<String>,
    /// Items dropped because they failed typed parsing.
    pub rejected: usize,
}

// ---------------------------------------------------------------------------
// Change detection
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Classification {
    /// No stored record for this ticker.
    Create,
    /// Stored fingerprint differs.
    Update,
    /// Stored fingerprint identical; no write.
    Unchanged,
}

/// Stored form of a market: business fields plus sync bookkeeping. Written as
/// one unit so the fingerprint and `last_synced_at` land together with the data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketDocument {
    pub market: Market,
    pub fingerprint: String,
    pub last_synced_at: DateTime<Utc>,
    /// Preserved by the store on update; set on first insert.
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl MarketDocument {
    pub fn new(market: Market, fingerprint: String, synced_at: DateTime<Utc>) -> Self {
        Self {
            market,
            fingerprint,
            last_synced_at: synced_at,
            created_at: synced_at,
            updated_at: synced_at,
        }
    }

    pub fn ticker(&self) -> &str {
        &self.market.ticker
    }
}

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    Success,
    /// Some batches failed or the cycle was cancelled part-way.
    Partial,
    Failure,
}

impl std::fmt::Display for OutcomeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            OutcomeStatus::Success => "success",
            OutcomeStatus::Partial => "partial",
            OutcomeStatus::Failure => "failure",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerSource {
    /// First tick of the periodic loop, fired as soon as it starts.
    Startup,
    Timer,
    Manual,
}

impl std::fmt::Display for TriggerSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TriggerSource::Startup => write!(f, "startup"),
            TriggerSource::Timer => write!(f, "timer"),
            TriggerSource::Manual => write!(f, "manual"),
        }
    }
}

/// Summary of one cycle. Produced exactly once per cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncOutcome {
    pub trigger: TriggerSource,
    pub seen: usize,
    pub created: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub failed: usize,
    pub stale_refreshed: usize,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub status: OutcomeStatus,
    pub error: Option<String>,
}

impl SyncOutcome {
    /// Blank outcome opened at cycle start; finalized by the scheduler.
    pub fn begin(trigger: TriggerSource, started_at: DateTime<Utc>) -> Self {
        Self {
            trigger,
            seen: 0,
            created: 0,
            updated: 0,
            unchanged: 0,
            failed: 0,
            stale_refreshed: 0,
            started_at,
            finished_at: started_at,
            duration_ms: 0,
            status: OutcomeStatus::Success,
            error: None,
        }
    }

    pub fn written(&self) -> usize {
        self.created + self.updated
    }
}

// ---------------------------------------------------------------------------
// Scheduler state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerState {
    Idle,
    Running,
    Stopping,
    Stopped,
}

impl std::fmt::Display for SchedulerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SchedulerState::Idle => "idle",
            SchedulerState::Running => "running",
            SchedulerState::Stopping => "stopping",
            SchedulerState::Stopped => "stopped",
        };
        write!(f, "{s}")
    }
}

/// What to do with a trigger that fires while a cycle is still running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerPolicy {
    /// Skip it and log the skip. Keeps a slow upstream from building a backlog.
    Drop,
    /// Wait for the running cycle, then run.
    Queue,
}

impl FromStr for TriggerPolicy {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "drop" => Ok(TriggerPolicy::Drop),
            "queue" => Ok(TriggerPolicy::Queue),
            other => Err(AppError::Config(format!("trigger policy must be drop|queue, got {other}"))),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStatus {
    pub state: SchedulerState,
    pub interval_secs: u64,
    pub trigger_policy: TriggerPolicy,
    pub cycles_run: u64,
    pub cycles_skipped: u64,
    pub cycle_in_progress: bool,
    pub last_outcome: Option<SyncOutcome>,
}
