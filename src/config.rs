use std::str::FromStr;
use std::time::Duration;

use crate::error::{AppError, Result};
use crate::types::{StatusFilter, TriggerPolicy};

pub const KALSHI_API_URL: &str = "https://api.elections.kalshi.com/trade-api/v2";

/// Documented upstream ceiling for unauthenticated reads (requests per second).
pub const DEFAULT_RATE_LIMIT_PER_SEC: f64 = 20.0;

/// Page size bounds accepted by `GET /markets`.
pub const MIN_PAGE_SIZE: u32 = 1;
pub const MAX_PAGE_SIZE: u32 = 1000;

/// HTTP timeout for a single upstream call (seconds).
pub const HTTP_TIMEOUT_SECS: u64 = 30;

/// Max items per store write batch.
pub const DEFAULT_BATCH_SIZE: usize = 500;

/// Batches in flight at once within a cycle.
pub const DEFAULT_WRITE_CONCURRENCY: usize = 4;

/// Attempts per batch, including the first one.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Backoff base delay; doubles each attempt.
pub const DEFAULT_RETRY_BASE_MS: u64 = 1_000;
pub const DEFAULT_RETRY_MAX_MS: u64 = 30_000;

/// Crawl interval (minutes).
pub const DEFAULT_CRAWL_INTERVAL_MINUTES: u64 = 5;

/// Markets closing within this many hours are synced each cycle.
pub const DEFAULT_CLOSE_WINDOW_HOURS: u64 = 24;

/// Active markets not synced for this long are re-fetched by ticker (minutes, 0 = off).
pub const DEFAULT_STALE_REFRESH_MINUTES: u64 = 5;

/// Tickers per request when re-fetching stale markets.
pub const STALE_TICKERS_PER_REQUEST: usize = 100;

/// Upper bound on stale tickers considered per cycle.
pub const STALE_SCAN_LIMIT: usize = 2_000;

/// Channel capacity for the outcome event writer.
pub const CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Sqlite,
    Memory,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Periodic scheduler plus control API.
    Service,
    /// Single cycle, then exit.
    Once,
}

/// Where synced documents land. Both parts are required before the scheduler starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreTarget {
    pub project: String,
    pub collection: String,
}

impl StoreTarget {
    pub fn validate(&self) -> Result<()> {
        if self.project.trim().is_empty() {
            return Err(AppError::Config("STORE_PROJECT is required".to_string()));
        }
        if self.collection.trim().is_empty() {
            return Err(AppError::Config("STORE_COLLECTION must not be empty".to_string()));
        }
        Ok(())
    }
}

/// Per-batch retry settings for store writes.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: Duration::from_millis(DEFAULT_RETRY_BASE_MS),
            max_delay: Duration::from_millis(DEFAULT_RETRY_MAX_MS),
            jitter: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub api_url: String,
    pub log_level: String,
    pub db_path: String,
    pub api_port: u16,
    pub run_mode: RunMode,
    pub store_backend: StoreBackend,
    pub target: StoreTarget,
    /// Outbound requests per second (KALSHI_RATE_LIMIT)
    pub rate_limit_per_sec: f64,
    /// Items per upstream page (SYNC_PAGE_SIZE), validated per request
    pub page_size: u32,
    pub crawl_interval: Duration,
    pub close_window_hours: u64,
    /// Status set sent upstream each cycle (SYNC_STATUSES, comma-separated)
    pub statuses: Vec<StatusFilter>,
    pub event_ticker: Option<String>,
    pub series_ticker: Option<String>,
    pub batch_size: usize,
    pub write_concurrency: usize,
    pub retry: RetryPolicy,
    /// `None` disables the stale-market refresh pass.
    pub stale_after: Option<Duration>,
    pub trigger_policy: TriggerPolicy,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_url: KALSHI_API_URL.to_string(),
            log_level: "info".to_string(),
            db_path: "market_sync.db".to_string(),
            api_port: 3000,
            run_mode: RunMode::Service,
            store_backend: StoreBackend::Sqlite,
            target: StoreTarget { project: String::new(), collection: "markets".to_string() },
            rate_limit_per_sec: DEFAULT_RATE_LIMIT_PER_SEC,
            page_size: MAX_PAGE_SIZE,
            crawl_interval: Duration::from_secs(DEFAULT_CRAWL_INTERVAL_MINUTES * 60),
            close_window_hours: DEFAULT_CLOSE_WINDOW_HOURS,
            statuses: vec![StatusFilter::Open],
            event_ticker: None,
            series_ticker: None,
            batch_size: DEFAULT_BATCH_SIZE,
            write_concurrency: DEFAULT_WRITE_CONCURRENCY,
            retry: RetryPolicy::default(),
            stale_after: Some(Duration::from_secs(DEFAULT_STALE_REFRESH_MINUTES * 60)),
            trigger_policy: TriggerPolicy::Drop,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let defaults = Config::default();

        let statuses = match std::env::var("SYNC_STATUSES") {
            Ok(raw) => parse_list(&raw)
                .iter()
                .map(|s| s.parse::<StatusFilter>())
                .collect::<Result<Vec<_>>>()?,
            Err(_) => defaults.statuses,
        };

        let stale_secs = env_minutes_as_secs("STALE_REFRESH_MINUTES", DEFAULT_STALE_REFRESH_MINUTES)?;

        Ok(Self {
            api_url: std::env::var("KALSHI_BASE_URL").unwrap_or_else(|_| KALSHI_API_URL.to_string()),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            db_path: std::env::var("DB_PATH").unwrap_or(defaults.db_path),
            api_port: std::env::var("API_PORT")
                .unwrap_or_else(|_| "3000".to_string())
                .parse::<u16>()
                .map_err(|_| AppError::Config("API_PORT must be a valid port number".to_string()))?,
            run_mode: match std::env::var("RUN_MODE").as_deref() {
                Ok("once") => RunMode::Once,
                Ok("service") | Err(_) => RunMode::Service,
                Ok(other) => {
                    return Err(AppError::Config(format!("RUN_MODE must be service|once, got {other}")))
                }
            },
            store_backend: match std::env::var("STORE_BACKEND").as_deref() {
                Ok("memory") => StoreBackend::Memory,
                Ok("sqlite") | Err(_) => StoreBackend::Sqlite,
                Ok(other) => {
                    return Err(AppError::Config(format!(
                        "STORE_BACKEND must be sqlite|memory, got {other}"
                    )))
                }
            },
            target: StoreTarget {
                project: std::env::var("STORE_PROJECT").unwrap_or_default(),
                collection: std::env::var("STORE_COLLECTION")
                    .unwrap_or_else(|_| "markets".to_string()),
            },
            rate_limit_per_sec: env_or("KALSHI_RATE_LIMIT", DEFAULT_RATE_LIMIT_PER_SEC)?,
            page_size: env_or("SYNC_PAGE_SIZE", MAX_PAGE_SIZE)?,
            crawl_interval: Duration::from_secs(env_minutes_as_secs(
                "CRAWLER_INTERVAL_MINUTES",
                DEFAULT_CRAWL_INTERVAL_MINUTES,
            )?),
            close_window_hours: env_or("MARKET_CLOSE_WINDOW_HOURS", DEFAULT_CLOSE_WINDOW_HOURS)?,
            statuses,
            event_ticker: std::env::var("SYNC_EVENT_TICKER").ok().filter(|s| !s.is_empty()),
            series_ticker: std::env::var("SYNC_SERIES_TICKER").ok().filter(|s| !s.is_empty()),
            batch_size: env_or::<usize>("SYNC_BATCH_SIZE", DEFAULT_BATCH_SIZE)?.max(1),
            write_concurrency: env_or::<usize>("SYNC_WRITE_CONCURRENCY", DEFAULT_WRITE_CONCURRENCY)?
                .max(1),
            retry: RetryPolicy {
                max_attempts: env_or::<u32>("CRAWLER_MAX_RETRIES", DEFAULT_MAX_ATTEMPTS)?.max(1),
                base_delay: Duration::from_millis(env_or("CRAWLER_RETRY_DELAY_MS", DEFAULT_RETRY_BASE_MS)?),
                max_delay: Duration::from_millis(env_or(
                    "CRAWLER_RETRY_MAX_DELAY_MS",
                    DEFAULT_RETRY_MAX_MS,
                )?),
                jitter: env_or("CRAWLER_RETRY_JITTER", true)?,
            },
            stale_after: (stale_secs > 0).then(|| Duration::from_secs(stale_secs)),
            trigger_policy: match std::env::var("SYNC_TRIGGER_POLICY") {
                Ok(raw) => raw.parse()?,
                Err(_) => TriggerPolicy::Drop,
            },
        })
    }
}

/// Read `key` from the environment, falling back to `default` when unset.
/// A set but unparsable value is a configuration error, not a silent default.
fn env_or<T: FromStr>(key: &str, default: T) -> Result<T> {
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|_| AppError::Config(format!("{key} has an invalid value: {raw}"))),
        Err(_) => Ok(default),
    }
}

/// A minute count from the environment, converted to seconds.
fn env_minutes_as_secs(key: &str, default: u64) -> Result<u64> {
    let minutes: u64 = env_or(key, default)?;
    minutes
        .checked_mul(60)
        .ok_or_else(|| AppError::Config(format!("{key} is too large: {minutes} minutes")))
}

fn parse_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}
