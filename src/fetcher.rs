use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::config::{Config, HTTP_TIMEOUT_SECS, MAX_PAGE_SIZE, MIN_PAGE_SIZE};
use crate::error::{AppError, Result};
use crate::rate_limiter::RateLimiter;
use crate::types::{Market, PageRequest, PageResult};

/// One page of upstream listings per call. The aggregator only sees this
/// trait, so walks can be driven by the HTTP client or by a test double.
#[async_trait]
pub trait MarketSource: Send + Sync {
    async fn fetch_page(&self, request: &PageRequest) -> Result<PageResult>;

    /// Release connections. Called once by the scheduler on stop.
    async fn close(&self) {}
}

/// Typed client for `GET {base}/markets`.
pub struct PagedFetcher {
    /// `None` once closed; dropping the last handle frees the connection pool.
    client: RwLock<Option<reqwest::Client>>,
    base_url: String,
    limiter: Arc<RateLimiter>,
}

impl PagedFetcher {
    pub fn new(cfg: &Config) -> Result<Self> {
        Self::with_limiter(&cfg.api_url, Arc::new(RateLimiter::new(cfg.rate_limit_per_sec)))
    }

    pub fn with_limiter(base_url: &str, limiter: Arc<RateLimiter>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(HTTP_TIMEOUT_SECS))
            .build()?;
        debug!(interval_ms = limiter.interval().as_millis() as u64, "Upstream rate limit configured");
        Ok(Self {
            client: RwLock::new(Some(client)),
            base_url: base_url.trim_end_matches('/').to_string(),
            limiter,
        })
    }

    /// Cloned handle to the live client. Clones share one connection pool.
    fn client(&self) -> Result<reqwest::Client> {
        self.client
            .read()
            .ok()
            .and_then(|c| c.clone())
            .ok_or_else(|| AppError::InvalidState("upstream client is closed".to_string()))
    }
}

#[async_trait]
impl MarketSource for PagedFetcher {
    async fn fetch_page(&self, request: &PageRequest) -> Result<PageResult> {
        validate_page_size(request.limit)?;
        let client = self.client()?;

        self.limiter.acquire().await;

        let url = format!("{}/markets", self.base_url);
        let resp = client
            .get(&url)
            .query(&query_params(request))
            .send()
            .await
            .map_err(transport_error)?;

        let status = resp.status();
        let body = resp.text().await.map_err(transport_error)?;

        if !status.is_success() {
            return Err(AppError::Upstream { status: Some(status.as_u16()), body });
        }

        let page = parse_page_body(&body, status.as_u16())?;
        debug!(
            markets = page.markets.len(),
            rejected = page.rejected,
            has_next = page.next_cursor.is_some(),
            "Fetched market page"
        );
        Ok(page)
    }

    async fn close(&self) {
        let released = match self.client.write() {
            Ok(mut slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if released.is_some() {
            debug!("Upstream client released");
        }
    }
}

/// `limit` must sit in `[1, 1000]`. Checked before anything touches the network.
pub fn validate_page_size(limit: u32) -> Result<()> {
    if !(MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&limit) {
        return Err(AppError::Validation(format!(
            "limit must be between {MIN_PAGE_SIZE} and {MAX_PAGE_SIZE}, got {limit}"
        )));
    }
    Ok(())
}

/// Build the query string. Absent filter parts are omitted entirely.
pub fn query_params(request: &PageRequest) -> Vec<(&'static str, String)> {
    let f = &request.filter;
    let mut params = vec![("limit", request.limit.to_string())];

    if let Some(cursor) = request.cursor.as_deref().filter(|c| !c.is_empty()) {
        params.push(("cursor", cursor.to_string()));
    }
    if !f.statuses.is_empty() {
        let joined = f.statuses.iter().map(|s| s.to_string()).collect::<Vec<_>>().join(",");
        params.push(("status", joined));
    }
    if let Some(ev) = &f.event_ticker {
        params.push(("event_ticker", ev.clone()));
    }
    if let Some(series) = &f.series_ticker {
        params.push(("series_ticker", series.clone()));
    }
    if !f.tickers.is_empty() {
        params.push(("tickers", f.tickers.join(",")));
    }
    if let Some(ts) = f.min_close_ts {
        params.push(("min_close_ts", ts.to_string()));
    }
    if let Some(ts) = f.max_close_ts {
        params.push(("max_close_ts", ts.to_string()));
    }
    params
}

/// Response envelope. Items stay untyped here so one bad market can be
/// dropped without failing the whole page.
#[derive(Debug, Deserialize)]
struct RawPage {
    #[serde(alias = "items")]
    markets: Vec<serde_json::Value>,
    #[serde(default)]
    cursor: Option<String>,
}

/// Parse a 2xx body. A malformed envelope is an upstream failure; a malformed
/// item is logged, counted and skipped.
pub fn parse_page_body(body: &str, status: u16) -> Result<PageResult> {
    let raw: RawPage = serde_json::from_str(body).map_err(|e| AppError::Upstream {
        status: Some(status),
        body: format!("malformed markets payload ({e}): {}", truncate(body, 512)),
    })?;

    let mut page = PageResult {
        markets: Vec::with_capacity(raw.markets.len()),
        next_cursor: raw.cursor.filter(|c| !c.is_empty()),
        rejected: 0,
    };

    for item in raw.markets {
        match serde_json::from_value::<Market>(item.clone()) {
            Ok(market) => page.markets.push(market),
            Err(e) => {
                page.rejected += 1;
                let ticker = item.get("ticker").and_then(|t| t.as_str()).unwrap_or("?");
                warn!(ticker = %ticker, "Rejected unparsable market {ticker}: {e}");
            }
        }
    }

    Ok(page)
}

fn transport_error(e: reqwest::Error) -> AppError {
    AppError::Upstream {
        status: e.status().map(|s| s.as_u16()),
        body: e.to_string(),
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
