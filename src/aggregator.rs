//! Cursor walk over the upstream listing as a lazy stream.
//!
//! A walk starts with no cursor and follows returned cursors until a page
//! comes back without one. Pages are only requested as the consumer polls,
//! so dropping the stream stops the walk. The first error is yielded and the
//! stream ends there; items already yielded stay yielded. A cursor handed
//! back a second time ends the walk with an upstream error.

use std::collections::HashSet;

use futures_util::stream::{self, Stream, TryStreamExt};
use tracing::warn;

use crate::error::{AppError, Result};
use crate::fetcher::MarketSource;
use crate::types::{Market, MarketFilter, PageRequest, PageResult};

struct Walk {
    cursor: Option<String>,
    followed: HashSet<String>,
    done: bool,
}

/// Stream every page reachable from the empty cursor.
pub fn fetch_pages<'a, S>(
    source: &'a S,
    filter: MarketFilter,
    page_size: u32,
) -> impl Stream<Item = Result<PageResult>> + Send + 'a
where
    S: MarketSource + ?Sized,
{
    let start = Walk { cursor: None, followed: HashSet::new(), done: false };
    stream::try_unfold(start, move |mut walk| {
        let filter = filter.clone();
        async move {
            if walk.done {
                return Ok(None);
            }
            if let Some(cursor) = &walk.cursor {
                if !walk.followed.insert(cursor.clone()) {
                    // The first page is requested without a cursor.
                    let pages = walk.followed.len() + 1;
                    warn!(cursor = %cursor, pages, "Upstream repeated a pagination cursor");
                    return Err(AppError::Upstream {
                        status: None,
                        body: format!("pagination cursor {cursor} repeated after {pages} pages"),
                    });
                }
            }

            let request = PageRequest { filter, cursor: walk.cursor.take(), limit: page_size };
            let page = source.fetch_page(&request).await?;

            match page.next_cursor.clone() {
                Some(c) if !c.is_empty() => walk.cursor = Some(c),
                _ => walk.done = true,
            }
            Ok(Some((page, walk)))
        }
    })
}

/// Stream every market of the walk, in page order.
pub fn fetch_all<'a, S>(
    source: &'a S,
    filter: MarketFilter,
    page_size: u32,
) -> impl Stream<Item = Result<Market>> + Send + 'a
where
    S: MarketSource + ?Sized,
{
    fetch_pages(source, filter, page_size)
        .map_ok(|page| stream::iter(page.markets.into_iter().map(Ok::<Market, AppError>)))
        .try_flatten()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use futures_util::StreamExt;
    use std::collections::HashMap;
    use std::sync::Mutex;

    pub(crate) fn market(ticker: &str) -> Market {
        Market {
            ticker: ticker.to_string(),
            event_ticker: "EV".to_string(),
            series_ticker: None,
            market_type: "binary".to_string(),
            title: format!("Will {ticker} happen?"),
            subtitle: String::new(),
            yes_sub_title: "Yes".to_string(),
            no_sub_title: "No".to_string(),
            status: "active".to_string(),
            yes_bid: 40,
            yes_ask: 42,
            no_bid: 58,
            no_ask: 60,
            last_price: 41,
            previous_price: 40,
            previous_yes_bid: 39,
            previous_yes_ask: 41,
            volume: 1_000,
            volume_24h: 120,
            open_interest: 300,
            liquidity: 5_000,
            notional_value: 100,
            tick_size: 1,
            result: String::new(),
            category: "economics".to_string(),
            can_close_early: false,
            open_time: Some(Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap()),
            close_time: Utc.with_ymd_and_hms(2026, 1, 2, 0, 0, 0).unwrap(),
            expiration_time: None,
            latest_expiration_time: Some(Utc.with_ymd_and_hms(2026, 1, 9, 0, 0, 0).unwrap()),
            settlement_timer_seconds: 300,
            response_price_units: "usd_cent".to_string(),
            notional_value_dollars: "1.0000".to_string(),
            yes_bid_dollars: "0.4000".to_string(),
            yes_ask_dollars: "0.4200".to_string(),
            no_bid_dollars: "0.5800".to_string(),
            no_ask_dollars: "0.6000".to_string(),
            last_price_dollars: "0.4100".to_string(),
            previous_yes_bid_dollars: "0.3900".to_string(),
            previous_yes_ask_dollars: "0.4100".to_string(),
            previous_price_dollars: "0.4000".to_string(),
            liquidity_dollars: "50.0000".to_string(),
            expiration_value: String::new(),
            risk_limit_cents: 0,
            rules_primary: format!("Resolves Yes if {ticker} happens."),
            rules_secondary: String::new(),
            settlement_value: None,
            settlement_value_dollars: String::new(),
            price_level_structure: "linear_cent".to_string(),
            price_ranges: Vec::new(),
        }
    }

    /// Pages keyed by the cursor that requests them (`""` = first page).
    /// A page entry of `None` fails with HTTP 500.
    #[derive(Default)]
    pub(crate) struct ScriptedSource {
        pub(crate) pages: HashMap<String, Option<(Vec<Market>, Option<String>)>>,
        pub(crate) requests: Mutex<Vec<PageRequest>>,
    }

    impl ScriptedSource {
        pub(crate) fn page(mut self, cursor: &str, tickers: &[&str], next: Option<&str>) -> Self {
            let markets = tickers.iter().map(|t| market(t)).collect();
            self.pages.insert(cursor.to_string(), Some((markets, next.map(str::to_string))));
            self
        }

        pub(crate) fn failing(mut self, cursor: &str) -> Self {
            self.pages.insert(cursor.to_string(), None);
            self
        }

        pub(crate) fn calls(&self) -> usize {
            self.requests.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl MarketSource for ScriptedSource {
        async fn fetch_page(&self, request: &PageRequest) -> Result<PageResult> {
            self.requests.lock().unwrap().push(request.clone());
            let key = request.cursor.clone().unwrap_or_default();
            match self.pages.get(&key) {
                Some(Some((markets, next))) => Ok(PageResult {
                    markets: markets.clone(),
                    next_cursor: next.clone(),
                    rejected: 0,
                }),
                Some(None) => Err(AppError::Upstream { status: Some(500), body: "boom".into() }),
                None => panic!("unexpected cursor {key}"),
            }
        }
    }

    #[tokio::test]
    async fn three_page_chain_yields_six_items_in_order() {
        let source = ScriptedSource::default()
            .page("", &["a1", "a2"], Some("B"))
            .page("B", &["b1", "b2"], Some("C"))
            .page("C", &["c1", "c2"], None);

        let items: Vec<Market> = fetch_all(&source, MarketFilter::default(), 1000)
            .try_collect()
            .await
            .unwrap();

        let tickers: Vec<&str> = items.iter().map(|m| m.ticker.as_str()).collect();
        assert_eq!(tickers, vec!["a1", "a2", "b1", "b2", "c1", "c2"]);
        assert_eq!(source.calls(), 3);
    }

    #[tokio::test]
    async fn error_mid_walk_yields_earlier_items_then_stops() {
        let source = ScriptedSource::default()
            .page("", &["a1", "a2"], Some("B"))
            .failing("B");

        let results: Vec<Result<Market>> =
            fetch_all(&source, MarketFilter::default(), 1000).collect().await;

        assert_eq!(results.len(), 3);
        assert_eq!(results[0].as_ref().unwrap().ticker, "a1");
        assert_eq!(results[1].as_ref().unwrap().ticker, "a2");
        assert!(matches!(results[2], Err(AppError::Upstream { status: Some(500), .. })));
        assert_eq!(source.calls(), 2);
    }

    #[tokio::test]
    async fn filter_and_page_size_reach_every_request() {
        let source = ScriptedSource::default()
            .page("", &["a1"], Some("B"))
            .page("B", &["b1"], None);
        let filter = MarketFilter {
            event_ticker: Some("EV".into()),
            max_close_ts: Some(99),
            ..MarketFilter::default()
        };

        let _: Vec<Market> = fetch_all(&source, filter.clone(), 250).try_collect().await.unwrap();

        let requests = source.requests.lock().unwrap();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].cursor, None);
        assert_eq!(requests[1].cursor.as_deref(), Some("B"));
        assert!(requests.iter().all(|r| r.filter == filter && r.limit == 250));
    }

    #[tokio::test]
    async fn dropping_the_stream_stops_paging() {
        let source = ScriptedSource::default()
            .page("", &["a1", "a2"], Some("B"))
            .page("B", &["b1"], None);

        {
            let stream = fetch_all(&source, MarketFilter::default(), 1000);
            futures_util::pin_mut!(stream);
            let first = stream.next().await.unwrap().unwrap();
            assert_eq!(first.ticker, "a1");
        }

        assert_eq!(source.calls(), 1);
    }

    #[tokio::test]
    async fn repeated_cursor_ends_walk_with_error() {
        let source = ScriptedSource::default()
            .page("", &["a1"], Some("B"))
            .page("B", &["b1"], Some("B"));

        let results: Vec<Result<PageResult>> =
            fetch_pages(&source, MarketFilter::default(), 1000).take(50).collect().await;

        assert_eq!(results.len(), 3);
        assert_eq!(results[1].as_ref().unwrap().markets[0].ticker, "b1");
        match &results[2] {
            Err(AppError::Upstream { status: None, body }) => assert!(body.contains("B"), "{body}"),
            other => panic!("expected repeated-cursor error, got {other:?}"),
        }
        assert_eq!(source.calls(), 2);
    }

    #[tokio::test]
    async fn cycling_cursors_are_caught_too() {
        let source = ScriptedSource::default()
            .page("", &["a1"], Some("B"))
            .page("B", &["b1"], Some("C"))
            .page("C", &["c1"], Some("B"));

        let results: Vec<Result<Market>> =
            fetch_all(&source, MarketFilter::default(), 1000).take(50).collect().await;

        assert_eq!(results.len(), 4);
        assert!(results[..3].iter().all(|r| r.is_ok()));
        assert!(matches!(results[3], Err(AppError::Upstream { status: None, .. })));
        assert_eq!(source.calls(), 3);
    }

    #[tokio::test]
    async fn empty_first_page_ends_walk() {
        let source = ScriptedSource::default().page("", &[], None);
        let items: Vec<Market> = fetch_all(&source, MarketFilter::default(), 1000)
            .try_collect()
            .await
            .unwrap();
        assert!(items.is_empty());
        assert_eq!(source.calls(), 1);
    }
}
