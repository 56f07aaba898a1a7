//! Price/volume screener adapter.
//!
//! Optional candidate source: a screening endpoint returns symbols that
//! crossed a volume/price threshold, and each becomes a low-signal item
//! the classifier can promote if news corroborates.

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use reqwest::Client;
use serde::Deserialize;
use std::time::{Duration, Instant};
use tracing::debug;

use super::{
    floor_not_elapsed, ConditionalState, FeedAdapter, FetchContext, FetchDiagnostics, FetchOutcome,
};
use crate::models::NewsItem;

#[derive(Debug, Deserialize)]
struct Candidate {
    symbol: String,
    #[serde(default)]
    price: Option<f64>,
    #[serde(default)]
    volume: Option<f64>,
    #[serde(default)]
    change_pct: Option<f64>,
}

pub struct ScreenerFeed {
    url: String,
    client: Client,
    state: Mutex<ConditionalState>,
}

impl ScreenerFeed {
    pub fn new(url: impl Into<String>) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(15))
            .user_agent("catalyst-bot/0.1 (screener)")
            .build()
            .expect("Failed to create HTTP client");
        Self {
            url: url.into(),
            client,
            state: Mutex::new(ConditionalState::default()),
        }
    }
}

pub fn parse_screen(bytes: &[u8], ctx: &FetchContext) -> Vec<NewsItem> {
    let Ok(candidates) = serde_json::from_slice::<Vec<Candidate>>(bytes) else {
        return Vec::new();
    };
    let day = ctx.now.date_naive();
    let mut items = Vec::with_capacity(candidates.len());
    for candidate in candidates {
        let symbol = candidate.symbol.trim().to_uppercase();
        if symbol.is_empty() {
            continue;
        }
        let change = candidate
            .change_pct
            .filter(|v| v.is_finite())
            .map(|v| format!("{v:+.1}%"))
            .unwrap_or_else(|| "n/a".to_string());
        // One candidate item per symbol per day; dedup absorbs repeats.
        let mut item = NewsItem::new(
            "screener",
            format!("{symbol}-{day}"),
            ctx.now,
            String::new(),
            format!("Volume screen: {symbol} ({change})"),
            "Unusual price/volume activity flagged by the intraday screen.",
        );
        item.ticker = Some(symbol.clone());
        item.tickers_mentioned = vec![symbol];
        if let Some(volume) = candidate.volume.filter(|v| v.is_finite()) {
            item.annotate("screen_volume", serde_json::json!(volume));
        }
        if let Some(price) = candidate.price.filter(|v| v.is_finite()) {
            item.annotate("screen_price", serde_json::json!(price));
        }
        items.push(item);
    }
    items
}

#[async_trait]
impl FeedAdapter for ScreenerFeed {
    fn name(&self) -> &str {
        "screener"
    }

    // The screen is expensive server-side; poll at most every 5 minutes.
    fn min_interval(&self) -> Duration {
        Duration::from_secs(300)
    }

    async fn fetch(&self, ctx: &FetchContext) -> FetchOutcome {
        let mut diagnostics = FetchDiagnostics {
            source: "screener".to_string(),
            ..Default::default()
        };
        {
            let state = self.state.lock();
            if floor_not_elapsed(&state, self.min_interval()) {
                diagnostics.skipped = true;
                return FetchOutcome {
                    items: Vec::new(),
                    diagnostics,
                };
            }
        }

        let started = Instant::now();
        let resp = match self.client.get(&self.url).send().await {
            Ok(resp) => resp,
            Err(e) => {
                diagnostics.error = Some(e.to_string());
                diagnostics.latency_ms = started.elapsed().as_millis() as u64;
                return FetchOutcome {
                    items: Vec::new(),
                    diagnostics,
                };
            }
        };
        {
            let mut state = self.state.lock();
            state.last_fetch = Some(Instant::now());
        }
        diagnostics.latency_ms = started.elapsed().as_millis() as u64;

        if !resp.status().is_success() {
            diagnostics.error = Some(format!("http {}", resp.status().as_u16()));
            return FetchOutcome {
                items: Vec::new(),
                diagnostics,
            };
        }
        let bytes = match resp.bytes().await {
            Ok(bytes) => bytes,
            Err(e) => {
                diagnostics.error = Some(e.to_string());
                return FetchOutcome {
                    items: Vec::new(),
                    diagnostics,
                };
            }
        };
        let items = parse_screen(&bytes, ctx);
        diagnostics.fetched = items.len();
        debug!(fetched = items.len(), "Screener fetched");
        FetchOutcome { items, diagnostics }
    }
}
