//! Realtime news API adapter (JSON endpoint with bearer auth).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
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
struct Article {
    id: serde_json::Value,
    #[serde(alias = "title")]
    headline: String,
    #[serde(default)]
    summary: String,
    url: String,
    #[serde(default, alias = "tickers")]
    symbols: Vec<String>,
    #[serde(alias = "published_at")]
    created_at: String,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ApiBody {
    Wrapped { articles: Vec<Article> },
    Bare(Vec<Article>),
}

pub struct NewsApiFeed {
    url: String,
    api_key: Option<String>,
    client: Client,
    state: Mutex<ConditionalState>,
}

impl NewsApiFeed {
    pub fn new(url: impl Into<String>, api_key: Option<String>) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .user_agent("catalyst-bot/0.1 (news ingest)")
            .build()
            .expect("Failed to create HTTP client");
        Self {
            url: url.into(),
            api_key,
            client,
            state: Mutex::new(ConditionalState::default()),
        }
    }
}

pub fn parse_news_body(bytes: &[u8], now: DateTime<Utc>) -> Vec<NewsItem> {
    let Ok(body) = serde_json::from_slice::<ApiBody>(bytes) else {
        return Vec::new();
    };
    let articles = match body {
        ApiBody::Wrapped { articles } => articles,
        ApiBody::Bare(articles) => articles,
    };
    let mut items = Vec::with_capacity(articles.len());
    for article in articles {
        let headline = article.headline.trim();
        if headline.is_empty() {
            continue;
        }
        let source_id = match &article.id {
            serde_json::Value::String(s) if !s.is_empty() => s.clone(),
            serde_json::Value::Number(n) => n.to_string(),
            _ => continue,
        };
        let published_at = DateTime::parse_from_rfc3339(&article.created_at)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or(now);
        let mut item = NewsItem::new(
            "newsapi",
            source_id,
            published_at,
            article.url,
            headline,
            article.summary.trim(),
        );
        item.tickers_mentioned = article
            .symbols
            .into_iter()
            .map(|s| s.trim().to_uppercase())
            .filter(|s| !s.is_empty())
            .collect();
        items.push(item);
    }
    items
}

#[async_trait]
impl FeedAdapter for NewsApiFeed {
    fn name(&self) -> &str {
        "newsapi"
    }

    async fn fetch(&self, ctx: &FetchContext) -> FetchOutcome {
        let mut diagnostics = FetchDiagnostics {
            source: "newsapi".to_string(),
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
        let mut req = self.client.get(&self.url);
        if let Some(key) = &self.api_key {
            req = req.header(reqwest::header::AUTHORIZATION, format!("Bearer {key}"));
        }
        let req = {
            let state = self.state.lock();
            state.apply(req)
        };
        let resp = match req.send().await {
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
            state.update_from(&resp);
        }
        diagnostics.latency_ms = started.elapsed().as_millis() as u64;

        if resp.status() == reqwest::StatusCode::NOT_MODIFIED {
            diagnostics.not_modified = true;
            return FetchOutcome {
                items: Vec::new(),
                diagnostics,
            };
        }
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
        let items = parse_news_body(&bytes, ctx.now);
        diagnostics.fetched = items.len();
        debug!(fetched = items.len(), "News API fetched");
        FetchOutcome { items, diagnostics }
    }
}
