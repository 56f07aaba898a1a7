//! Batched price fetches with a provider chain and a shared TTL cache.
//!
//! Chain order: primary batch provider, per-ticker fallback, secondary.
//! Every number leaving this module is finite or explicitly missing; the
//! SQLite price table is a write-through warm layer for restarts.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use reqwest::Client;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::models::PriceSnapshot;
use crate::storage::Storage;

#[async_trait]
pub trait QuoteProvider: Send + Sync {
    fn name(&self) -> &'static str;

    async fn batch(&self, tickers: &[String]) -> Result<HashMap<String, PriceSnapshot>>;

    async fn single(&self, ticker: &str) -> Result<PriceSnapshot> {
        let tickers = vec![ticker.to_string()];
        let map = self.batch(&tickers).await?;
        map.into_iter()
            .map(|(_, snap)| snap)
            .next()
            .ok_or_else(|| anyhow!("{}: no quote for {ticker}", self.name()))
    }
}

/// JSON quote endpoint: `GET {base}?symbols=A,B` returning
/// `{"AAPL": {"last": 1.0, "prev_close": 0.9}, ...}`.
pub struct HttpQuoteProvider {
    name: &'static str,
    base_url: String,
    client: Client,
}

#[derive(Debug, Deserialize)]
struct QuoteBody {
    #[serde(default, alias = "price", alias = "last_price")]
    last: Option<f64>,
    #[serde(default, alias = "previous_close")]
    prev_close: Option<f64>,
}

impl HttpQuoteProvider {
    pub fn new(name: &'static str, base_url: impl Into<String>) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .user_agent("catalyst-bot/0.1 (quotes)")
            .build()
            .expect("Failed to create HTTP client");
        Self {
            name,
            base_url: base_url.into(),
            client,
        }
    }
}

#[async_trait]
impl QuoteProvider for HttpQuoteProvider {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn batch(&self, tickers: &[String]) -> Result<HashMap<String, PriceSnapshot>> {
        if tickers.is_empty() {
            return Ok(HashMap::new());
        }
        let url = format!("{}?symbols={}", self.base_url, tickers.join(","));
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("{} quote request", self.name))?;
        if !resp.status().is_success() {
            return Err(anyhow!("{} http {}", self.name, resp.status().as_u16()));
        }
        let body: HashMap<String, QuoteBody> =
            resp.json().await.with_context(|| format!("{} quote json", self.name))?;
        let now = Utc::now();
        Ok(body
            .into_iter()
            .map(|(symbol, quote)| {
                let snap = PriceSnapshot::new(quote.last, quote.prev_close, now, self.name);
                (symbol.to_uppercase(), snap)
            })
            .collect())
    }
}

struct CacheEntry {
    snapshot: PriceSnapshot,
    at: Instant,
}

pub struct PriceService {
    providers: Vec<Arc<dyn QuoteProvider>>,
    cache: Mutex<HashMap<String, CacheEntry>>,
    storage: Option<Storage>,
}

impl PriceService {
    pub fn new(providers: Vec<Arc<dyn QuoteProvider>>, storage: Option<Storage>) -> Self {
        Self {
            providers,
            cache: Mutex::new(HashMap::new()),
            storage,
        }
    }

    /// Quotes for all candidates, one network pass per cycle. Cache hits
    /// are served locally; the remainder walks the provider chain.
    pub async fn batch(&self, tickers: &[String], ttl_secs: u64) -> HashMap<String, PriceSnapshot> {
        let ttl = Duration::from_secs(ttl_secs);
        let mut out = HashMap::new();
        let mut missing: Vec<String> = Vec::new();
        {
            let cache = self.cache.lock();
            for ticker in tickers {
                let ticker = ticker.to_uppercase();
                match cache.get(&ticker) {
                    Some(entry) if entry.at.elapsed() < ttl => {
                        out.insert(ticker, entry.snapshot.clone());
                    }
                    _ => missing.push(ticker),
                }
            }
        }
        missing.sort();
        missing.dedup();
        if missing.is_empty() {
            return out;
        }

        let mut unresolved = missing;
        for (idx, provider) in self.providers.iter().enumerate() {
            if unresolved.is_empty() {
                break;
            }
            // First provider gets the whole batch; later ones mop up
            // per ticker so one bad symbol cannot sink the rest.
            let fetched = if idx == 0 {
                match provider.batch(&unresolved).await {
                    Ok(map) => map,
                    Err(e) => {
                        warn!(provider = provider.name(), error = %e, "Batch quote failed");
                        HashMap::new()
                    }
                }
            } else {
                let mut map = HashMap::new();
                for ticker in &unresolved {
                    match provider.single(ticker).await {
                        Ok(snap) => {
                            map.insert(ticker.clone(), snap);
                        }
                        Err(e) => {
                            debug!(provider = provider.name(), ticker = %ticker, error = %e, "Quote fallback missed");
                        }
                    }
                }
                map
            };
            for (ticker, snapshot) in fetched {
                self.remember(&ticker, &snapshot);
                out.insert(ticker, snapshot);
            }
            unresolved.retain(|t| !out.contains_key(t));
        }

        if !unresolved.is_empty() {
            debug!(count = unresolved.len(), "Tickers with no quote after provider chain");
        }
        out
    }

    pub async fn single(&self, ticker: &str, ttl_secs: u64) -> Option<PriceSnapshot> {
        self.batch(&[ticker.to_string()], ttl_secs)
            .await
            .remove(&ticker.to_uppercase())
    }

    fn remember(&self, ticker: &str, snapshot: &PriceSnapshot) {
        let mut cache = self.cache.lock();
        cache.insert(
            ticker.to_string(),
            CacheEntry {
                snapshot: snapshot.clone(),
                at: Instant::now(),
            },
        );
        drop(cache);
        if let Some(storage) = &self.storage {
            if let Err(e) = storage.upsert_price(
                ticker,
                snapshot.last,
                snapshot.prev_close,
                snapshot.as_of.timestamp(),
                &snapshot.provider,
            ) {
                warn!(error = %e, "Price cache write-through failed");
            }
        }
    }
}
