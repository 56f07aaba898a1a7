//! Feed ingestion: pluggable source adapters fetched in parallel.
//!
//! Every adapter normalizes to `NewsItem` and reports failures through
//! its diagnostics instead of failing the cycle. The combined wall-clock
//! for a cycle is the slowest source, not the sum.

pub mod filings;
pub mod newsapi;
pub mod screener;
pub mod wire;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::models::NewsItem;

/// Per-cycle fetch context shared by all adapters.
#[derive(Debug, Clone)]
pub struct FetchContext {
    pub now: DateTime<Utc>,
    /// Items published before this are dropped before dedup.
    pub max_age_minutes: u32,
}

#[derive(Debug, Clone, Default)]
pub struct FetchDiagnostics {
    pub source: String,
    pub latency_ms: u64,
    pub error: Option<String>,
    pub not_modified: bool,
    /// Source cadence floor not yet elapsed; fetch skipped.
    pub skipped: bool,
    pub fetched: usize,
    pub dropped_stale: usize,
}

#[derive(Debug, Default)]
pub struct FetchOutcome {
    pub items: Vec<NewsItem>,
    pub diagnostics: FetchDiagnostics,
}

#[async_trait]
pub trait FeedAdapter: Send + Sync {
    fn name(&self) -> &str;

    /// Published polite minimum between fetches for this source. Sources
    /// with posted floors override the global cadence.
    fn min_interval(&self) -> Duration {
        Duration::from_secs(0)
    }

    async fn fetch(&self, ctx: &FetchContext) -> FetchOutcome;
}

/// Conditional-request state kept per adapter (ETag / Last-Modified),
/// plus the last fetch instant for the cadence floor.
#[derive(Debug, Default)]
pub struct ConditionalState {
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    pub last_fetch: Option<Instant>,
}

impl ConditionalState {
    pub fn apply(&self, mut req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        if let Some(etag) = &self.etag {
            req = req.header(reqwest::header::IF_NONE_MATCH, etag);
        }
        if let Some(last_modified) = &self.last_modified {
            req = req.header(reqwest::header::IF_MODIFIED_SINCE, last_modified);
        }
        req
    }

    pub fn update_from(&mut self, resp: &reqwest::Response) {
        if let Some(etag) = resp.headers().get(reqwest::header::ETAG) {
            self.etag = etag.to_str().ok().map(str::to_string);
        }
        if let Some(lm) = resp.headers().get(reqwest::header::LAST_MODIFIED) {
            self.last_modified = lm.to_str().ok().map(str::to_string);
        }
    }
}

/// True when the adapter's cadence floor has not elapsed yet.
pub fn floor_not_elapsed(state: &ConditionalState, floor: Duration) -> bool {
    floor > Duration::ZERO
        && state
            .last_fetch
            .is_some_and(|at| at.elapsed() < floor)
}

/// Outcome of one parallel ingestion pass.
pub struct IngestResult {
    pub items: Vec<NewsItem>,
    pub diagnostics: Vec<FetchDiagnostics>,
}

/// The registered adapters plus consecutive-failure tracking per source.
pub struct FeedSet {
    adapters: Vec<Arc<dyn FeedAdapter>>,
    empty_streak: Mutex<HashMap<String, u32>>,
}

impl FeedSet {
    pub fn new(adapters: Vec<Arc<dyn FeedAdapter>>) -> Self {
        Self {
            adapters,
            empty_streak: Mutex::new(HashMap::new()),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }

    /// Fetch all sources concurrently under one deadline. A source that
    /// errors or overruns contributes no items and an error diagnostic.
    pub async fn fetch_all(
        &self,
        ctx: &FetchContext,
        deadline: Duration,
        outage_threshold: u32,
    ) -> IngestResult {
        let mut set = JoinSet::new();
        for adapter in &self.adapters {
            let adapter = adapter.clone();
            let ctx = ctx.clone();
            set.spawn(async move {
                let name = adapter.name().to_string();
                let started = Instant::now();
                match tokio::time::timeout(deadline, adapter.fetch(&ctx)).await {
                    Ok(outcome) => outcome,
                    Err(_) => FetchOutcome {
                        items: Vec::new(),
                        diagnostics: FetchDiagnostics {
                            source: name,
                            latency_ms: started.elapsed().as_millis() as u64,
                            error: Some("cycle deadline exceeded".to_string()),
                            ..Default::default()
                        },
                    },
                }
            });
        }

        let mut items = Vec::new();
        let mut diagnostics = Vec::new();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(mut outcome) => {
                    let max_age = i64::from(ctx.max_age_minutes);
                    let before = outcome.items.len();
                    outcome.items.retain(|item| item.age_minutes(ctx.now) <= max_age);
                    outcome.diagnostics.dropped_stale += before - outcome.items.len();
                    self.track_outage(&outcome, outage_threshold);
                    items.extend(outcome.items);
                    diagnostics.push(outcome.diagnostics);
                }
                Err(e) => warn!(error = %e, "Feed task panicked"),
            }
        }
        IngestResult { items, diagnostics }
    }

    fn track_outage(&self, outcome: &FetchOutcome, threshold: u32) {
        // Skipped fetches (cadence floor) do not count toward an outage.
        if outcome.diagnostics.skipped {
            return;
        }
        let mut streaks = self.empty_streak.lock();
        let streak = streaks
            .entry(outcome.diagnostics.source.clone())
            .or_insert(0);
        let produced = !outcome.items.is_empty() || outcome.diagnostics.not_modified;
        if produced && outcome.diagnostics.error.is_none() {
            if *streak >= threshold {
                info!(source = %outcome.diagnostics.source, "Feed recovered");
            }
            *streak = 0;
        } else {
            *streak += 1;
            if *streak == threshold {
                warn!(
                    source = %outcome.diagnostics.source,
                    consecutive_empty = *streak,
                    "Feed outage suspected"
                );
            }
        }
    }
}
