//! Cycle orchestrator.
//!
//! Drives one pipeline pass per cadence tick: parallel ingest, dedup,
//! ticker resolution, structural gates, one batched price fetch,
//! classification, optional LLM enrichment, scored gates, dispatch with
//! the per-cycle cap, then outcomes and heartbeat accounting. Cadence
//! follows the market phase and is re-read from the live parameters at
//! every cycle boundary.

use chrono::Utc;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::alerts::{AlertBuilder, AlertTransport, DispatchStatus, Dispatcher};
use crate::charts::ChartRenderer;
use crate::classify::Classifier;
use crate::config::{ParamSnapshot, ParamStore};
use crate::dedup::{keys_for, DedupKeys, DedupStore};
use crate::feeds::{FeedSet, FetchContext};
use crate::filters;
use crate::heartbeat::{CycleStats, HeartbeatAccumulator};
use crate::llm::{Complexity, LlmRequest, LlmRouter};
use crate::models::{
    ClassifiedItem, Decision, DedupDecision, NewsItem, OutcomeRecord, RejectReason,
};
use crate::phase::{self, HolidayCalendar, MarketPhase};
use crate::price::PriceService;
use crate::storage::OutcomeLog;
use crate::ticker::{Resolution, TickerResolver};

/// How many cycles between dynamic keyword-weight reloads.
const WEIGHT_RELOAD_CYCLES: u64 = 60;

pub struct OrchestratorDeps {
    pub feeds: Arc<FeedSet>,
    pub dedup: DedupStore,
    pub resolver: Arc<TickerResolver>,
    pub prices: Arc<PriceService>,
    pub classifier: Arc<Classifier>,
    pub llm: Arc<LlmRouter>,
    pub dispatcher: Arc<Dispatcher>,
    pub charts: Option<Arc<dyn ChartRenderer>>,
    pub outcomes: OutcomeLog,
    pub params: Arc<ParamStore>,
    /// Plain-post transport for heartbeat summaries (no attachments).
    pub status_transport: Option<Arc<dyn AlertTransport>>,
}

pub struct CycleOrchestrator {
    deps: OrchestratorDeps,
    calendar: HolidayCalendar,
    heartbeat: HeartbeatAccumulator,
    shutdown: watch::Receiver<bool>,
    last_phase: Option<MarketPhase>,
    cycle_count: u64,
}

impl CycleOrchestrator {
    pub fn new(deps: OrchestratorDeps, shutdown: watch::Receiver<bool>) -> Self {
        Self {
            deps,
            calendar: HolidayCalendar::us_equities(),
            heartbeat: HeartbeatAccumulator::new(Utc::now()),
            shutdown,
            last_phase: None,
            cycle_count: 0,
        }
    }

    /// Long-running driver; returns when shutdown is signalled.
    pub async fn run(&mut self) {
        info!("Cycle orchestrator started");
        loop {
            if *self.shutdown.borrow() {
                break;
            }
            let params = self.deps.params.params();
            let now = Utc::now();
            let phase = phase::phase_at(now, &self.calendar);
            let cadence = phase::cadence(&params, phase);
            if self.last_phase != Some(phase) {
                info!(
                    phase = phase.as_str(),
                    cadence_secs = cadence.as_secs(),
                    llm_enabled = params.enable_llm,
                    max_alerts = params.max_alerts_per_cycle,
                    "Market phase transition"
                );
                self.last_phase = Some(phase);
            }

            let started = Instant::now();
            let stats = self.run_cycle(&params, cadence).await;
            self.cycle_count += 1;
            self.heartbeat.add_cycle(&stats);
            if let Some(summary) = self
                .heartbeat
                .maybe_emit(Utc::now(), params.heartbeat_interval_min)
            {
                self.post_heartbeat(summary.to_text()).await;
            }
            if self.cycle_count % WEIGHT_RELOAD_CYCLES == 0 {
                self.deps.classifier.reload_dynamic_weights();
            }

            let elapsed = started.elapsed();
            let sleep_for = cadence.saturating_sub(elapsed);
            debug!(
                cycle = self.cycle_count,
                elapsed_ms = elapsed.as_millis() as u64,
                sleep_ms = sleep_for.as_millis() as u64,
                "Cycle complete"
            );
            tokio::select! {
                _ = tokio::time::sleep(sleep_for) => {}
                _ = self.shutdown.changed() => {}
            }
        }
        info!("Cycle orchestrator stopped");
    }

    /// One full pipeline pass. Public so `--once` smoke runs and the
    /// integration suite can drive single cycles deterministically.
    pub async fn run_cycle(&self, params: &ParamSnapshot, cadence: Duration) -> CycleStats {
        let mut stats = CycleStats::default();
        let now = Utc::now();
        let ctx = FetchContext {
            now,
            max_age_minutes: params.max_article_age_minutes,
        };

        // 1. Parallel ingest under a hard deadline.
        let ingest_deadline = cadence.mul_f32(0.8).max(Duration::from_secs(5));
        let ingest = self
            .deps
            .feeds
            .fetch_all(&ctx, ingest_deadline, params.feed_outage_cycles)
            .await;
        stats.errors += ingest
            .diagnostics
            .iter()
            .filter(|d| d.error.is_some())
            .count();
        stats.scanned = ingest.items.len();

        // 2-3. Dedup and structural gates; survivors carry their keys.
        let mut cycle_keys: HashSet<String> = HashSet::new();
        let mut survivors: Vec<(NewsItem, DedupKeys, String)> = Vec::new();
        // In-cycle duplicates whose winning variant has not completed
        // yet; marked only once the winner is terminal.
        let mut pending_dup_marks: Vec<DedupKeys> = Vec::new();
        for item in ingest.items {
            let keys = keys_for(&item);

            // In-cycle duplicate (two sources, one story, same run).
            let in_cycle_dup =
                cycle_keys.contains(&keys.id_key) || cycle_keys.contains(&keys.sig_key);
            cycle_keys.insert(keys.id_key.clone());
            cycle_keys.insert(keys.sig_key.clone());

            let dedup_decision = if in_cycle_dup {
                DedupDecision::SeenBySig
            } else {
                match self.deps.dedup.check(&keys, params.seen_ttl_days) {
                    Ok(decision) => decision,
                    Err(e) => {
                        warn!(error = %e, "Dedup check failed; treating as fresh");
                        stats.errors += 1;
                        DedupDecision::Fresh
                    }
                }
            };

            // Resolution work is only spent on items the SEEN gate will
            // actually let through.
            let resolution = if dedup_decision == DedupDecision::Fresh {
                self.deps
                    .resolver
                    .resolve(&item, params.max_tickers_per_item)
            } else {
                Resolution::NoTicker
            };

            match filters::evaluate_structural(&item, dedup_decision, &resolution, params) {
                Ok(()) => {
                    let ticker = match &resolution {
                        Resolution::Primary { ticker, .. } => ticker.clone(),
                        _ => unreachable!("structural gates pass only primary resolutions"),
                    };
                    survivors.push((item, keys, ticker));
                }
                Err(RejectReason::Seen) => {
                    *stats.by_reason.entry("SEEN".to_string()).or_insert(0) += 1;
                    if in_cycle_dup {
                        // The winning variant is still in flight; marking
                        // now would persist the shared signature and kill
                        // a deferred winner. Revisit after dispatch.
                        pending_dup_marks.push(keys);
                    } else if let Err(e) = self.deps.dedup.mark_seen(&keys) {
                        warn!(error = %e, "Failed to mark duplicate seen");
                    }
                }
                Err(reason) => {
                    self.record_reject(&item, None, reason, &mut stats);
                    // Content rejects are terminal for this item.
                    if reason != RejectReason::FilterError {
                        if let Err(e) = self.deps.dedup.mark_seen(&keys) {
                            warn!(error = %e, "Failed to mark rejected item seen");
                        }
                    }
                }
            }
        }

        // 4. One batched price fetch for all structural survivors.
        let tickers: Vec<String> = survivors.iter().map(|(_, _, t)| t.clone()).collect();
        let quotes = self
            .deps
            .prices
            .batch(&tickers, params.price_cache_ttl_secs)
            .await;

        // 5. Classify.
        let mut classified: Vec<(ClassifiedItem, DedupKeys)> = Vec::new();
        for (mut item, keys, ticker) in survivors {
            item.ticker = Some(ticker.clone());
            let mut c = self.deps.classifier.classify(item, params);
            c.price = quotes.get(&ticker).cloned();
            classified.push((c, keys));
        }

        // 6. LLM enrichment for items above the pre-filter floor.
        if params.enable_llm {
            let requests: Vec<LlmRequest> = classified
                .iter()
                .enumerate()
                .filter(|(_, (c, _))| c.score >= params.llm_min_prescale)
                .map(|(index, (c, _))| LlmRequest {
                    index,
                    text: format!("{}\n\n{}", c.item.title, c.item.summary),
                    hint: complexity_hint(c),
                    prescale: c.score,
                })
                .collect();
            if !requests.is_empty() {
                let verdicts = self.deps.llm.enrich_batch(requests, params).await;
                for (index, verdict) in verdicts {
                    if let (Some((c, _)), Some(verdict)) = (classified.get_mut(index), verdict) {
                        self.deps.classifier.apply_llm_verdict(c, verdict, params);
                    }
                }
            }
        }

        // 7-8. Scored gates, then dispatch under the per-cycle cap.
        let mut alerts_sent: u32 = 0;
        for (c, keys) in classified {
            match filters::evaluate_scored(&c, params) {
                Ok(()) => {}
                Err(reason) => {
                    self.record_outcome(&c, Decision::Rejected, vec![reason], &mut stats);
                    if reason != RejectReason::FilterError {
                        if let Err(e) = self.deps.dedup.mark_seen(&keys) {
                            warn!(error = %e, "Failed to mark rejected item seen");
                        }
                    }
                    continue;
                }
            }

            if alerts_sent >= params.max_alerts_per_cycle {
                // Deferred items keep their dedup state untouched so the
                // next cycle reconsiders them.
                self.record_outcome(&c, Decision::Deferred, vec![], &mut stats);
                stats.deferred += 1;
                continue;
            }

            match self.dispatch_one(&c, &keys, params).await {
                DispatchStatus::Delivered { .. } => {
                    alerts_sent += 1;
                    stats.alerted += 1;
                    self.record_outcome(&c, Decision::Dispatched, vec![], &mut stats);
                }
                DispatchStatus::FailedTransient => {
                    stats.errors += 1;
                    self.record_outcome(&c, Decision::Failed, vec![], &mut stats);
                }
                DispatchStatus::FailedPermanent => {
                    stats.errors += 1;
                    self.record_outcome(&c, Decision::Failed, vec![], &mut stats);
                    // Unprocessable payloads would fail identically next
                    // cycle; retire them.
                    if let Err(e) = self.deps.dedup.mark_seen(&keys) {
                        warn!(error = %e, "Failed to mark failed item seen");
                    }
                }
            }
        }

        // In-cycle duplicates inherit the winner's fate: if the winning
        // variant completed (its signature is now persisted), record the
        // duplicate's id too; otherwise leave it fresh for next cycle.
        for dup in pending_dup_marks {
            match self.deps.dedup.check(&dup, params.seen_ttl_days) {
                Ok(DedupDecision::Fresh) | Err(_) => {}
                Ok(_) => {
                    if let Err(e) = self.deps.dedup.mark_seen(&dup) {
                        warn!(error = %e, "Failed to mark duplicate seen");
                    }
                }
            }
        }
        stats
    }

    async fn dispatch_one(
        &self,
        c: &ClassifiedItem,
        keys: &DedupKeys,
        params: &ParamSnapshot,
    ) -> DispatchStatus {
        let ticker = c.item.ticker.as_deref().unwrap_or("?");
        let (chart, gauge) = match (&self.deps.charts, &c.price) {
            (Some(renderer), Some(price)) => {
                let chart = renderer
                    .render_price_chart(ticker, price)
                    .map_err(|e| warn!(error = %e, "Chart render failed"))
                    .ok();
                let gauge = renderer
                    .render_sentiment_gauge(c.sentiment)
                    .map_err(|e| warn!(error = %e, "Gauge render failed"))
                    .ok();
                (chart, gauge)
            }
            _ => (None, None),
        };

        let artifact = AlertBuilder::build(c, chart, gauge);
        let status = self
            .deps
            .dispatcher
            .dispatch(&artifact, params.alerts_min_interval_ms)
            .await;
        if matches!(status, DispatchStatus::Delivered { .. }) {
            // Persist the dedup keys as part of completing the post.
            if let Err(e) = self.deps.dedup.mark_seen(keys) {
                error!(error = %e, "Dispatched alert could not be marked seen");
            }
        }
        status
    }

    fn record_reject(
        &self,
        item: &NewsItem,
        price: Option<f64>,
        reason: RejectReason,
        stats: &mut CycleStats,
    ) {
        *stats
            .by_reason
            .entry(reason.as_str().to_string())
            .or_insert(0) += 1;
        let record = OutcomeRecord {
            ts: Utc::now(),
            ticker: item.ticker.clone(),
            decision: Decision::Rejected,
            reasons: vec![reason.as_str().to_string()],
            score: 0.0,
            sentiment: 0.0,
            price,
            source: item.source.clone(),
            categories: vec![],
        };
        if let Err(e) = self.deps.outcomes.append(&record) {
            warn!(error = %e, "Outcome append failed");
        }
    }

    fn record_outcome(
        &self,
        c: &ClassifiedItem,
        decision: Decision,
        reasons: Vec<RejectReason>,
        stats: &mut CycleStats,
    ) {
        for reason in &reasons {
            *stats
                .by_reason
                .entry(reason.as_str().to_string())
                .or_insert(0) += 1;
        }
        let record = OutcomeRecord {
            ts: Utc::now(),
            ticker: c.item.ticker.clone(),
            decision,
            reasons: reasons.iter().map(|r| r.as_str().to_string()).collect(),
            score: c.score,
            sentiment: c.sentiment,
            price: c.price.as_ref().and_then(|p| p.last),
            source: c.item.source.clone(),
            categories: c.categories.iter().cloned().collect(),
        };
        if let Err(e) = self.deps.outcomes.append(&record) {
            warn!(error = %e, "Outcome append failed");
        }
    }

    async fn post_heartbeat(&self, text: String) {
        info!(summary = %text, "Heartbeat");
        if let Some(transport) = &self.deps.status_transport {
            let payload = serde_json::json!({
                "embeds": [{"title": "Heartbeat", "description": text, "color": 0x7F8C8D}],
                "attachments": [],
            });
            if let Err(e) = transport.deliver(&payload, Vec::new()).await {
                warn!(error = ?e, "Heartbeat post failed");
            }
        }
    }
}

/// Complexity hint from what classification already knows: filings and
/// keyword-dense items warrant a stronger tier.
fn complexity_hint(c: &ClassifiedItem) -> Complexity {
    if c.item.is_filing || c.keywords_hit.len() >= 3 {
        Complexity::High
    } else if c.keywords_hit.len() == 2 || c.item.summary.len() > 400 {
        Complexity::Medium
    } else {
        Complexity::Low
    }
}
