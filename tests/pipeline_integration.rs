//! End-to-end pipeline scenarios against fake feeds, quotes and
//! transport: cross-source filing dedup, the NaN price trap, the
//! attachment contract on the wire, and the negative-catalyst bypass.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::watch;

use catalyst_bot::alerts::{
    AlertTransport, DeliveryError, DeliveryReceipt, Dispatcher,
};
use catalyst_bot::charts::FileChartRenderer;
use catalyst_bot::classify::Classifier;
use catalyst_bot::config::{schema, ParamSnapshot, ParamStore};
use catalyst_bot::dedup::{keys_for, DedupStore};
use catalyst_bot::feeds::{FeedAdapter, FeedSet, FetchContext, FetchDiagnostics, FetchOutcome};
use catalyst_bot::llm::LlmRouter;
use catalyst_bot::models::{DedupDecision, NewsItem, PriceSnapshot};
use catalyst_bot::pipeline::{CycleOrchestrator, OrchestratorDeps};
use catalyst_bot::price::{PriceService, QuoteProvider};
use catalyst_bot::storage::{OutcomeLog, Storage};
use catalyst_bot::ticker::TickerResolver;

// ---- fakes ------------------------------------------------------------

struct StaticFeed {
    name: &'static str,
    items: Vec<NewsItem>,
}

#[async_trait]
impl FeedAdapter for StaticFeed {
    fn name(&self) -> &str {
        self.name
    }

    async fn fetch(&self, _ctx: &FetchContext) -> FetchOutcome {
        FetchOutcome {
            items: self.items.clone(),
            diagnostics: FetchDiagnostics {
                source: self.name.to_string(),
                fetched: self.items.len(),
                ..Default::default()
            },
        }
    }
}

struct MapQuotes {
    quotes: HashMap<String, f64>,
}

#[async_trait]
impl QuoteProvider for MapQuotes {
    fn name(&self) -> &'static str {
        "fake-quotes"
    }

    async fn batch(&self, tickers: &[String]) -> Result<HashMap<String, PriceSnapshot>> {
        let now = Utc::now();
        Ok(tickers
            .iter()
            .filter_map(|t| {
                self.quotes.get(t).map(|last| {
                    (
                        t.clone(),
                        PriceSnapshot::new(Some(*last), Some(*last * 0.95), now, "fake-quotes"),
                    )
                })
            })
            .collect())
    }
}

#[derive(Default)]
struct CapturingTransport {
    payloads: Mutex<Vec<Value>>,
}

#[async_trait]
impl AlertTransport for CapturingTransport {
    async fn deliver(
        &self,
        payload_json: &Value,
        _files: Vec<(String, Vec<u8>)>,
    ) -> Result<DeliveryReceipt, DeliveryError> {
        self.payloads.lock().push(payload_json.clone());
        Ok(DeliveryReceipt {
            message_id: Some("m1".to_string()),
        })
    }
}

// ---- harness ----------------------------------------------------------

struct Harness {
    orchestrator: CycleOrchestrator,
    transport: Arc<CapturingTransport>,
    dedup: DedupStore,
    params: Arc<ParamStore>,
    _shutdown_tx: watch::Sender<bool>,
    _tmp: tempfile::TempDir,
}

fn build_harness(
    feeds: Vec<Arc<dyn FeedAdapter>>,
    quotes: HashMap<String, f64>,
    with_charts: bool,
) -> Harness {
    let tmp = tempfile::tempdir().unwrap();
    let storage = Storage::open(&tmp.path().join("test.db")).unwrap();
    let outcomes = OutcomeLog::open(&tmp.path().join("outcomes.jsonl")).unwrap();
    let params = Arc::new(ParamStore::load(storage.clone()).unwrap());
    let dedup = DedupStore::new(storage.clone());

    let listings: HashSet<String> = ["ACME", "ABCD", "GMMA"]
        .iter()
        .map(|s| s.to_string())
        .collect();
    let filer_map: HashMap<String, String> = [("320193".to_string(), "ACME".to_string())].into();
    let resolver = Arc::new(TickerResolver::new(listings, filer_map));

    let prices = Arc::new(PriceService::new(
        vec![Arc::new(MapQuotes { quotes })],
        None,
    ));
    let classifier = Arc::new(Classifier::new(None, None));
    let llm = Arc::new(LlmRouter::new(
        None,
        catalyst_bot::config::LlmModels {
            cheap: "x".into(),
            medium: "x".into(),
            expensive: "x".into(),
            premium: "x".into(),
        },
        storage.clone(),
    ));
    let transport = Arc::new(CapturingTransport::default());
    let dispatcher = Arc::new(Dispatcher::new(transport.clone()));
    let charts = with_charts.then(|| {
        Arc::new(FileChartRenderer::new(tmp.path().join("charts")).unwrap())
            as Arc<dyn catalyst_bot::charts::ChartRenderer>
    });

    let deps = OrchestratorDeps {
        feeds: Arc::new(FeedSet::new(feeds)),
        dedup: dedup.clone(),
        resolver,
        prices,
        classifier,
        llm,
        dispatcher,
        charts,
        outcomes,
        params: params.clone(),
        status_transport: None,
    };
    let (shutdown_tx, rx) = watch::channel(false);
    Harness {
        orchestrator: CycleOrchestrator::new(deps, rx),
        transport,
        dedup,
        params,
        _shutdown_tx: shutdown_tx,
        _tmp: tmp,
    }
}

fn snapshot_with(params: &ParamStore, delta: &[(&str, Value)]) -> Arc<ParamSnapshot> {
    if !delta.is_empty() {
        let delta = delta
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect();
        params.apply(delta, "test", "test-setup").unwrap();
    }
    params.params()
}

async fn run_one(harness: &Harness, snapshot: &ParamSnapshot) -> catalyst_bot::heartbeat::CycleStats {
    harness
        .orchestrator
        .run_cycle(snapshot, Duration::from_secs(60))
        .await
}

fn filing_item(source: &str, source_id: &str, url: &str, title: &str) -> NewsItem {
    let mut item = NewsItem::new(source, source_id, Utc::now(), url, title, "Form 8-K filed")
        .with_filing("0000320193-24-000123");
    item.annotate("cik", json!("0000320193"));
    item
}

// ---- scenarios --------------------------------------------------------

#[tokio::test]
async fn accession_dedup_across_sources_dispatches_once() {
    let archive = filing_item(
        "filings",
        "0000320193-24-000123",
        "https://www.sec.gov/archives/edgar/data/320193/000032019324000123/doc.htm",
        "8-K: Acme Therapeutics merger agreement",
    );
    let viewer = filing_item(
        "filings-mirror",
        "acc-0000320193-24-000123",
        "https://www.sec.gov/cgi-bin/browse-edgar?action=getcompany&accession_number=0000320193-24-000123",
        "Acme Therapeutics files current report on merger",
    );
    let archive_keys = keys_for(&archive);
    let viewer_keys = keys_for(&viewer);

    let harness = build_harness(
        vec![
            Arc::new(StaticFeed {
                name: "filings",
                items: vec![archive],
            }),
            Arc::new(StaticFeed {
                name: "filings-mirror",
                items: vec![viewer],
            }),
        ],
        [("ACME".to_string(), 4.20)].into(),
        false,
    );
    let snapshot = harness.params.params();
    let stats = run_one(&harness, &snapshot).await;

    assert_eq!(stats.alerted, 1, "exactly one alert for one filing");
    assert_eq!(harness.transport.payloads.lock().len(), 1);
    assert_eq!(stats.by_reason.get("SEEN"), Some(&1));

    // Both source_ids are now persisted as seen.
    assert_ne!(
        harness.dedup.check(&archive_keys, 7).unwrap(),
        DedupDecision::Fresh
    );
    assert_ne!(
        harness.dedup.check(&viewer_keys, 7).unwrap(),
        DedupDecision::Fresh
    );

    // A second cycle with the same inputs alerts nothing.
    let stats = run_one(&harness, &snapshot).await;
    assert_eq!(stats.alerted, 0);
}

#[tokio::test]
async fn missing_price_rejects_under_ceiling_and_control_passes() {
    fn contract_item(id: &str, ticker_hint: &str) -> NewsItem {
        NewsItem::new(
            "wire",
            id,
            Utc::now(),
            format!("https://wire.example/{id}"),
            format!("{ticker_hint} wins major contract award from defense agency"),
            "The definitive agreement covers multi-year delivery.",
        )
    }

    // ACME has no quote at all (provider returns nothing for it);
    // ABCD trades at 9.87 under the 10.00 ceiling.
    let harness = build_harness(
        vec![Arc::new(StaticFeed {
            name: "wire",
            items: vec![contract_item("w1", "$ACME"), contract_item("w2", "$ABCD")],
        })],
        [("ABCD".to_string(), 9.87)].into(),
        false,
    );
    let snapshot = harness.params.params();
    assert_eq!(snapshot.price_ceiling, Some(10.0));

    let stats = run_one(&harness, &snapshot).await;
    assert_eq!(stats.alerted, 1, "only the quoted sub-ceiling item passes");
    assert_eq!(
        stats.by_reason.get("PRICE_INVALID_OR_MISSING"),
        Some(&1),
        "missing price is a reject, not a pass: {:?}",
        stats.by_reason
    );

    let payloads = harness.transport.payloads.lock();
    let fields = payloads[0]["embeds"][0]["fields"].as_array().unwrap().clone();
    assert!(fields.iter().any(|f| f["value"] == "$ABCD"));
}

#[tokio::test]
async fn dispatched_alert_declares_its_attachments() {
    let mut item = NewsItem::new(
        "wire",
        "w9",
        Utc::now(),
        "https://wire.example/w9",
        "$ACME receives FDA approval for lead candidate",
        "Approval confirmed by the agency.",
    );
    item.tickers_mentioned = vec!["ACME".to_string()];

    let harness = build_harness(
        vec![Arc::new(StaticFeed {
            name: "wire",
            items: vec![item],
        })],
        [("ACME".to_string(), 3.10)].into(),
        true, // charts on: the embed references attachment:// files
    );
    let snapshot = harness.params.params();
    let stats = run_one(&harness, &snapshot).await;
    assert_eq!(stats.alerted, 1);

    let payloads = harness.transport.payloads.lock();
    let payload = &payloads[0];
    let embed_image = payload["embeds"][0]["image"]["url"].as_str().unwrap();
    assert!(embed_image.starts_with("attachment://"));

    let attachments = payload["attachments"].as_array().unwrap();
    assert!(!attachments.is_empty(), "attachments array must be declared");
    let declared: Vec<&str> = attachments
        .iter()
        .map(|a| a["filename"].as_str().unwrap())
        .collect();
    let referenced = embed_image.trim_start_matches("attachment://");
    assert!(declared.contains(&referenced));
    // Ids are unique integers starting at 0.
    let ids: Vec<u64> = attachments.iter().map(|a| a["id"].as_u64().unwrap()).collect();
    assert_eq!(ids[0], 0);
    let mut deduped = ids.clone();
    deduped.dedup();
    assert_eq!(deduped.len(), ids.len());
}

#[tokio::test]
async fn negative_catalyst_bypasses_min_score_gate() {
    fn wire_item(id: &str, title: &str) -> NewsItem {
        NewsItem::new(
            "wire",
            id,
            Utc::now(),
            format!("https://wire.example/{id}"),
            title,
            "",
        )
    }

    let harness = build_harness(
        vec![Arc::new(StaticFeed {
            name: "wire",
            items: vec![
                // Severe-negative keyword: bypasses MIN_SCORE.
                wire_item("n1", "$ACME announces dilution through direct offering"),
                // Benign single keyword, mildly positive: blocked by MIN_SCORE.
                wire_item("n2", "$ABCD signs partnership"),
            ],
        })],
        [("ACME".to_string(), 2.0), ("ABCD".to_string(), 2.0)].into(),
        false,
    );
    // Raise MIN_SCORE above both items' keyword scores so only the
    // bypass can let one through.
    let snapshot = snapshot_with(&harness.params, &[(schema::MIN_SCORE, json!(0.60))]);

    let stats = run_one(&harness, &snapshot).await;
    assert_eq!(stats.alerted, 1, "only the negative catalyst passes");
    assert_eq!(stats.by_reason.get("MIN_SCORE"), Some(&1));

    let payloads = harness.transport.payloads.lock();
    assert!(payloads[0]["embeds"][0]["title"]
        .as_str()
        .unwrap()
        .contains("dilution"));
}

#[tokio::test]
async fn per_cycle_cap_defers_without_marking_seen() {
    // Three genuinely distinct stories: near-identical titles would be
    // collapsed by the fuzzy signature match, which is not under test.
    let titles = [
        "$ACME receives FDA approval for its lead oncology candidate",
        "$ACME enters definitive merger agreement with Beta Corporation",
        "$ACME wins large defense contract award for drone components",
    ];
    let items: Vec<NewsItem> = titles
        .iter()
        .enumerate()
        .map(|(i, title)| {
            NewsItem::new(
                "wire",
                format!("c{i}"),
                Utc::now(),
                format!("https://wire.example/c{i}"),
                *title,
                format!("Body {i}"),
            )
        })
        .collect();
    let item_keys: Vec<_> = items.iter().map(keys_for).collect();

    let harness = build_harness(
        vec![Arc::new(StaticFeed {
            name: "wire",
            items,
        })],
        [("ACME".to_string(), 2.0)].into(),
        false,
    );
    let snapshot = snapshot_with(
        &harness.params,
        &[(schema::MAX_ALERTS_PER_CYCLE, json!(1))],
    );

    let stats = run_one(&harness, &snapshot).await;
    assert_eq!(stats.alerted, 1);
    assert_eq!(stats.deferred, 2);

    // Deferred items were not marked seen; exactly one key is persisted.
    let seen: usize = item_keys
        .iter()
        .filter(|keys| harness.dedup.check(keys, 7).unwrap() != DedupDecision::Fresh)
        .count();
    assert_eq!(seen, 1);

    // The next cycle picks up one more of the deferred stories.
    let stats = run_one(&harness, &snapshot).await;
    assert_eq!(stats.alerted, 1);
}
