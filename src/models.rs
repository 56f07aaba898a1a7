//! Core data types flowing through the catalyst pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

/// Normalized unit produced by every feed adapter.
///
/// Identity is `(source, source_id)`; for filings `source_id` is the
/// accession number, otherwise a hash over the canonical URL and title.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewsItem {
    pub source: String,
    pub source_id: String,
    pub published_at: DateTime<Utc>,
    pub url: String,
    pub title: String,
    pub summary: String,
    /// Primary resolved ticker (set by the resolver).
    pub ticker: Option<String>,
    /// All distinct tickers the item maps to.
    pub tickers_mentioned: Vec<String>,
    pub is_filing: bool,
    pub accession_no: Option<String>,
    /// Mutable enrichment outputs (sentiment breakdown, LLM verdict, ...).
    #[serde(default)]
    pub annotations: serde_json::Map<String, serde_json::Value>,
}

impl NewsItem {
    pub fn new(
        source: impl Into<String>,
        source_id: impl Into<String>,
        published_at: DateTime<Utc>,
        url: impl Into<String>,
        title: impl Into<String>,
        summary: impl Into<String>,
    ) -> Self {
        Self {
            source: source.into(),
            source_id: source_id.into(),
            published_at,
            url: url.into(),
            title: title.into(),
            summary: summary.into(),
            ticker: None,
            tickers_mentioned: Vec::new(),
            is_filing: false,
            accession_no: None,
            annotations: serde_json::Map::new(),
        }
    }

    pub fn with_filing(mut self, accession_no: impl Into<String>) -> Self {
        self.is_filing = true;
        self.accession_no = Some(accession_no.into());
        self
    }

    pub fn annotate(&mut self, key: &str, value: serde_json::Value) {
        self.annotations.insert(key.to_string(), value);
    }

    pub fn age_minutes(&self, now: DateTime<Utc>) -> i64 {
        (now - self.published_at).num_minutes()
    }
}

/// One matched keyword tag with its effective weight.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeywordHit {
    pub tag: String,
    pub weight: f64,
    pub category: String,
}

/// Optional verdict contributed by the LLM router.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmVerdict {
    /// Sentiment contribution in [-1, 1].
    pub sentiment: f64,
    pub confidence: f64,
    pub label: String,
    pub cached: bool,
}

/// NewsItem plus its scoring envelope.
///
/// `score`, `sentiment` and `confidence` are scrubbed at construction:
/// non-finite inputs collapse to the neutral value and everything is
/// clamped to its documented range.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifiedItem {
    pub item: NewsItem,
    pub score: f64,
    pub sentiment: f64,
    pub confidence: f64,
    pub keywords_hit: Vec<KeywordHit>,
    /// Per-source sentiment contributions; absent sources are omitted,
    /// never encoded as zero.
    pub sentiment_breakdown: BTreeMap<String, f64>,
    pub categories: BTreeSet<String>,
    pub bypass_min_score: bool,
    pub price: Option<PriceSnapshot>,
    pub llm: Option<LlmVerdict>,
}

impl ClassifiedItem {
    pub fn new(item: NewsItem, score: f64, sentiment: f64, confidence: f64) -> Self {
        Self {
            item,
            score: scrub_unit(score),
            sentiment: scrub_signed(sentiment),
            confidence: scrub_unit(confidence),
            keywords_hit: Vec::new(),
            sentiment_breakdown: BTreeMap::new(),
            categories: BTreeSet::new(),
            bypass_min_score: false,
            price: None,
            llm: None,
        }
    }

    pub fn set_score(&mut self, score: f64) {
        self.score = scrub_unit(score);
    }

    pub fn set_sentiment(&mut self, sentiment: f64) {
        self.sentiment = scrub_signed(sentiment);
    }

    pub fn set_confidence(&mut self, confidence: f64) {
        self.confidence = scrub_unit(confidence);
    }
}

/// Clamp to [0, 1]; NaN/Inf become 0.
pub fn scrub_unit(v: f64) -> f64 {
    if v.is_finite() {
        v.clamp(0.0, 1.0)
    } else {
        0.0
    }
}

/// Clamp to [-1, 1]; NaN/Inf become 0.
pub fn scrub_signed(v: f64) -> f64 {
    if v.is_finite() {
        v.clamp(-1.0, 1.0)
    } else {
        0.0
    }
}

/// Quote for one ticker. Every number is finite or absent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceSnapshot {
    pub last: Option<f64>,
    pub prev_close: Option<f64>,
    pub change_pct: Option<f64>,
    pub as_of: DateTime<Utc>,
    pub provider: String,
}

impl PriceSnapshot {
    /// Build a snapshot, converting non-finite inputs to explicit `None`.
    pub fn new(
        last: Option<f64>,
        prev_close: Option<f64>,
        as_of: DateTime<Utc>,
        provider: impl Into<String>,
    ) -> Self {
        let last = last.filter(|v| v.is_finite());
        let prev_close = prev_close.filter(|v| v.is_finite());
        let change_pct = match (last, prev_close) {
            (Some(l), Some(p)) if p != 0.0 => {
                let pct = (l - p) / p * 100.0;
                pct.is_finite().then_some(pct)
            }
            _ => None,
        };
        Self {
            last,
            prev_close,
            change_pct,
            as_of,
            provider: provider.into(),
        }
    }
}

/// Outcome of a dedup check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DedupDecision {
    Fresh,
    SeenById,
    SeenBySig,
}

/// Named reason an item was rejected by the filter chain (or upstream).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RejectReason {
    Seen,
    MultiTicker,
    PresentationNoise,
    Commentary,
    SourceBlocklist,
    NoTicker,
    OtcTicker,
    ForeignAdr,
    InstrumentLike,
    PriceInvalidOrMissing,
    PriceCeiling,
    PriceFloor,
    MinScore,
    MinSentAbs,
    CategoryNotAllowed,
    StaleArticle,
    FilterError,
    InternalError,
}

impl RejectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectReason::Seen => "SEEN",
            RejectReason::MultiTicker => "MULTI_TICKER",
            RejectReason::PresentationNoise => "PRESENTATION_NOISE",
            RejectReason::Commentary => "COMMENTARY",
            RejectReason::SourceBlocklist => "SOURCE_BLOCKLIST",
            RejectReason::NoTicker => "NO_TICKER",
            RejectReason::OtcTicker => "OTC_TICKER",
            RejectReason::ForeignAdr => "FOREIGN_ADR",
            RejectReason::InstrumentLike => "INSTRUMENT_LIKE",
            RejectReason::PriceInvalidOrMissing => "PRICE_INVALID_OR_MISSING",
            RejectReason::PriceCeiling => "PRICE_CEILING",
            RejectReason::PriceFloor => "PRICE_FLOOR",
            RejectReason::MinScore => "MIN_SCORE",
            RejectReason::MinSentAbs => "MIN_SENT_ABS",
            RejectReason::CategoryNotAllowed => "CATEGORY_ALLOW",
            RejectReason::StaleArticle => "STALE_ARTICLE",
            RejectReason::FilterError => "FILTER_ERROR",
            RejectReason::InternalError => "INTERNAL_ERROR",
        }
    }
}

/// What the pipeline ultimately did with an item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Dispatched,
    Rejected,
    Deferred,
    Failed,
}

impl Decision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Decision::Dispatched => "dispatched",
            Decision::Rejected => "rejected",
            Decision::Deferred => "deferred",
            Decision::Failed => "failed",
        }
    }
}

/// Durable record of what the pipeline decided about one item.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutcomeRecord {
    pub ts: DateTime<Utc>,
    pub ticker: Option<String>,
    pub decision: Decision,
    pub reasons: Vec<String>,
    pub score: f64,
    pub sentiment: f64,
    pub price: Option<f64>,
    pub source: String,
    pub categories: Vec<String>,
}

/// Declaration of one file part in the outgoing multipart payload.
///
/// The webhook silently drops attachments whose embed reference is not
/// declared here, so the builder always emits one entry per file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttachmentDecl {
    pub id: u32,
    pub filename: String,
    pub description: String,
}

/// Fully composed alert ready for delivery.
#[derive(Debug, Clone)]
pub struct AlertArtifact {
    pub embed: serde_json::Value,
    pub attachments: Vec<AttachmentDecl>,
    /// File paths aligned positionally with `attachments` ids. Absolute.
    pub files: Vec<PathBuf>,
    pub components: Option<serde_json::Value>,
    pub idempotency_key: String,
}

impl AlertArtifact {
    /// The JSON part of the multipart request.
    pub fn payload_json(&self) -> serde_json::Value {
        let mut payload = serde_json::json!({
            "embeds": [self.embed],
            "attachments": self.attachments,
        });
        if let Some(components) = &self.components {
            payload["components"] = components.clone();
        }
        payload
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn price_snapshot_scrubs_nan() {
        let snap = PriceSnapshot::new(Some(f64::NAN), Some(4.2), Utc::now(), "test");
        assert_eq!(snap.last, None);
        assert_eq!(snap.prev_close, Some(4.2));
        assert_eq!(snap.change_pct, None);
    }

    #[test]
    fn price_snapshot_change_pct() {
        let snap = PriceSnapshot::new(Some(11.0), Some(10.0), Utc::now(), "test");
        let pct = snap.change_pct.unwrap();
        assert!((pct - 10.0).abs() < 1e-9);
    }

    #[test]
    fn price_snapshot_zero_prev_close() {
        let snap = PriceSnapshot::new(Some(1.0), Some(0.0), Utc::now(), "test");
        assert_eq!(snap.change_pct, None);
    }

    #[test]
    fn classified_item_scrubs_scores() {
        let item = NewsItem::new("wire", "x1", Utc::now(), "https://e.x/a", "t", "s");
        let classified = ClassifiedItem::new(item, f64::INFINITY, f64::NAN, 1.7);
        assert_eq!(classified.score, 0.0);
        assert_eq!(classified.sentiment, 0.0);
        assert_eq!(classified.confidence, 1.0);
    }

    #[test]
    fn payload_json_includes_attachments_array() {
        let artifact = AlertArtifact {
            embed: serde_json::json!({"title": "x"}),
            attachments: vec![AttachmentDecl {
                id: 0,
                filename: "chart.png".to_string(),
                description: "Chart".to_string(),
            }],
            files: vec![PathBuf::from("/tmp/chart.png")],
            components: None,
            idempotency_key: "k".to_string(),
        };
        let payload = artifact.payload_json();
        assert_eq!(payload["attachments"][0]["filename"], "chart.png");
        assert_eq!(payload["attachments"][0]["id"], 0);
    }
}
