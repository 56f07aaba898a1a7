//! Multi-source sentiment aggregation.
//!
//! Independent sources each produce a value in [-1, 1] plus a per-item
//! confidence; the aggregate is the weight-normalized sum over sources
//! that are actually present. Missing sources are omitted entirely.

use std::collections::BTreeMap;

use crate::config::ParamSnapshot;
use crate::models::{scrub_signed, scrub_unit, NewsItem};

pub const SOURCE_LEXICON: &str = "lexicon";
pub const SOURCE_ML: &str = "ml";
pub const SOURCE_EARNINGS: &str = "earnings";
pub const SOURCE_LLM: &str = "llm";

/// Confidence floor when no sources fired at all.
pub const CONFIDENCE_FLOOR: f64 = 0.3;

#[derive(Debug, Clone, PartialEq)]
pub struct SentimentSignal {
    pub value: f64,
    pub confidence: f64,
    pub label: Option<String>,
}

impl SentimentSignal {
    pub fn new(value: f64, confidence: f64) -> Self {
        Self {
            value: scrub_signed(value),
            confidence: scrub_unit(confidence),
            label: None,
        }
    }

    pub fn labeled(value: f64, confidence: f64, label: impl Into<String>) -> Self {
        Self {
            label: Some(label.into()),
            ..Self::new(value, confidence)
        }
    }
}

/// Optional plug-in sentiment model (e.g. a finetuned classifier served
/// out of process). Registered by name at startup.
pub trait MlSentimentModel: Send + Sync {
    fn name(&self) -> &'static str;
    fn score(&self, title: &str, summary: &str) -> Option<SentimentSignal>;
}

/// Lexicon source; always available.
pub fn lexicon_sentiment(text: &str) -> SentimentSignal {
    let analyzer = vader_sentiment::SentimentIntensityAnalyzer::new();
    let scores = analyzer.polarity_scores(text);
    let compound = scores.get("compound").copied().unwrap_or(0.0);
    // Neutral text carries little information; scale confidence with
    // polarity magnitude.
    SentimentSignal::new(compound, 0.4 + 0.5 * compound.abs())
}

const EARNINGS_MARKERS: &[&str] = &[
    "earnings", "eps", "revenue", "guidance", "quarter", "q1 ", "q2 ", "q3 ", "q4 ", "fiscal",
];
const EARNINGS_POSITIVE: &[&str] = &[
    "beats", "beat ", "tops", "exceeds", "record", "raises", "raised", "above expectations",
    "up year-over-year",
];
const EARNINGS_NEGATIVE: &[&str] = &[
    "misses", "miss ", "falls short", "below expectations", "cuts", "lowered", "lowers",
    "withdraws guidance", "down year-over-year",
];

/// Earnings heuristic; fires only on earnings-style items.
pub fn earnings_sentiment(title: &str, summary: &str) -> Option<SentimentSignal> {
    let text = format!("{} {}", title.to_lowercase(), summary.to_lowercase());
    if !EARNINGS_MARKERS.iter().any(|m| text.contains(m)) {
        return None;
    }
    let positive = EARNINGS_POSITIVE.iter().filter(|c| text.contains(**c)).count() as f64;
    let negative = EARNINGS_NEGATIVE.iter().filter(|c| text.contains(**c)).count() as f64;
    if positive == 0.0 && negative == 0.0 {
        return None;
    }
    let value = (positive - negative) / (positive + negative);
    let label = if value > 0.0 { "beat" } else if value < 0.0 { "miss" } else { "mixed" };
    Some(SentimentSignal::labeled(
        value,
        0.5 + 0.1 * (positive + negative).min(3.0),
        label,
    ))
}

/// One present source with its configured weight.
#[derive(Debug, Clone)]
pub struct SentimentPart {
    pub source: &'static str,
    pub weight: f64,
    pub signal: SentimentSignal,
}

#[derive(Debug, Clone)]
pub struct Aggregate {
    pub sentiment: f64,
    pub confidence: f64,
    /// Raw per-source values (unweighted), present sources only.
    pub breakdown: BTreeMap<String, f64>,
}

/// Weight-normalized aggregation.
///
/// `sentiment = Σ wᵢ·xᵢ / Σ wᵢ` over present sources.
/// `confidence = floor + (1 - floor) · Σ wᵢ·cᵢ / W_total`, where `W_total`
/// is the sum of all configured weights — adding a source can only raise
/// confidence, and with nothing present it sits at the floor.
pub fn aggregate(parts: &[SentimentPart], total_weight: f64) -> Aggregate {
    let present_weight: f64 = parts.iter().map(|p| p.weight).sum();
    let mut breakdown = BTreeMap::new();
    if present_weight <= 0.0 {
        return Aggregate {
            sentiment: 0.0,
            confidence: CONFIDENCE_FLOOR,
            breakdown,
        };
    }
    let mut weighted_value = 0.0;
    let mut weighted_conf = 0.0;
    for part in parts {
        weighted_value += part.weight * part.signal.value;
        weighted_conf += part.weight * part.signal.confidence;
        breakdown.insert(part.source.to_string(), part.signal.value);
    }
    let sentiment = scrub_signed(weighted_value / present_weight);
    let total = total_weight.max(present_weight).max(1e-9);
    let confidence = scrub_unit(CONFIDENCE_FLOOR + (1.0 - CONFIDENCE_FLOOR) * weighted_conf / total);
    Aggregate {
        sentiment,
        confidence,
        breakdown,
    }
}

/// Collect the present sources for one item under the current weights.
pub fn collect_parts(
    item: &NewsItem,
    params: &ParamSnapshot,
    ml: Option<&dyn MlSentimentModel>,
) -> Vec<SentimentPart> {
    let mut parts = Vec::with_capacity(4);
    let text = format!("{}. {}", item.title, item.summary);

    if params.sentiment_weight_lexicon > 0.0 {
        parts.push(SentimentPart {
            source: SOURCE_LEXICON,
            weight: params.sentiment_weight_lexicon,
            signal: lexicon_sentiment(&text),
        });
    }
    if params.sentiment_weight_ml > 0.0 {
        if let Some(model) = ml {
            if let Some(signal) = model.score(&item.title, &item.summary) {
                parts.push(SentimentPart {
                    source: SOURCE_ML,
                    weight: params.sentiment_weight_ml,
                    signal,
                });
            }
        }
    }
    if params.sentiment_weight_earnings > 0.0 {
        if let Some(signal) = earnings_sentiment(&item.title, &item.summary) {
            parts.push(SentimentPart {
                source: SOURCE_EARNINGS,
                weight: params.sentiment_weight_earnings,
                signal,
            });
        }
    }
    parts
}

/// Sum of all configured source weights, present or not.
pub fn total_weight(params: &ParamSnapshot) -> f64 {
    params.sentiment_weight_lexicon
        + params.sentiment_weight_ml
        + params.sentiment_weight_earnings
        + params.sentiment_weight_llm
}
