//! Classifier: keyword catalysts plus aggregated multi-source sentiment.

pub mod keywords;
pub mod sentiment;

use parking_lot::RwLock;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::ParamSnapshot;
use crate::models::{ClassifiedItem, LlmVerdict, NewsItem};
use self::keywords::KeywordCatalog;
use self::sentiment::{aggregate, collect_parts, total_weight, MlSentimentModel, SOURCE_LLM};

pub struct Classifier {
    catalog: RwLock<KeywordCatalog>,
    ml: Option<Arc<dyn MlSentimentModel>>,
    weights_path: Option<PathBuf>,
}

impl Classifier {
    pub fn new(ml: Option<Arc<dyn MlSentimentModel>>, weights_path: Option<PathBuf>) -> Self {
        let classifier = Self {
            catalog: RwLock::new(KeywordCatalog::builtin()),
            ml,
            weights_path,
        };
        classifier.reload_dynamic_weights();
        classifier
    }

    /// Rebuild the catalog from the builtin table plus the overlay file.
    /// Called at startup and periodically by the orchestrator.
    pub fn reload_dynamic_weights(&self) {
        let Some(path) = &self.weights_path else {
            return;
        };
        match KeywordCatalog::load_overlay(path) {
            Ok(overlay) => {
                let mut catalog = KeywordCatalog::builtin();
                catalog.merge_overlay(&overlay);
                *self.catalog.write() = catalog;
                info!(path = %path.display(), "Keyword catalog refreshed");
            }
            Err(e) => warn!(error = %e, "Dynamic keyword weights unavailable, keeping catalog"),
        }
    }

    pub fn classify(&self, item: NewsItem, params: &ParamSnapshot) -> ClassifiedItem {
        let text = format!("{}. {}", item.title, item.summary);
        let catalog = self.catalog.read();
        let keyword_score = catalog.score(&text);
        let severe_negative = catalog.has_severe_negative(&keyword_score.hits);
        drop(catalog);

        let parts = collect_parts(&item, params, self.ml.as_deref());
        let agg = aggregate(&parts, total_weight(params));

        let mut score = keyword_score.score;
        if params.enable_sector_multipliers {
            if let Some(sector) = item.annotations.get("sector").and_then(|v| v.as_str()) {
                if let Some(multiplier) = params.sector_multipliers.get(sector) {
                    score *= multiplier;
                }
            }
        }

        let mut classified = ClassifiedItem::new(item, score, agg.sentiment, agg.confidence);
        classified.categories = keyword_score.by_category.keys().cloned().collect();
        classified.keywords_hit = keyword_score.hits;
        classified.sentiment_breakdown = agg.breakdown;
        classified.bypass_min_score =
            evaluate_bypass(&classified, severe_negative, params);
        classified
    }

    /// Fold a routed verdict into an already-classified item: add the
    /// llm breakdown entry, recompute the weighted sentiment, nudge
    /// confidence, and re-evaluate the negative-catalyst override.
    pub fn apply_llm_verdict(
        &self,
        classified: &mut ClassifiedItem,
        verdict: LlmVerdict,
        params: &ParamSnapshot,
    ) {
        let w_llm = params.sentiment_weight_llm;
        if w_llm > 0.0 {
            let mut weighted = w_llm * verdict.sentiment;
            let mut present = w_llm;
            for (source, value) in &classified.sentiment_breakdown {
                let weight = match source.as_str() {
                    sentiment::SOURCE_LEXICON => params.sentiment_weight_lexicon,
                    sentiment::SOURCE_ML => params.sentiment_weight_ml,
                    sentiment::SOURCE_EARNINGS => params.sentiment_weight_earnings,
                    _ => 0.0,
                };
                weighted += weight * value;
                present += weight;
            }
            if present > 0.0 {
                classified.set_sentiment(weighted / present);
            }
            classified
                .sentiment_breakdown
                .insert(SOURCE_LLM.to_string(), verdict.sentiment);
            // One more corroborating source: confidence may only rise.
            let bump = (1.0 - sentiment::CONFIDENCE_FLOOR) * w_llm * verdict.confidence
                / total_weight(params).max(1e-9);
            classified.set_confidence(classified.confidence + bump);
        }

        let catalog = self.catalog.read();
        let severe = catalog.has_severe_negative(&classified.keywords_hit);
        drop(catalog);
        classified.item.annotate("llm_label", serde_json::json!(verdict.label));
        classified.bypass_min_score = evaluate_bypass(classified, severe, params);
        classified.llm = Some(verdict);
    }
}

/// Negative-catalyst override: strongly negative aggregate sentiment, a
/// severe-negative catalog hit, or any configured critical-negative
/// keyword in the hits or the title.
fn evaluate_bypass(
    classified: &ClassifiedItem,
    severe_negative_hit: bool,
    params: &ParamSnapshot,
) -> bool {
    if classified.sentiment <= params.strong_negative_threshold {
        return true;
    }
    if severe_negative_hit {
        return true;
    }
    let title = classified.item.title.to_lowercase();
    params.critical_negative_keywords.iter().any(|kw| {
        let kw = kw.to_lowercase();
        title.contains(&kw)
            || classified
                .keywords_hit
                .iter()
                .any(|hit| hit.tag.contains(&kw) || kw.contains(&hit.tag))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn item(title: &str, summary: &str) -> NewsItem {
        NewsItem::new("wire", "t1", Utc::now(), "https://e.x/a", title, summary)
    }

    fn classifier() -> Classifier {
        Classifier::new(None, None)
    }

    #[test]
    fn fda_catalyst_scores_high_and_positive() {
        let params = ParamSnapshot::default();
        let classified = classifier().classify(
            item(
                "Acme receives FDA approval for lead drug",
                "Shares expected to benefit from the approval win.",
            ),
            &params,
        );
        assert!(classified.score > 0.4);
        assert!(classified.sentiment > 0.0);
        assert!(classified.categories.contains("fda"));
        assert!(!classified.bypass_min_score);
    }

    #[test]
    fn dilution_sets_bypass_even_with_low_score() {
        let params = ParamSnapshot::default();
        let classified = classifier().classify(
            item("Acme announces dilution via direct offering", ""),
            &params,
        );
        assert!(classified.bypass_min_score);
    }

    #[test]
    fn strong_negative_sentiment_sets_bypass() {
        let params = ParamSnapshot::default();
        let classified = classifier().classify(
            item(
                "Acme shares plunge after devastating trial failure",
                "Catastrophic losses; the disappointing data wipes out the program.",
            ),
            &params,
        );
        assert!(classified.sentiment < 0.0);
        if classified.sentiment <= params.strong_negative_threshold {
            assert!(classified.bypass_min_score);
        }
    }

    #[test]
    fn scores_are_never_nan() {
        let params = ParamSnapshot::default();
        let classified = classifier().classify(item("", ""), &params);
        assert!(classified.score.is_finite());
        assert!(classified.sentiment.is_finite());
        assert!(classified.confidence.is_finite());
    }

    #[test]
    fn sector_multiplier_applies_when_enabled() {
        let mut values = crate::config::schema::default_values();
        values.insert(
            crate::config::schema::ENABLE_SECTOR_MULTIPLIERS.to_string(),
            serde_json::json!(true),
        );
        values.insert(
            crate::config::schema::SECTOR_MULTIPLIERS.to_string(),
            serde_json::json!({"biotech": 1.5}),
        );
        let params = ParamSnapshot::from_values(1, &values);

        let mut tagged = item("Acme receives FDA approval", "");
        tagged.annotate("sector", serde_json::json!("biotech"));
        let plain = item("Acme receives FDA approval", "");

        let c = classifier();
        let boosted = c.classify(tagged, &params);
        let base = c.classify(plain, &params);
        assert!(boosted.score > base.score);
    }

    #[test]
    fn llm_verdict_folds_into_sentiment_and_breakdown() {
        let params = ParamSnapshot::default();
        let c = classifier();
        let mut classified = c.classify(
            item("Acme wins large contract award", "Solid positive development."),
            &params,
        );
        let before_sentiment = classified.sentiment;
        let before_confidence = classified.confidence;

        c.apply_llm_verdict(
            &mut classified,
            LlmVerdict {
                sentiment: 1.0,
                confidence: 0.9,
                label: "bullish".to_string(),
                cached: false,
            },
            &params,
        );
        assert!(classified.sentiment_breakdown.contains_key("llm"));
        assert!(classified.sentiment >= before_sentiment);
        assert!(classified.confidence >= before_confidence);
        assert_eq!(classified.llm.as_ref().unwrap().label, "bullish");
    }
}
