//! Weighted keyword catalog.
//!
//! Static catalog of catalyst tags, optionally overlaid by a dynamic
//! weight file. Merge policy: the file overrides the catalog for
//! overlapping tags and is unioned in otherwise.

use anyhow::{Context, Result};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use tracing::info;

use crate::models::KeywordHit;

#[derive(Debug, Clone)]
pub struct KeywordSpec {
    pub weight: f64,
    pub category: String,
    /// Severe negatives participate in the negative-catalyst override.
    pub severe_negative: bool,
}

#[derive(Debug, Clone)]
pub struct KeywordCatalog {
    entries: HashMap<String, KeywordSpec>,
}

fn spec(weight: f64, category: &str, severe_negative: bool) -> KeywordSpec {
    KeywordSpec {
        weight,
        category: category.to_string(),
        severe_negative,
    }
}

impl KeywordCatalog {
    /// The built-in tag catalog. Tags are matched as lowercase substrings
    /// of the title and summary.
    pub fn builtin() -> Self {
        let mut entries = HashMap::new();
        let mut add = |tag: &str, s: KeywordSpec| {
            entries.insert(tag.to_string(), s);
        };

        add("fda approval", spec(0.90, "fda", false));
        add("fda clearance", spec(0.85, "fda", false));
        add("breakthrough designation", spec(0.80, "fda", false));
        add("phase 3", spec(0.70, "fda", false));
        add("phase 2", spec(0.55, "fda", false));
        add("merger", spec(0.75, "merger", false));
        add("acquisition", spec(0.70, "merger", false));
        add("definitive agreement", spec(0.75, "merger", false));
        add("buyout", spec(0.70, "merger", false));
        add("contract award", spec(0.60, "contract", false));
        add("awarded contract", spec(0.60, "contract", false));
        add("contract win", spec(0.60, "contract", false));
        add("partnership", spec(0.50, "partnership", false));
        add("collaboration agreement", spec(0.50, "partnership", false));
        add("record revenue", spec(0.55, "earnings", false));
        add("raises guidance", spec(0.65, "earnings", false));
        add("beats estimates", spec(0.60, "earnings", false));
        add("uplisting", spec(0.65, "uplisting", false));
        add("uplist", spec(0.60, "uplisting", false));
        add("share buyback", spec(0.50, "buyback", false));
        add("repurchase program", spec(0.45, "buyback", false));

        add("offering", spec(0.55, "dilution", true));
        add("public offering", spec(0.60, "dilution", true));
        add("registered direct", spec(0.55, "dilution", true));
        add("dilution", spec(0.60, "dilution", true));
        add("at-the-market", spec(0.50, "dilution", true));
        add("bankruptcy", spec(0.80, "bankruptcy", true));
        add("chapter 11", spec(0.80, "bankruptcy", true));
        add("delisting", spec(0.70, "delisting", true));
        add("delisted", spec(0.70, "delisting", true));
        add("going concern", spec(0.65, "bankruptcy", true));
        add("reverse split", spec(0.55, "dilution", true));

        Self { entries }
    }

    /// Apply a dynamic weight overlay (JSON object of tag -> weight).
    pub fn merge_overlay(&mut self, overlay: &HashMap<String, f64>) {
        for (tag, weight) in overlay {
            let weight = weight.clamp(0.0, 1.0);
            let tag_lower = tag.to_lowercase();
            match self.entries.get_mut(&tag_lower) {
                Some(existing) => existing.weight = weight,
                None => {
                    self.entries
                        .insert(tag_lower, spec(weight, "dynamic", false));
                }
            }
        }
    }

    pub fn load_overlay(path: &Path) -> Result<HashMap<String, f64>> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("read keyword weights at {}", path.display()))?;
        let overlay: HashMap<String, f64> =
            serde_json::from_str(&raw).context("parse keyword weights json")?;
        info!(count = overlay.len(), "Dynamic keyword weights loaded");
        Ok(overlay)
    }

    /// Scan text for catalog tags. Returns hits, raw per-category
    /// contributions and the total mapped into [0, 1).
    pub fn score(&self, text: &str) -> KeywordScore {
        let haystack = text.to_lowercase();
        let mut hits = Vec::new();
        let mut by_category: BTreeMap<String, f64> = BTreeMap::new();
        let mut total = 0.0;
        for (tag, spec) in &self.entries {
            if haystack.contains(tag.as_str()) {
                hits.push(KeywordHit {
                    tag: tag.clone(),
                    weight: spec.weight,
                    category: spec.category.clone(),
                });
                *by_category.entry(spec.category.clone()).or_insert(0.0) += spec.weight;
                total += spec.weight;
            }
        }
        hits.sort_by(|a, b| a.tag.cmp(&b.tag));
        KeywordScore {
            // Saturating map: monotone in total weight, bounded below 1.
            score: total / (total + 1.0),
            hits,
            by_category,
        }
    }

    /// True when any hit tag is flagged severe-negative in the catalog.
    pub fn has_severe_negative(&self, hits: &[KeywordHit]) -> bool {
        hits.iter().any(|hit| {
            self.entries
                .get(&hit.tag)
                .is_some_and(|spec| spec.severe_negative)
        })
    }
}

#[derive(Debug, Clone)]
pub struct KeywordScore {
    pub score: f64,
    pub hits: Vec<KeywordHit>,
    pub by_category: BTreeMap<String, f64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scores_known_catalysts() {
        let catalog = KeywordCatalog::builtin();
        let result = catalog.score("Acme wins FDA approval after Phase 3 readout");
        assert_eq!(result.hits.len(), 2);
        assert!(result.score > 0.5);
        assert!(result.by_category.contains_key("fda"));
    }

    #[test]
    fn no_hits_scores_zero() {
        let catalog = KeywordCatalog::builtin();
        let result = catalog.score("Company appoints new regional sales manager");
        assert!(result.hits.is_empty());
        assert_eq!(result.score, 0.0);
    }

    #[test]
    fn score_is_bounded() {
        let catalog = KeywordCatalog::builtin();
        let result = catalog.score(
            "merger acquisition fda approval phase 3 contract win uplisting \
             record revenue raises guidance partnership share buyback",
        );
        assert!(result.score < 1.0);
        assert!(result.score > 0.7);
    }

    #[test]
    fn overlay_overrides_and_unions() {
        let mut catalog = KeywordCatalog::builtin();
        let overlay: HashMap<String, f64> =
            [("merger".to_string(), 0.1), ("moon launch".to_string(), 0.4)].into();
        catalog.merge_overlay(&overlay);

        let merger = catalog.score("definitive merger announced");
        let hit = merger.hits.iter().find(|h| h.tag == "merger").unwrap();
        assert!((hit.weight - 0.1).abs() < 1e-12);

        let dynamic = catalog.score("surprise moon launch today");
        assert_eq!(dynamic.hits.len(), 1);
        assert_eq!(dynamic.hits[0].category, "dynamic");
    }

    #[test]
    fn severe_negative_detection() {
        let catalog = KeywordCatalog::builtin();
        let result = catalog.score("Company announces public offering of common stock");
        assert!(catalog.has_severe_negative(&result.hits));
        let benign = catalog.score("Company wins contract award");
        assert!(!catalog.has_severe_negative(&benign.hits));
    }
}
