//! Ordered filter chain.
//!
//! Gates run in a fixed order so cheap structural rejects never pay for
//! price or LLM work: SEEN → MULTI_TICKER → PRESENTATION_NOISE →
//! COMMENTARY → SOURCE_BLOCKLIST → NO_TICKER → OTC/ADR → INSTRUMENT →
//! price gates → MIN_SCORE → MIN_SENT_ABS → CATEGORY_ALLOW.
//!
//! A gate that panics rejects the item with FILTER_ERROR and the cycle
//! continues.

use std::panic::{catch_unwind, AssertUnwindSafe};
use tracing::error;

use crate::config::ParamSnapshot;
use crate::models::{ClassifiedItem, DedupDecision, NewsItem, RejectReason};
use crate::ticker::{Resolution, TickerReject};

/// Conference-presentation noise; kept unless material terms appear.
const PRESENTATION_PATTERNS: &[&str] = &[
    "to present at",
    "will present at",
    "presenting at",
    "to participate in",
    "fireside chat",
    "investor conference",
    "annual conference",
];

const MATERIAL_TERMS: &[&str] = &[
    "approval", "contract", "merger", "acquisition", "offering", "results", "data", "guidance",
    "clearance", "partnership",
];

/// Opinion/commentary shapes that are not catalysts.
const COMMENTARY_PATTERNS: &[&str] = &[
    "why ",
    "what to know",
    "here's what",
    "stocks to watch",
    "stocks to buy",
    "top stocks",
    "is it a buy",
    "should you buy",
    "motley fool",
    "analyst says",
    "what investors need",
];

/// Gates 1-8: structural checks, run before any price or LLM work.
pub fn structural_gates(
    item: &NewsItem,
    dedup: DedupDecision,
    resolution: &Resolution,
    params: &ParamSnapshot,
) -> Result<(), RejectReason> {
    // 1. SEEN
    if dedup != DedupDecision::Fresh {
        return Err(RejectReason::Seen);
    }

    // 2. MULTI_TICKER
    if let Resolution::MultiTicker(_) = resolution {
        return Err(RejectReason::MultiTicker);
    }

    let title = item.title.to_lowercase();

    // 3. PRESENTATION_NOISE
    if PRESENTATION_PATTERNS.iter().any(|p| title.contains(p))
        && !MATERIAL_TERMS.iter().any(|t| title.contains(t))
    {
        return Err(RejectReason::PresentationNoise);
    }

    // 4. COMMENTARY
    if COMMENTARY_PATTERNS.iter().any(|p| title.contains(p)) {
        return Err(RejectReason::Commentary);
    }

    // 5. SOURCE_BLOCKLIST
    if params
        .source_blocklist
        .iter()
        .any(|blocked| blocked.eq_ignore_ascii_case(&item.source))
    {
        return Err(RejectReason::SourceBlocklist);
    }

    // 6-8. Ticker resolution outcomes.
    match resolution {
        Resolution::NoTicker => Err(RejectReason::NoTicker),
        Resolution::Rejected(TickerReject::OtcSuffix) => Err(RejectReason::OtcTicker),
        // Positive-match failures are non-primary listings by definition.
        Resolution::Rejected(TickerReject::NotListed) => Err(RejectReason::OtcTicker),
        Resolution::Rejected(TickerReject::ForeignAdr) => Err(RejectReason::ForeignAdr),
        Resolution::Rejected(TickerReject::InstrumentDecorator) => {
            Err(RejectReason::InstrumentLike)
        }
        Resolution::Rejected(TickerReject::Malformed) => Err(RejectReason::NoTicker),
        Resolution::MultiTicker(_) => Err(RejectReason::MultiTicker),
        Resolution::Primary { .. } => Ok(()),
    }
}

/// Gates 9-13: price, score, sentiment and category checks.
pub fn scored_gates(classified: &ClassifiedItem, params: &ParamSnapshot) -> Result<(), RejectReason> {
    let price_gated = params.price_ceiling.is_some() || params.price_floor.is_some();

    // 9. PRICE_INVALID_OR_MISSING — with a ceiling or floor configured,
    // a missing price is a reject, never a pass.
    let last = classified.price.as_ref().and_then(|p| p.last);
    if price_gated && last.is_none() {
        return Err(RejectReason::PriceInvalidOrMissing);
    }

    // 10. PRICE_CEILING / PRICE_FLOOR
    if let (Some(ceiling), Some(last)) = (params.price_ceiling, last) {
        if last > ceiling {
            return Err(RejectReason::PriceCeiling);
        }
    }
    if let (Some(floor), Some(last)) = (params.price_floor, last) {
        if last < floor {
            let override_ok = params.enable_sub_floor_override
                && classified.score >= params.sub_floor_override_min_score;
            if !override_ok {
                return Err(RejectReason::PriceFloor);
            }
        }
    }

    // 11. MIN_SCORE — bypassed for negative catalysts.
    if classified.score < params.min_score && !classified.bypass_min_score {
        return Err(RejectReason::MinScore);
    }

    // 12. MIN_SENT_ABS
    if classified.sentiment.abs() < params.min_sent_abs {
        return Err(RejectReason::MinSentAbs);
    }

    // 13. CATEGORY_ALLOW
    if !params.category_allowlist.is_empty()
        && !params
            .category_allowlist
            .iter()
            .any(|allowed| classified.categories.contains(allowed))
    {
        return Err(RejectReason::CategoryNotAllowed);
    }

    Ok(())
}

/// Panic isolation wrapper: an unexpected panic inside a gate becomes a
/// FILTER_ERROR reject instead of tearing down the cycle.
pub fn evaluate_structural(
    item: &NewsItem,
    dedup: DedupDecision,
    resolution: &Resolution,
    params: &ParamSnapshot,
) -> Result<(), RejectReason> {
    match catch_unwind(AssertUnwindSafe(|| {
        structural_gates(item, dedup, resolution, params)
    })) {
        Ok(result) => result,
        Err(_) => {
            error!(source = %item.source, source_id = %item.source_id, "Structural gate panicked");
            Err(RejectReason::FilterError)
        }
    }
}

pub fn evaluate_scored(
    classified: &ClassifiedItem,
    params: &ParamSnapshot,
) -> Result<(), RejectReason> {
    match catch_unwind(AssertUnwindSafe(|| scored_gates(classified, params))) {
        Ok(result) => result,
        Err(_) => {
            error!(
                source = %classified.item.source,
                source_id = %classified.item.source_id,
                "Scored gate panicked"
            );
            Err(RejectReason::FilterError)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::PriceSnapshot;
    use chrono::Utc;
    use serde_json::json;

    fn item(title: &str) -> NewsItem {
        NewsItem::new("wire", "x1", Utc::now(), "https://e.x/a", title, "")
    }

    fn primary(ticker: &str) -> Resolution {
        Resolution::Primary {
            ticker: ticker.to_string(),
            all: vec![ticker.to_string()],
        }
    }

    fn classified_with(score: f64, sentiment: f64, last: Option<f64>) -> ClassifiedItem {
        let mut c = ClassifiedItem::new(item("Acme wins contract"), score, sentiment, 0.6);
        c.price = Some(PriceSnapshot::new(last, Some(4.0), Utc::now(), "test"));
        c
    }

    fn params_with(pairs: &[(&str, serde_json::Value)]) -> ParamSnapshot {
        let mut values = crate::config::schema::default_values();
        for (k, v) in pairs {
            values.insert(k.to_string(), v.clone());
        }
        ParamSnapshot::from_values(1, &values)
    }

    #[test]
    fn seen_is_checked_before_everything() {
        let params = ParamSnapshot::default();
        // Even a multi-ticker item reports SEEN first.
        let result = structural_gates(
            &item("anything"),
            DedupDecision::SeenById,
            &Resolution::MultiTicker(5),
            &params,
        );
        assert_eq!(result.unwrap_err(), RejectReason::Seen);
    }

    #[test]
    fn presentation_noise_needs_no_material_terms() {
        let params = ParamSnapshot::default();
        let noise = structural_gates(
            &item("Acme to present at annual healthcare investor conference"),
            DedupDecision::Fresh,
            &primary("ACME"),
            &params,
        );
        assert_eq!(noise.unwrap_err(), RejectReason::PresentationNoise);

        // Material terms rescue the item.
        let material = structural_gates(
            &item("Acme to present at conference new Phase 3 data"),
            DedupDecision::Fresh,
            &primary("ACME"),
            &params,
        );
        assert!(material.is_ok());
    }

    #[test]
    fn commentary_rejected() {
        let params = ParamSnapshot::default();
        let result = structural_gates(
            &item("Why ACME stock is up 40% today"),
            DedupDecision::Fresh,
            &primary("ACME"),
            &params,
        );
        assert_eq!(result.unwrap_err(), RejectReason::Commentary);
    }

    #[test]
    fn source_blocklist_enforced() {
        let params = params_with(&[(
            crate::config::schema::SOURCE_BLOCKLIST,
            json!(["spamwire"]),
        )]);
        let mut blocked = item("Acme wins contract award");
        blocked.source = "spamwire".to_string();
        let result =
            structural_gates(&blocked, DedupDecision::Fresh, &primary("ACME"), &params);
        assert_eq!(result.unwrap_err(), RejectReason::SourceBlocklist);
    }

    #[test]
    fn ticker_rejections_map_to_reasons() {
        let params = ParamSnapshot::default();
        let cases = [
            (Resolution::NoTicker, RejectReason::NoTicker),
            (
                Resolution::Rejected(TickerReject::OtcSuffix),
                RejectReason::OtcTicker,
            ),
            (
                Resolution::Rejected(TickerReject::ForeignAdr),
                RejectReason::ForeignAdr,
            ),
            (
                Resolution::Rejected(TickerReject::InstrumentDecorator),
                RejectReason::InstrumentLike,
            ),
        ];
        for (resolution, expected) in cases {
            let result = structural_gates(
                &item("Acme wins contract award"),
                DedupDecision::Fresh,
                &resolution,
                &params,
            );
            assert_eq!(result.unwrap_err(), expected);
        }
    }

    #[test]
    fn missing_price_rejects_when_ceiling_configured() {
        let params = ParamSnapshot::default(); // ceiling 10.0
        let c = classified_with(0.9, 0.5, None);
        assert_eq!(
            scored_gates(&c, &params).unwrap_err(),
            RejectReason::PriceInvalidOrMissing
        );

        // Control: valid sub-ceiling price passes.
        let ok = classified_with(0.9, 0.5, Some(9.87));
        assert!(scored_gates(&ok, &params).is_ok());
    }

    #[test]
    fn nan_price_is_missing_not_a_pass() {
        let params = ParamSnapshot::default();
        // PriceSnapshot scrubs NaN to None on construction.
        let c = classified_with(0.9, 0.5, Some(f64::NAN));
        assert_eq!(
            scored_gates(&c, &params).unwrap_err(),
            RejectReason::PriceInvalidOrMissing
        );
    }

    #[test]
    fn ceiling_and_floor_compare_numerically() {
        let params = ParamSnapshot::default(); // ceiling 10, floor 0.10
        let high = classified_with(0.9, 0.5, Some(12.0));
        assert_eq!(
            scored_gates(&high, &params).unwrap_err(),
            RejectReason::PriceCeiling
        );
        let low = classified_with(0.9, 0.5, Some(0.05));
        assert_eq!(
            scored_gates(&low, &params).unwrap_err(),
            RejectReason::PriceFloor
        );
    }

    #[test]
    fn sub_floor_override_when_flagged_and_strong() {
        let params = params_with(&[
            (crate::config::schema::ENABLE_SUB_FLOOR_OVERRIDE, json!(true)),
            (
                crate::config::schema::SUB_FLOOR_OVERRIDE_MIN_SCORE,
                json!(0.6),
            ),
        ]);
        let strong = classified_with(0.7, 0.5, Some(0.05));
        assert!(scored_gates(&strong, &params).is_ok());
        let weak = classified_with(0.4, 0.5, Some(0.05));
        assert_eq!(
            scored_gates(&weak, &params).unwrap_err(),
            RejectReason::PriceFloor
        );
    }

    #[test]
    fn negative_catalyst_bypasses_min_score_only() {
        let params = ParamSnapshot::default(); // MIN_SCORE 0.25
        let mut c = classified_with(0.12, -0.55, Some(4.0));
        c.bypass_min_score = true;
        assert!(scored_gates(&c, &params).is_ok());

        // Control: same score, no bypass flag.
        let plain = classified_with(0.12, 0.1, Some(4.0));
        assert_eq!(
            scored_gates(&plain, &params).unwrap_err(),
            RejectReason::MinScore
        );
    }

    #[test]
    fn sentiment_magnitude_gate() {
        let params = params_with(&[(crate::config::schema::MIN_SENT_ABS, json!(0.3))]);
        let flat = classified_with(0.9, 0.1, Some(4.0));
        assert_eq!(
            scored_gates(&flat, &params).unwrap_err(),
            RejectReason::MinSentAbs
        );
        let negative = classified_with(0.9, -0.5, Some(4.0));
        assert!(scored_gates(&negative, &params).is_ok());
    }

    #[test]
    fn category_allowlist_gate() {
        let params = params_with(&[(
            crate::config::schema::CATEGORY_ALLOWLIST,
            json!(["fda", "merger"]),
        )]);
        let mut c = classified_with(0.9, 0.5, Some(4.0));
        c.categories.insert("contract".to_string());
        assert_eq!(
            scored_gates(&c, &params).unwrap_err(),
            RejectReason::CategoryNotAllowed
        );
        c.categories.insert("fda".to_string());
        assert!(scored_gates(&c, &params).is_ok());
    }

    #[test]
    fn no_price_gate_when_unconfigured() {
        let params = params_with(&[
            (crate::config::schema::PRICE_CEILING, json!(null)),
            (crate::config::schema::PRICE_FLOOR, json!(null)),
        ]);
        let mut c = classified_with(0.9, 0.5, None);
        c.price = None;
        assert!(scored_gates(&c, &params).is_ok());
    }
}
