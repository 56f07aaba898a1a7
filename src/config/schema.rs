//! Registered schema for live tunables.
//!
//! Every parameter the control surface can mutate is declared here with
//! its type and bounds. `apply` validates against this table before any
//! state is touched; unknown keys are rejected outright.

use serde_json::Value;
use std::collections::BTreeMap;

pub const MIN_SCORE: &str = "MIN_SCORE";
pub const MIN_SENT_ABS: &str = "MIN_SENT_ABS";
pub const PRICE_CEILING: &str = "PRICE_CEILING";
pub const PRICE_FLOOR: &str = "PRICE_FLOOR";
pub const MAX_ALERTS_PER_CYCLE: &str = "MAX_ALERTS_PER_CYCLE";
pub const ALERTS_MIN_INTERVAL_MS: &str = "ALERTS_MIN_INTERVAL_MS";
pub const CYCLE_SECONDS_PREMARKET: &str = "CYCLE_SECONDS_PREMARKET";
pub const CYCLE_SECONDS_REGULAR: &str = "CYCLE_SECONDS_REGULAR";
pub const CYCLE_SECONDS_AFTERHOURS: &str = "CYCLE_SECONDS_AFTERHOURS";
pub const CYCLE_SECONDS_CLOSED: &str = "CYCLE_SECONDS_CLOSED";
pub const SEEN_TTL_DAYS: &str = "SEEN_TTL_DAYS";
pub const MAX_ARTICLE_AGE_MINUTES: &str = "MAX_ARTICLE_AGE_MINUTES";
pub const LLM_MIN_PRESCALE: &str = "LLM_MIN_PRESCALE";
pub const LLM_BATCH_SIZE: &str = "LLM_BATCH_SIZE";
pub const LLM_BATCH_DELAY_MS: &str = "LLM_BATCH_DELAY_MS";
pub const LLM_BATCH_TIMEOUT_MS: &str = "LLM_BATCH_TIMEOUT_MS";
pub const LLM_DAILY_BUDGET_USD: &str = "LLM_DAILY_BUDGET_USD";
pub const LLM_MONTHLY_BUDGET_USD: &str = "LLM_MONTHLY_BUDGET_USD";
pub const HEARTBEAT_INTERVAL_MIN: &str = "HEARTBEAT_INTERVAL_MIN";
pub const STRONG_NEGATIVE_THRESHOLD: &str = "STRONG_NEGATIVE_THRESHOLD";
pub const SENTIMENT_WEIGHT_LEXICON: &str = "SENTIMENT_WEIGHT_LEXICON";
pub const SENTIMENT_WEIGHT_ML: &str = "SENTIMENT_WEIGHT_ML";
pub const SENTIMENT_WEIGHT_EARNINGS: &str = "SENTIMENT_WEIGHT_EARNINGS";
pub const SENTIMENT_WEIGHT_LLM: &str = "SENTIMENT_WEIGHT_LLM";
pub const MAX_TICKERS_PER_ITEM: &str = "MAX_TICKERS_PER_ITEM";
pub const FEED_OUTAGE_CYCLES: &str = "FEED_OUTAGE_CYCLES";
pub const CRITICAL_NEGATIVE_KEYWORDS: &str = "CRITICAL_NEGATIVE_KEYWORDS";
pub const SOURCE_BLOCKLIST: &str = "SOURCE_BLOCKLIST";
pub const CATEGORY_ALLOWLIST: &str = "CATEGORY_ALLOWLIST";
pub const SECTOR_MULTIPLIERS: &str = "SECTOR_MULTIPLIERS";
pub const ENABLE_SECTOR_MULTIPLIERS: &str = "ENABLE_SECTOR_MULTIPLIERS";
pub const ENABLE_LLM: &str = "ENABLE_LLM";
pub const ENABLE_SUB_FLOOR_OVERRIDE: &str = "ENABLE_SUB_FLOOR_OVERRIDE";
pub const SUB_FLOOR_OVERRIDE_MIN_SCORE: &str = "SUB_FLOOR_OVERRIDE_MIN_SCORE";
pub const CONFIG_APPLY_MIN_SECS: &str = "CONFIG_APPLY_MIN_SECS";
pub const PRICE_CACHE_TTL_SECS: &str = "PRICE_CACHE_TTL_SECS";

#[derive(Debug, Clone, Copy)]
pub enum ParamKind {
    Float { min: f64, max: f64 },
    /// Float or null ("unset").
    OptFloat { min: f64, max: f64 },
    Uint { min: u64, max: u64 },
    Bool,
    StringList,
    /// Map from string label to finite float.
    FloatMap { min: f64, max: f64 },
}

#[derive(Debug, Clone, Copy)]
pub struct ParamSpec {
    pub key: &'static str,
    pub kind: ParamKind,
}

/// The full schema table. Order is the display order for `stats`.
pub const SCHEMA: &[ParamSpec] = &[
    ParamSpec { key: MIN_SCORE, kind: ParamKind::Float { min: 0.0, max: 1.0 } },
    ParamSpec { key: MIN_SENT_ABS, kind: ParamKind::Float { min: 0.0, max: 1.0 } },
    ParamSpec { key: PRICE_CEILING, kind: ParamKind::OptFloat { min: 0.01, max: 100_000.0 } },
    ParamSpec { key: PRICE_FLOOR, kind: ParamKind::OptFloat { min: 0.0, max: 100_000.0 } },
    ParamSpec { key: MAX_ALERTS_PER_CYCLE, kind: ParamKind::Uint { min: 1, max: 200 } },
    ParamSpec { key: ALERTS_MIN_INTERVAL_MS, kind: ParamKind::Uint { min: 0, max: 600_000 } },
    ParamSpec { key: CYCLE_SECONDS_PREMARKET, kind: ParamKind::Uint { min: 5, max: 3600 } },
    ParamSpec { key: CYCLE_SECONDS_REGULAR, kind: ParamKind::Uint { min: 5, max: 3600 } },
    ParamSpec { key: CYCLE_SECONDS_AFTERHOURS, kind: ParamKind::Uint { min: 5, max: 3600 } },
    ParamSpec { key: CYCLE_SECONDS_CLOSED, kind: ParamKind::Uint { min: 5, max: 86_400 } },
    ParamSpec { key: SEEN_TTL_DAYS, kind: ParamKind::Uint { min: 1, max: 90 } },
    ParamSpec { key: MAX_ARTICLE_AGE_MINUTES, kind: ParamKind::Uint { min: 1, max: 10_080 } },
    ParamSpec { key: LLM_MIN_PRESCALE, kind: ParamKind::Float { min: 0.0, max: 1.0 } },
    ParamSpec { key: LLM_BATCH_SIZE, kind: ParamKind::Uint { min: 1, max: 32 } },
    ParamSpec { key: LLM_BATCH_DELAY_MS, kind: ParamKind::Uint { min: 0, max: 60_000 } },
    ParamSpec { key: LLM_BATCH_TIMEOUT_MS, kind: ParamKind::Uint { min: 100, max: 60_000 } },
    ParamSpec { key: LLM_DAILY_BUDGET_USD, kind: ParamKind::Float { min: 0.0, max: 10_000.0 } },
    ParamSpec { key: LLM_MONTHLY_BUDGET_USD, kind: ParamKind::Float { min: 0.0, max: 100_000.0 } },
    ParamSpec { key: HEARTBEAT_INTERVAL_MIN, kind: ParamKind::Uint { min: 1, max: 1440 } },
    ParamSpec { key: STRONG_NEGATIVE_THRESHOLD, kind: ParamKind::Float { min: -1.0, max: 0.0 } },
    ParamSpec { key: SENTIMENT_WEIGHT_LEXICON, kind: ParamKind::Float { min: 0.0, max: 1.0 } },
    ParamSpec { key: SENTIMENT_WEIGHT_ML, kind: ParamKind::Float { min: 0.0, max: 1.0 } },
    ParamSpec { key: SENTIMENT_WEIGHT_EARNINGS, kind: ParamKind::Float { min: 0.0, max: 1.0 } },
    ParamSpec { key: SENTIMENT_WEIGHT_LLM, kind: ParamKind::Float { min: 0.0, max: 1.0 } },
    ParamSpec { key: MAX_TICKERS_PER_ITEM, kind: ParamKind::Uint { min: 1, max: 20 } },
    ParamSpec { key: FEED_OUTAGE_CYCLES, kind: ParamKind::Uint { min: 1, max: 1000 } },
    ParamSpec { key: CRITICAL_NEGATIVE_KEYWORDS, kind: ParamKind::StringList },
    ParamSpec { key: SOURCE_BLOCKLIST, kind: ParamKind::StringList },
    ParamSpec { key: CATEGORY_ALLOWLIST, kind: ParamKind::StringList },
    ParamSpec { key: SECTOR_MULTIPLIERS, kind: ParamKind::FloatMap { min: 0.0, max: 10.0 } },
    ParamSpec { key: ENABLE_SECTOR_MULTIPLIERS, kind: ParamKind::Bool },
    ParamSpec { key: ENABLE_LLM, kind: ParamKind::Bool },
    ParamSpec { key: ENABLE_SUB_FLOOR_OVERRIDE, kind: ParamKind::Bool },
    ParamSpec { key: SUB_FLOOR_OVERRIDE_MIN_SCORE, kind: ParamKind::Float { min: 0.0, max: 1.0 } },
    ParamSpec { key: CONFIG_APPLY_MIN_SECS, kind: ParamKind::Uint { min: 0, max: 86_400 } },
    ParamSpec { key: PRICE_CACHE_TTL_SECS, kind: ParamKind::Uint { min: 1, max: 3600 } },
];

pub fn spec_for(key: &str) -> Option<&'static ParamSpec> {
    SCHEMA.iter().find(|spec| spec.key == key)
}

/// Factory defaults for every registered key.
pub fn default_values() -> BTreeMap<String, Value> {
    use serde_json::json;
    let mut values = BTreeMap::new();
    let mut set = |key: &str, value: Value| {
        values.insert(key.to_string(), value);
    };
    set(MIN_SCORE, json!(0.25));
    set(MIN_SENT_ABS, json!(0.0));
    set(PRICE_CEILING, json!(10.0));
    set(PRICE_FLOOR, json!(0.10));
    set(MAX_ALERTS_PER_CYCLE, json!(8));
    set(ALERTS_MIN_INTERVAL_MS, json!(1500));
    set(CYCLE_SECONDS_PREMARKET, json!(90));
    set(CYCLE_SECONDS_REGULAR, json!(60));
    set(CYCLE_SECONDS_AFTERHOURS, json!(120));
    set(CYCLE_SECONDS_CLOSED, json!(300));
    set(SEEN_TTL_DAYS, json!(7));
    set(MAX_ARTICLE_AGE_MINUTES, json!(120));
    set(LLM_MIN_PRESCALE, json!(0.20));
    set(LLM_BATCH_SIZE, json!(5));
    set(LLM_BATCH_DELAY_MS, json!(2000));
    set(LLM_BATCH_TIMEOUT_MS, json!(2000));
    set(LLM_DAILY_BUDGET_USD, json!(5.0));
    set(LLM_MONTHLY_BUDGET_USD, json!(75.0));
    set(HEARTBEAT_INTERVAL_MIN, json!(60));
    set(STRONG_NEGATIVE_THRESHOLD, json!(-0.30));
    set(SENTIMENT_WEIGHT_LEXICON, json!(0.25));
    set(SENTIMENT_WEIGHT_ML, json!(0.25));
    set(SENTIMENT_WEIGHT_EARNINGS, json!(0.35));
    set(SENTIMENT_WEIGHT_LLM, json!(0.15));
    set(MAX_TICKERS_PER_ITEM, json!(3));
    set(FEED_OUTAGE_CYCLES, json!(5));
    set(
        CRITICAL_NEGATIVE_KEYWORDS,
        json!([
            "dilution",
            "offering",
            "bankruptcy",
            "delisting",
            "going concern",
            "reverse split"
        ]),
    );
    set(SOURCE_BLOCKLIST, json!([]));
    set(CATEGORY_ALLOWLIST, json!([]));
    set(SECTOR_MULTIPLIERS, json!({}));
    set(ENABLE_SECTOR_MULTIPLIERS, json!(false));
    set(ENABLE_LLM, json!(true));
    set(ENABLE_SUB_FLOOR_OVERRIDE, json!(false));
    set(SUB_FLOOR_OVERRIDE_MIN_SCORE, json!(0.60));
    set(CONFIG_APPLY_MIN_SECS, json!(60));
    set(PRICE_CACHE_TTL_SECS, json!(60));
    values
}

/// Validate a single value against its spec.
pub fn validate_value(spec: &ParamSpec, value: &Value) -> Result<(), String> {
    match spec.kind {
        ParamKind::Float { min, max } => {
            let Some(v) = value.as_f64() else {
                return Err(format!("{} expects a number", spec.key));
            };
            if !v.is_finite() {
                return Err(format!("{} must be finite", spec.key));
            }
            if v < min || v > max {
                return Err(format!("{} out of range [{min}, {max}]", spec.key));
            }
            Ok(())
        }
        ParamKind::OptFloat { min, max } => {
            if value.is_null() {
                return Ok(());
            }
            let Some(v) = value.as_f64() else {
                return Err(format!("{} expects a number or null", spec.key));
            };
            if !v.is_finite() {
                return Err(format!("{} must be finite", spec.key));
            }
            if v < min || v > max {
                return Err(format!("{} out of range [{min}, {max}]", spec.key));
            }
            Ok(())
        }
        ParamKind::Uint { min, max } => {
            let Some(v) = value.as_u64() else {
                return Err(format!("{} expects a non-negative integer", spec.key));
            };
            if v < min || v > max {
                return Err(format!("{} out of range [{min}, {max}]", spec.key));
            }
            Ok(())
        }
        ParamKind::Bool => {
            if value.is_boolean() {
                Ok(())
            } else {
                Err(format!("{} expects true or false", spec.key))
            }
        }
        ParamKind::StringList => {
            let Some(items) = value.as_array() else {
                return Err(format!("{} expects a list of strings", spec.key));
            };
            if items.iter().all(|item| item.is_string()) {
                Ok(())
            } else {
                Err(format!("{} expects a list of strings", spec.key))
            }
        }
        ParamKind::FloatMap { min, max } => {
            let Some(map) = value.as_object() else {
                return Err(format!("{} expects a string-to-number map", spec.key));
            };
            for (label, entry) in map {
                let Some(v) = entry.as_f64() else {
                    return Err(format!("{}[{label}] expects a number", spec.key));
                };
                if !v.is_finite() || v < min || v > max {
                    return Err(format!("{}[{label}] out of range [{min}, {max}]", spec.key));
                }
            }
            Ok(())
        }
    }
}

/// Checks spanning more than one key, run on the merged candidate map.
pub fn validate_cross_field(values: &BTreeMap<String, Value>) -> Result<(), String> {
    let floor = values.get(PRICE_FLOOR).and_then(Value::as_f64);
    let ceiling = values.get(PRICE_CEILING).and_then(Value::as_f64);
    if let (Some(floor), Some(ceiling)) = (floor, ceiling) {
        if floor >= ceiling {
            return Err(format!(
                "PRICE_FLOOR ({floor}) must be below PRICE_CEILING ({ceiling})"
            ));
        }
    }

    let weight_sum: f64 = [
        SENTIMENT_WEIGHT_LEXICON,
        SENTIMENT_WEIGHT_ML,
        SENTIMENT_WEIGHT_EARNINGS,
        SENTIMENT_WEIGHT_LLM,
    ]
    .iter()
    .filter_map(|key| values.get(*key).and_then(Value::as_f64))
    .sum();
    if weight_sum > 1.0 + 1e-9 {
        return Err(format!(
            "sentiment weights must sum to at most 1.0 (got {weight_sum:.3})"
        ));
    }
    Ok(())
}

/// Typed, immutable view over the raw value map. One snapshot is captured
/// per cycle; readers never see a partially applied delta.
#[derive(Debug, Clone)]
pub struct ParamSnapshot {
    pub revision: u64,
    pub min_score: f64,
    pub min_sent_abs: f64,
    pub price_ceiling: Option<f64>,
    pub price_floor: Option<f64>,
    pub max_alerts_per_cycle: u32,
    pub alerts_min_interval_ms: u64,
    pub cycle_seconds_premarket: u64,
    pub cycle_seconds_regular: u64,
    pub cycle_seconds_afterhours: u64,
    pub cycle_seconds_closed: u64,
    pub seen_ttl_days: u32,
    pub max_article_age_minutes: u32,
    pub llm_min_prescale: f64,
    pub llm_batch_size: usize,
    pub llm_batch_delay_ms: u64,
    pub llm_batch_timeout_ms: u64,
    pub llm_daily_budget_usd: f64,
    pub llm_monthly_budget_usd: f64,
    pub heartbeat_interval_min: u32,
    pub strong_negative_threshold: f64,
    pub sentiment_weight_lexicon: f64,
    pub sentiment_weight_ml: f64,
    pub sentiment_weight_earnings: f64,
    pub sentiment_weight_llm: f64,
    pub max_tickers_per_item: usize,
    pub feed_outage_cycles: u32,
    pub critical_negative_keywords: Vec<String>,
    pub source_blocklist: Vec<String>,
    pub category_allowlist: Vec<String>,
    pub sector_multipliers: BTreeMap<String, f64>,
    pub enable_sector_multipliers: bool,
    pub enable_llm: bool,
    pub enable_sub_floor_override: bool,
    pub sub_floor_override_min_score: f64,
    pub config_apply_min_secs: u64,
    pub price_cache_ttl_secs: u64,
}

fn get_f64(values: &BTreeMap<String, Value>, key: &str, fallback: f64) -> f64 {
    values.get(key).and_then(Value::as_f64).unwrap_or(fallback)
}

fn get_opt_f64(values: &BTreeMap<String, Value>, key: &str) -> Option<f64> {
    values.get(key).and_then(Value::as_f64)
}

fn get_u64(values: &BTreeMap<String, Value>, key: &str, fallback: u64) -> u64 {
    values.get(key).and_then(Value::as_u64).unwrap_or(fallback)
}

fn get_bool(values: &BTreeMap<String, Value>, key: &str, fallback: bool) -> bool {
    values.get(key).and_then(Value::as_bool).unwrap_or(fallback)
}

fn get_list(values: &BTreeMap<String, Value>, key: &str) -> Vec<String> {
    values
        .get(key)
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|item| item.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}

fn get_map(values: &BTreeMap<String, Value>, key: &str) -> BTreeMap<String, f64> {
    values
        .get(key)
        .and_then(Value::as_object)
        .map(|map| {
            map.iter()
                .filter_map(|(label, entry)| entry.as_f64().map(|v| (label.clone(), v)))
                .collect()
        })
        .unwrap_or_default()
}

impl ParamSnapshot {
    pub fn from_values(revision: u64, values: &BTreeMap<String, Value>) -> Self {
        Self {
            revision,
            min_score: get_f64(values, MIN_SCORE, 0.25),
            min_sent_abs: get_f64(values, MIN_SENT_ABS, 0.0),
            price_ceiling: get_opt_f64(values, PRICE_CEILING),
            price_floor: get_opt_f64(values, PRICE_FLOOR),
            max_alerts_per_cycle: get_u64(values, MAX_ALERTS_PER_CYCLE, 8) as u32,
            alerts_min_interval_ms: get_u64(values, ALERTS_MIN_INTERVAL_MS, 1500),
            cycle_seconds_premarket: get_u64(values, CYCLE_SECONDS_PREMARKET, 90),
            cycle_seconds_regular: get_u64(values, CYCLE_SECONDS_REGULAR, 60),
            cycle_seconds_afterhours: get_u64(values, CYCLE_SECONDS_AFTERHOURS, 120),
            cycle_seconds_closed: get_u64(values, CYCLE_SECONDS_CLOSED, 300),
            seen_ttl_days: get_u64(values, SEEN_TTL_DAYS, 7) as u32,
            max_article_age_minutes: get_u64(values, MAX_ARTICLE_AGE_MINUTES, 120) as u32,
            llm_min_prescale: get_f64(values, LLM_MIN_PRESCALE, 0.20),
            llm_batch_size: get_u64(values, LLM_BATCH_SIZE, 5) as usize,
            llm_batch_delay_ms: get_u64(values, LLM_BATCH_DELAY_MS, 2000),
            llm_batch_timeout_ms: get_u64(values, LLM_BATCH_TIMEOUT_MS, 2000),
            llm_daily_budget_usd: get_f64(values, LLM_DAILY_BUDGET_USD, 5.0),
            llm_monthly_budget_usd: get_f64(values, LLM_MONTHLY_BUDGET_USD, 75.0),
            heartbeat_interval_min: get_u64(values, HEARTBEAT_INTERVAL_MIN, 60) as u32,
            strong_negative_threshold: get_f64(values, STRONG_NEGATIVE_THRESHOLD, -0.30),
            sentiment_weight_lexicon: get_f64(values, SENTIMENT_WEIGHT_LEXICON, 0.25),
            sentiment_weight_ml: get_f64(values, SENTIMENT_WEIGHT_ML, 0.25),
            sentiment_weight_earnings: get_f64(values, SENTIMENT_WEIGHT_EARNINGS, 0.35),
            sentiment_weight_llm: get_f64(values, SENTIMENT_WEIGHT_LLM, 0.15),
            max_tickers_per_item: get_u64(values, MAX_TICKERS_PER_ITEM, 3) as usize,
            feed_outage_cycles: get_u64(values, FEED_OUTAGE_CYCLES, 5) as u32,
            critical_negative_keywords: get_list(values, CRITICAL_NEGATIVE_KEYWORDS),
            source_blocklist: get_list(values, SOURCE_BLOCKLIST),
            category_allowlist: get_list(values, CATEGORY_ALLOWLIST),
            sector_multipliers: get_map(values, SECTOR_MULTIPLIERS),
            enable_sector_multipliers: get_bool(values, ENABLE_SECTOR_MULTIPLIERS, false),
            enable_llm: get_bool(values, ENABLE_LLM, true),
            enable_sub_floor_override: get_bool(values, ENABLE_SUB_FLOOR_OVERRIDE, false),
            sub_floor_override_min_score: get_f64(values, SUB_FLOOR_OVERRIDE_MIN_SCORE, 0.60),
            config_apply_min_secs: get_u64(values, CONFIG_APPLY_MIN_SECS, 60),
            price_cache_ttl_secs: get_u64(values, PRICE_CACHE_TTL_SECS, 60),
        }
    }

    pub fn cycle_seconds(&self, phase: crate::phase::MarketPhase) -> u64 {
        use crate::phase::MarketPhase;
        match phase {
            MarketPhase::PreMarket => self.cycle_seconds_premarket,
            MarketPhase::Regular => self.cycle_seconds_regular,
            MarketPhase::AfterHours => self.cycle_seconds_afterhours,
            MarketPhase::Closed => self.cycle_seconds_closed,
        }
    }
}

impl Default for ParamSnapshot {
    fn default() -> Self {
        Self::from_values(0, &default_values())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn defaults_all_validate() {
        let values = default_values();
        for spec in SCHEMA {
            let value = values.get(spec.key).expect("default present");
            validate_value(spec, value).expect("default valid");
        }
        validate_cross_field(&values).unwrap();
    }

    #[test]
    fn float_bounds_enforced() {
        let spec = spec_for(MIN_SCORE).unwrap();
        assert!(validate_value(spec, &json!(0.5)).is_ok());
        assert!(validate_value(spec, &json!(1.5)).is_err());
        assert!(validate_value(spec, &json!("x")).is_err());
        assert!(validate_value(spec, &json!(f64::NAN)).is_err());
    }

    #[test]
    fn opt_float_accepts_null() {
        let spec = spec_for(PRICE_CEILING).unwrap();
        assert!(validate_value(spec, &json!(null)).is_ok());
        assert!(validate_value(spec, &json!(10.0)).is_ok());
        assert!(validate_value(spec, &json!(0.0)).is_err());
    }

    #[test]
    fn cross_field_floor_above_ceiling_rejected() {
        let mut values = default_values();
        values.insert(PRICE_FLOOR.to_string(), json!(12.0));
        values.insert(PRICE_CEILING.to_string(), json!(10.0));
        assert!(validate_cross_field(&values).is_err());
    }

    #[test]
    fn cross_field_weight_sum_capped() {
        let mut values = default_values();
        values.insert(SENTIMENT_WEIGHT_LEXICON.to_string(), json!(0.9));
        values.insert(SENTIMENT_WEIGHT_EARNINGS.to_string(), json!(0.9));
        assert!(validate_cross_field(&values).is_err());
    }

    #[test]
    fn snapshot_reads_typed_fields() {
        let mut values = default_values();
        values.insert(MIN_SCORE.to_string(), json!(0.42));
        values.insert(PRICE_CEILING.to_string(), json!(null));
        let snapshot = ParamSnapshot::from_values(3, &values);
        assert_eq!(snapshot.revision, 3);
        assert!((snapshot.min_score - 0.42).abs() < 1e-12);
        assert_eq!(snapshot.price_ceiling, None);
        assert_eq!(snapshot.critical_negative_keywords.len(), 6);
    }
}
