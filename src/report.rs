//! Nightly outcome report and parameter recommendations.
//!
//! Reads the previous day's outcome records, measures how dispatched
//! alerts performed over the lookahead, ranks keyword categories, and
//! proposes parameter changes with explicit rationale. Approvals route
//! back through the control surface into the parameter store.

use anyhow::Result;
use chrono::NaiveDate;
use serde_json::json;
use std::collections::BTreeMap;
use tracing::info;

use crate::config::{schema, ParamSnapshot};
use crate::models::Decision;
use crate::price::PriceService;
use crate::storage::OutcomeLog;

/// A move beyond ±this percentage decides a win or a loss.
const WIN_THRESHOLD_PCT: f64 = 5.0;
/// Minimum decided alerts before recommending threshold changes.
const MIN_SAMPLE: usize = 10;

#[derive(Debug, Clone)]
pub struct Recommendation {
    pub key: String,
    pub value: serde_json::Value,
    pub rationale: String,
}

impl Recommendation {
    /// Encoded into the approval button's custom id; the control surface
    /// decodes it back into a single-key delta.
    pub fn custom_id(&self) -> String {
        format!("reco:{}={}", self.key, self.value)
    }
}

#[derive(Debug, Clone)]
pub struct NightlyReport {
    pub date: NaiveDate,
    pub processed: usize,
    pub dispatched: usize,
    pub wins: usize,
    pub losses: usize,
    pub flat: usize,
    pub win_rate: Option<f64>,
    /// Category -> mean signed move (%) across dispatched alerts.
    pub category_performance: BTreeMap<String, f64>,
    pub recommendations: Vec<Recommendation>,
}

/// Build the report for one UTC day. Lookahead performance is measured
/// against the latest quote at report time.
pub async fn build_report(
    log: &OutcomeLog,
    prices: &PriceService,
    date: NaiveDate,
    params: &ParamSnapshot,
) -> Result<NightlyReport> {
    let records = log.read_day(date)?;
    let processed = records.len();

    let mut wins = 0;
    let mut losses = 0;
    let mut flat = 0;
    let mut dispatched = 0;
    let mut category_moves: BTreeMap<String, Vec<f64>> = BTreeMap::new();

    for record in &records {
        if record.decision != Decision::Dispatched {
            continue;
        }
        dispatched += 1;
        let (Some(ticker), Some(entry)) = (&record.ticker, record.price) else {
            continue;
        };
        if entry <= 0.0 {
            continue;
        }
        let Some(current) = prices
            .single(ticker, params.price_cache_ttl_secs)
            .await
            .and_then(|snap| snap.last)
        else {
            continue;
        };
        let change_pct = (current - entry) / entry * 100.0;
        if !change_pct.is_finite() {
            continue;
        }
        if change_pct >= WIN_THRESHOLD_PCT {
            wins += 1;
        } else if change_pct <= -WIN_THRESHOLD_PCT {
            losses += 1;
        } else {
            flat += 1;
        }
        for category in &record.categories {
            category_moves
                .entry(category.clone())
                .or_default()
                .push(change_pct);
        }
    }

    let decided = wins + losses;
    let win_rate = (decided > 0).then(|| wins as f64 / decided as f64);
    let category_performance: BTreeMap<String, f64> = category_moves
        .into_iter()
        .map(|(category, moves)| {
            let mean = moves.iter().sum::<f64>() / moves.len() as f64;
            (category, mean)
        })
        .collect();

    let recommendations =
        recommend(params, dispatched, win_rate, &category_performance);

    info!(
        date = %date,
        processed,
        dispatched,
        wins,
        losses,
        recommendations = recommendations.len(),
        "Nightly report built"
    );
    Ok(NightlyReport {
        date,
        processed,
        dispatched,
        wins,
        losses,
        flat,
        win_rate,
        category_performance,
        recommendations,
    })
}

/// Recommendation rules. Every proposal names the evidence driving it.
fn recommend(
    params: &ParamSnapshot,
    dispatched: usize,
    win_rate: Option<f64>,
    category_performance: &BTreeMap<String, f64>,
) -> Vec<Recommendation> {
    let mut out = Vec::new();
    if dispatched >= MIN_SAMPLE {
        if let Some(rate) = win_rate {
            if rate < 0.40 {
                let proposed = (params.min_score + 0.05).min(0.90);
                out.push(Recommendation {
                    key: schema::MIN_SCORE.to_string(),
                    value: json!((proposed * 100.0).round() / 100.0),
                    rationale: format!(
                        "win rate {:.0}% over {} alerts is below 40%; tightening MIN_SCORE from {:.2}",
                        rate * 100.0,
                        dispatched,
                        params.min_score
                    ),
                });
            } else if rate > 0.70 && params.min_score > 0.10 {
                let proposed = (params.min_score - 0.05).max(0.05);
                out.push(Recommendation {
                    key: schema::MIN_SCORE.to_string(),
                    value: json!((proposed * 100.0).round() / 100.0),
                    rationale: format!(
                        "win rate {:.0}% over {} alerts leaves room; loosening MIN_SCORE from {:.2}",
                        rate * 100.0,
                        dispatched,
                        params.min_score
                    ),
                });
            }
        }
    }
    if let Some((worst, mean)) = category_performance
        .iter()
        .min_by(|a, b| a.1.partial_cmp(b.1).unwrap_or(std::cmp::Ordering::Equal))
    {
        if *mean < -WIN_THRESHOLD_PCT {
            out.push(Recommendation {
                key: schema::MIN_SENT_ABS.to_string(),
                value: json!(((params.min_sent_abs + 0.05).min(0.5) * 100.0).round() / 100.0),
                rationale: format!(
                    "category '{worst}' averaged {mean:.1}% after alerts; requiring stronger sentiment"
                ),
            });
        }
    }
    out
}

/// Rich report message: summary embed plus approve/reject components.
pub fn report_payload(report: &NightlyReport) -> serde_json::Value {
    let win_line = match report.win_rate {
        Some(rate) => format!("{:.0}%", rate * 100.0),
        None => "n/a".to_string(),
    };
    let mut ranked: Vec<(&String, &f64)> = report.category_performance.iter().collect();
    ranked.sort_by(|a, b| b.1.partial_cmp(a.1).unwrap_or(std::cmp::Ordering::Equal));
    let categories = if ranked.is_empty() {
        "—".to_string()
    } else {
        ranked
            .iter()
            .map(|(category, mean)| format!("{category}: {mean:+.1}%"))
            .collect::<Vec<_>>()
            .join("\n")
    };
    let recommendations = if report.recommendations.is_empty() {
        "No changes recommended.".to_string()
    } else {
        report
            .recommendations
            .iter()
            .map(|r| format!("`{} -> {}` — {}", r.key, r.value, r.rationale))
            .collect::<Vec<_>>()
            .join("\n")
    };

    let mut components = Vec::new();
    for recommendation in &report.recommendations {
        components.push(json!({
            "type": 1,
            "components": [
                {
                    "type": 2,
                    "style": 3,
                    "label": format!("Approve {}", recommendation.key),
                    "custom_id": recommendation.custom_id(),
                },
                {
                    "type": 2,
                    "style": 4,
                    "label": "Reject",
                    "custom_id": format!("reco_reject:{}", recommendation.key),
                }
            ]
        }));
    }

    json!({
        "embeds": [{
            "title": format!("Nightly report — {}", report.date),
            "color": 0x3498DB,
            "fields": [
                {"name": "Processed", "value": report.processed.to_string(), "inline": true},
                {"name": "Alerted", "value": report.dispatched.to_string(), "inline": true},
                {
                    "name": format!("Win rate (±{WIN_THRESHOLD_PCT:.0}%)"),
                    "value": format!("{win_line} ({}W/{}L/{}F)", report.wins, report.losses, report.flat),
                    "inline": true
                },
                {"name": "Categories", "value": categories, "inline": false},
                {"name": "Recommendations", "value": recommendations, "inline": false},
            ],
        }],
        "components": components,
    })
}

/// Background task: once per day at `hour_utc`, build yesterday's report
/// and post it with its approval controls.
pub async fn run_nightly_loop(
    log: OutcomeLog,
    prices: std::sync::Arc<PriceService>,
    params: std::sync::Arc<crate::config::ParamStore>,
    transport: Option<std::sync::Arc<dyn crate::alerts::AlertTransport>>,
    hour_utc: u32,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) {
    use chrono::{Duration as ChronoDuration, Utc};
    loop {
        let now = Utc::now();
        let mut next = now
            .date_naive()
            .and_hms_opt(hour_utc, 0, 0)
            .unwrap_or_else(|| now.date_naive().and_hms_opt(0, 0, 0).unwrap())
            .and_utc();
        if next <= now {
            next += ChronoDuration::days(1);
        }
        let wait = (next - now)
            .to_std()
            .unwrap_or(std::time::Duration::from_secs(60));
        tokio::select! {
            _ = tokio::time::sleep(wait) => {}
            _ = shutdown.changed() => return,
        }
        if *shutdown.borrow() {
            return;
        }

        let yesterday = Utc::now().date_naive() - ChronoDuration::days(1);
        let snapshot = params.params();
        match build_report(&log, &prices, yesterday, &snapshot).await {
            Ok(report) => {
                let payload = report_payload(&report);
                if let Some(transport) = &transport {
                    if let Err(e) = transport.deliver(&payload, Vec::new()).await {
                        tracing::warn!(error = ?e, "Nightly report post failed");
                    }
                } else {
                    info!(date = %report.date, "Nightly report (no transport configured)");
                }
            }
            Err(e) => tracing::warn!(error = %e, "Nightly report build failed"),
        }
        // Guard against immediate re-trigger at the hour boundary.
        tokio::time::sleep(std::time::Duration::from_secs(61)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{OutcomeRecord, PriceSnapshot};
    use crate::price::QuoteProvider;
    use anyhow::Result as AnyResult;
    use async_trait::async_trait;
    use chrono::Utc;
    use std::collections::HashMap;
    use std::sync::Arc;

    struct FlatProvider {
        quotes: HashMap<String, f64>,
    }

    #[async_trait]
    impl QuoteProvider for FlatProvider {
        fn name(&self) -> &'static str {
            "flat"
        }

        async fn batch(&self, tickers: &[String]) -> AnyResult<HashMap<String, PriceSnapshot>> {
            Ok(tickers
                .iter()
                .filter_map(|t| {
                    self.quotes.get(t).map(|last| {
                        (
                            t.clone(),
                            PriceSnapshot::new(Some(*last), None, Utc::now(), "flat"),
                        )
                    })
                })
                .collect())
        }
    }

    fn record(ticker: &str, price: f64, category: &str) -> OutcomeRecord {
        OutcomeRecord {
            ts: Utc::now(),
            ticker: Some(ticker.to_string()),
            decision: Decision::Dispatched,
            reasons: vec![],
            score: 0.5,
            sentiment: 0.2,
            price: Some(price),
            source: "wire".to_string(),
            categories: vec![category.to_string()],
        }
    }

    #[tokio::test]
    async fn win_rate_over_lookahead() {
        let dir = tempfile::tempdir().unwrap();
        let log = OutcomeLog::open(&dir.path().join("outcomes.jsonl")).unwrap();
        // WINR doubled; LOSR halved; FLAT unchanged.
        log.append(&record("WINR", 2.0, "fda")).unwrap();
        log.append(&record("LOSR", 2.0, "dilution")).unwrap();
        log.append(&record("FLAT", 2.0, "contract")).unwrap();

        let provider = FlatProvider {
            quotes: [
                ("WINR".to_string(), 4.0),
                ("LOSR".to_string(), 1.0),
                ("FLAT".to_string(), 2.02),
            ]
            .into(),
        };
        let prices = PriceService::new(vec![Arc::new(provider)], None);
        let params = ParamSnapshot::default();

        let report = build_report(&log, &prices, Utc::now().date_naive(), &params)
            .await
            .unwrap();
        assert_eq!(report.dispatched, 3);
        assert_eq!(report.wins, 1);
        assert_eq!(report.losses, 1);
        assert_eq!(report.flat, 1);
        assert_eq!(report.win_rate, Some(0.5));
        assert!(report.category_performance["fda"] > 90.0);
    }

    #[test]
    fn low_win_rate_recommends_tightening() {
        let params = ParamSnapshot::default();
        let recs = recommend(&params, 20, Some(0.2), &BTreeMap::new());
        assert_eq!(recs.len(), 1);
        assert_eq!(recs[0].key, schema::MIN_SCORE);
        assert_eq!(recs[0].value, json!(0.30));
        assert!(recs[0].rationale.contains("below 40%"));
    }

    #[test]
    fn small_samples_recommend_nothing() {
        let params = ParamSnapshot::default();
        assert!(recommend(&params, 3, Some(0.0), &BTreeMap::new()).is_empty());
    }

    #[test]
    fn payload_carries_approval_buttons() {
        let report = NightlyReport {
            date: NaiveDate::from_ymd_opt(2026, 3, 1).unwrap(),
            processed: 40,
            dispatched: 12,
            wins: 3,
            losses: 7,
            flat: 2,
            win_rate: Some(0.3),
            category_performance: BTreeMap::new(),
            recommendations: vec![Recommendation {
                key: schema::MIN_SCORE.to_string(),
                value: json!(0.30),
                rationale: "test".to_string(),
            }],
        };
        let payload = report_payload(&report);
        assert_eq!(
            payload["components"][0]["components"][0]["custom_id"],
            "reco:MIN_SCORE=0.3"
        );
        assert!(payload["embeds"][0]["title"]
            .as_str()
            .unwrap()
            .contains("2026-03-01"));
    }
}
