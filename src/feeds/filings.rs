//! Filings index adapter.
//!
//! Polls a JSON index of recent filings. Each entry carries the official
//! accession number, which becomes both the item identity and the
//! cross-source dedup signature.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use reqwest::Client;
use serde::Deserialize;
use std::time::{Duration, Instant};
use tracing::debug;

use super::{
    floor_not_elapsed, ConditionalState, FeedAdapter, FetchContext, FetchDiagnostics, FetchOutcome,
};
use crate::models::NewsItem;

/// Forms worth scanning; everything else is administrative noise.
const MATERIAL_FORMS: &[&str] = &["8-K", "6-K", "S-1", "S-3", "424B5", "10-K", "10-Q", "SC 13D"];

#[derive(Debug, Deserialize)]
struct IndexEntry {
    #[serde(alias = "accession_number")]
    accession: String,
    #[serde(alias = "form_type")]
    form: String,
    company: String,
    #[serde(default)]
    cik: Option<String>,
    #[serde(alias = "filed_at")]
    filed: String,
    #[serde(alias = "link")]
    url: String,
    #[serde(default)]
    title: Option<String>,
}

pub struct FilingsFeed {
    url: String,
    client: Client,
    state: Mutex<ConditionalState>,
}

impl FilingsFeed {
    pub fn new(url: impl Into<String>) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(20))
            .user_agent("catalyst-bot/0.1 (filings ingest)")
            .build()
            .expect("Failed to create HTTP client");
        Self {
            url: url.into(),
            client,
            state: Mutex::new(ConditionalState::default()),
        }
    }
}

/// Parse the JSON index body into normalized filing items.
pub fn parse_filings_index(bytes: &[u8], now: DateTime<Utc>) -> Vec<NewsItem> {
    let Ok(entries) = serde_json::from_slice::<Vec<IndexEntry>>(bytes) else {
        return Vec::new();
    };
    let mut items = Vec::with_capacity(entries.len());
    for entry in entries {
        let accession = entry.accession.trim();
        if accession.is_empty() {
            continue;
        }
        let form = entry.form.trim();
        if !MATERIAL_FORMS.iter().any(|known| form.starts_with(known)) {
            continue;
        }
        let published_at = DateTime::parse_from_rfc3339(&entry.filed)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or(now);
        let title = entry
            .title
            .filter(|t| !t.trim().is_empty())
            .unwrap_or_else(|| format!("{form}: {}", entry.company));
        let mut item = NewsItem::new(
            "filings",
            accession,
            published_at,
            entry.url,
            title,
            format!("{} filed form {form}", entry.company),
        )
        .with_filing(accession);
        if let Some(cik) = entry.cik {
            item.annotate("cik", serde_json::Value::String(cik));
        }
        item.annotate("form", serde_json::Value::String(form.to_string()));
        items.push(item);
    }
    items
}

#[async_trait]
impl FeedAdapter for FilingsFeed {
    fn name(&self) -> &str {
        "filings"
    }

    // Published fair-access floor for the filings index.
    fn min_interval(&self) -> Duration {
        Duration::from_secs(10)
    }

    async fn fetch(&self, ctx: &FetchContext) -> FetchOutcome {
        let mut diagnostics = FetchDiagnostics {
            source: "filings".to_string(),
            ..Default::default()
        };

        {
            let state = self.state.lock();
            if floor_not_elapsed(&state, self.min_interval()) {
                diagnostics.skipped = true;
                return FetchOutcome {
                    items: Vec::new(),
                    diagnostics,
                };
            }
        }

        let started = Instant::now();
        let req = {
            let state = self.state.lock();
            state.apply(self.client.get(&self.url))
        };
        let resp = match req.send().await {
            Ok(resp) => resp,
            Err(e) => {
                diagnostics.error = Some(e.to_string());
                diagnostics.latency_ms = started.elapsed().as_millis() as u64;
                return FetchOutcome {
                    items: Vec::new(),
                    diagnostics,
                };
            }
        };
        {
            let mut state = self.state.lock();
            state.last_fetch = Some(Instant::now());
            state.update_from(&resp);
        }
        diagnostics.latency_ms = started.elapsed().as_millis() as u64;

        if resp.status() == reqwest::StatusCode::NOT_MODIFIED {
            diagnostics.not_modified = true;
            return FetchOutcome {
                items: Vec::new(),
                diagnostics,
            };
        }
        if !resp.status().is_success() {
            diagnostics.error = Some(format!("http {}", resp.status().as_u16()));
            return FetchOutcome {
                items: Vec::new(),
                diagnostics,
            };
        }
        let bytes = match resp.bytes().await {
            Ok(bytes) => bytes,
            Err(e) => {
                diagnostics.error = Some(e.to_string());
                return FetchOutcome {
                    items: Vec::new(),
                    diagnostics,
                };
            }
        };
        let items = parse_filings_index(&bytes, ctx.now);
        diagnostics.fetched = items.len();
        debug!(fetched = items.len(), "Filings index fetched");
        FetchOutcome { items, diagnostics }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FIXTURE: &str = r#"[
      {
        "accession": "0000320193-26-000042",
        "form": "8-K",
        "company": "Acme Therapeutics",
        "cik": "0000320193",
        "filed": "2026-03-02T13:05:00Z",
        "url": "https://filings.example/archives/0000320193-26-000042.htm"
      },
      {
        "accession": "0000999999-26-000007",
        "form": "4",
        "company": "Insider Trades Inc",
        "filed": "2026-03-02T13:06:00Z",
        "url": "https://filings.example/archives/0000999999-26-000007.htm"
      },
      {
        "accession": "",
        "form": "8-K",
        "company": "Blank Accession Corp",
        "filed": "2026-03-02T13:07:00Z",
        "url": "https://filings.example/archives/blank.htm"
      }
    ]"#;

    #[test]
    fn keeps_material_forms_only() {
        let items = parse_filings_index(FIXTURE.as_bytes(), Utc::now());
        assert_eq!(items.len(), 1);
        let item = &items[0];
        assert!(item.is_filing);
        assert_eq!(item.accession_no.as_deref(), Some("0000320193-26-000042"));
        assert_eq!(item.source_id, "0000320193-26-000042");
        assert_eq!(item.title, "8-K: Acme Therapeutics");
        assert_eq!(
            item.annotations.get("cik").and_then(|v| v.as_str()),
            Some("0000320193")
        );
    }

    #[test]
    fn malformed_index_yields_no_items() {
        assert!(parse_filings_index(b"{}", Utc::now()).is_empty());
    }
}
