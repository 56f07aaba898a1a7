//! Press-release wire adapter (RSS/Atom-over-RSS endpoints).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use reqwest::Client;
use sha2::{Digest, Sha256};
use std::time::{Duration, Instant};
use tracing::debug;

use super::{
    floor_not_elapsed, ConditionalState, FeedAdapter, FetchContext, FetchDiagnostics, FetchOutcome,
};
use crate::models::NewsItem;

pub struct WireFeed {
    name: String,
    url: String,
    client: Client,
    state: Mutex<ConditionalState>,
    min_interval: Duration,
}

impl WireFeed {
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(15))
            .user_agent("catalyst-bot/0.1 (wire ingest)")
            .build()
            .expect("Failed to create HTTP client");
        Self {
            name: name.into(),
            url: url.into(),
            client,
            state: Mutex::new(ConditionalState::default()),
            // Wire endpoints publish a 30 s polite floor.
            min_interval: Duration::from_secs(30),
        }
    }
}

/// Parse one RSS document into normalized items.
pub fn parse_wire_feed(source: &str, bytes: &[u8], now: DateTime<Utc>) -> Vec<NewsItem> {
    let Ok(channel) = rss::Channel::read_from(bytes) else {
        return Vec::new();
    };
    let mut items = Vec::with_capacity(channel.items().len());
    for entry in channel.items() {
        let title = entry.title().unwrap_or("").trim();
        if title.is_empty() {
            continue;
        }
        let url = entry.link().unwrap_or("").trim().to_string();
        let published_at = entry
            .pub_date()
            .and_then(|raw| DateTime::parse_from_rfc2822(raw).ok())
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or(now);
        let source_id = entry
            .guid()
            .map(|guid| guid.value().to_string())
            .filter(|value| !value.is_empty())
            .unwrap_or_else(|| {
                let mut hasher = Sha256::new();
                hasher.update(url.as_bytes());
                hasher.update(title.as_bytes());
                hex::encode(hasher.finalize())
            });
        let summary = entry.description().unwrap_or("").trim().to_string();
        items.push(NewsItem::new(
            source,
            source_id,
            published_at,
            url,
            title,
            summary,
        ));
    }
    items
}

#[async_trait]
impl FeedAdapter for WireFeed {
    fn name(&self) -> &str {
        &self.name
    }

    fn min_interval(&self) -> Duration {
        self.min_interval
    }

    async fn fetch(&self, ctx: &FetchContext) -> FetchOutcome {
        let mut diagnostics = FetchDiagnostics {
            source: self.name.clone(),
            ..Default::default()
        };

        {
            let state = self.state.lock();
            if floor_not_elapsed(&state, self.min_interval) {
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
        let items = parse_wire_feed(&self.name, &bytes, ctx.now);
        diagnostics.fetched = items.len();
        debug!(source = %self.name, fetched = items.len(), "Wire feed fetched");
        FetchOutcome { items, diagnostics }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FIXTURE: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<rss version="2.0"><channel>
  <title>Test Wire</title>
  <link>https://wire.example</link>
  <description>Releases</description>
  <item>
    <title>Acme Therapeutics Announces FDA Approval</title>
    <link>https://wire.example/releases/acme-fda?utm_source=rss</link>
    <guid>wire-1001</guid>
    <pubDate>Mon, 02 Mar 2026 13:00:00 GMT</pubDate>
    <description>Acme received approval for its lead candidate.</description>
  </item>
  <item>
    <title></title>
    <link>https://wire.example/releases/empty</link>
  </item>
  <item>
    <title>Beta Mining Prices Public Offering</title>
    <link>https://wire.example/releases/beta-offering</link>
  </item>
</channel></rss>"#;

    #[test]
    fn parses_items_and_skips_blank_titles() {
        let now = Utc::now();
        let items = parse_wire_feed("test-wire", FIXTURE.as_bytes(), now);
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].source_id, "wire-1001");
        assert_eq!(items[0].title, "Acme Therapeutics Announces FDA Approval");
        assert_eq!(
            items[0].published_at,
            DateTime::parse_from_rfc2822("Mon, 02 Mar 2026 13:00:00 GMT")
                .unwrap()
                .with_timezone(&Utc)
        );
        // No guid: stable hash id, and missing pubDate falls back to now.
        assert_eq!(items[1].published_at, now);
        assert_eq!(items[1].source_id.len(), 64);
    }

    #[test]
    fn malformed_xml_yields_no_items() {
        let items = parse_wire_feed("test-wire", b"not xml at all", Utc::now());
        assert!(items.is_empty());
    }
}
