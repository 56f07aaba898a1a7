//! Alert composition.
//!
//! Builds the embed plus the attachments declaration block. Every
//! `attachment://<name>` referenced inside the embed MUST have a matching
//! entry in `attachments[]` with a stable integer id — the platform
//! silently drops undeclared files.

use std::path::{Path, PathBuf};

use crate::models::{AlertArtifact, AttachmentDecl, ClassifiedItem};

const COLOR_BULLISH: u32 = 0x2E_CC71;
const COLOR_BEARISH: u32 = 0xE7_4C3C;
const COLOR_NEUTRAL: u32 = 0x95_A5A6;

pub struct AlertBuilder;

impl AlertBuilder {
    /// Compose the artifact. Chart and gauge paths must be absolute (the
    /// chart cache guarantees this).
    pub fn build(
        classified: &ClassifiedItem,
        chart: Option<PathBuf>,
        gauge: Option<PathBuf>,
    ) -> AlertArtifact {
        let item = &classified.item;
        let ticker = item.ticker.as_deref().unwrap_or("?");

        let price_line = match &classified.price {
            Some(price) => {
                let last = price
                    .last
                    .map(|v| format!("${v:.2}"))
                    .unwrap_or_else(|| "n/a".to_string());
                match price.change_pct {
                    Some(pct) => format!("{last} ({pct:+.1}%)"),
                    None => last,
                }
            }
            None => "n/a".to_string(),
        };

        let keywords = if classified.keywords_hit.is_empty() {
            "—".to_string()
        } else {
            classified
                .keywords_hit
                .iter()
                .map(|hit| hit.tag.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        };

        let color = if classified.sentiment >= 0.15 {
            COLOR_BULLISH
        } else if classified.sentiment <= -0.15 {
            COLOR_BEARISH
        } else {
            COLOR_NEUTRAL
        };

        let mut embed = serde_json::json!({
            "title": item.title,
            "url": item.url,
            "color": color,
            "timestamp": item.published_at.to_rfc3339(),
            "fields": [
                {"name": "Ticker", "value": format!("${ticker}"), "inline": true},
                {"name": "Price", "value": price_line, "inline": true},
                {"name": "Score", "value": format!("{:.2}", classified.score), "inline": true},
                {
                    "name": "Sentiment",
                    "value": format!("{:+.2} (conf {:.2})", classified.sentiment, classified.confidence),
                    "inline": true
                },
                {"name": "Keywords", "value": keywords, "inline": false},
            ],
            "footer": {"text": format!("{} · catalyst-bot", item.source)},
        });

        let mut attachments = Vec::new();
        let mut files = Vec::new();
        if let Some(chart) = chart {
            let filename = filename_of(&chart);
            embed["image"] = serde_json::json!({"url": format!("attachment://{filename}")});
            attachments.push(AttachmentDecl {
                id: attachments.len() as u32,
                filename,
                description: "Chart".to_string(),
            });
            files.push(chart);
        }
        if let Some(gauge) = gauge {
            let filename = filename_of(&gauge);
            embed["thumbnail"] = serde_json::json!({"url": format!("attachment://{filename}")});
            attachments.push(AttachmentDecl {
                id: attachments.len() as u32,
                filename,
                description: "Sentiment Gauge".to_string(),
            });
            files.push(gauge);
        }

        let components = (!item.url.is_empty()).then(|| {
            serde_json::json!([{
                "type": 1,
                "components": [{
                    "type": 2,
                    "style": 5,
                    "label": "Source",
                    "url": item.url,
                }]
            }])
        });

        AlertArtifact {
            embed,
            attachments,
            files,
            components,
            idempotency_key: format!("{}|{}|{}", item.source, item.source_id, ticker),
        }
    }
}

fn filename_of(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "attachment.png".to_string())
}

/// Every `attachment://` URI in the embed must be declared. Used by the
/// dispatcher as a last-line check and directly by tests.
pub fn attachments_consistent(artifact: &AlertArtifact) -> bool {
    let embed_text = artifact.embed.to_string();
    let declared: Vec<&str> = artifact
        .attachments
        .iter()
        .map(|decl| decl.filename.as_str())
        .collect();

    // Unique ids, aligned with file count.
    let mut ids: Vec<u32> = artifact.attachments.iter().map(|d| d.id).collect();
    ids.sort_unstable();
    ids.dedup();
    if ids.len() != artifact.attachments.len() || artifact.attachments.len() != artifact.files.len()
    {
        return false;
    }

    let mut rest = embed_text.as_str();
    while let Some(idx) = rest.find("attachment://") {
        rest = &rest[idx + "attachment://".len()..];
        let end = rest
            .find(|c: char| c == '"' || c == '\\' || c.is_whitespace())
            .unwrap_or(rest.len());
        let referenced = &rest[..end];
        if !declared.contains(&referenced) {
            return false;
        }
        rest = &rest[end..];
    }
    true
}
