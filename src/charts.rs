//! Chart rendering seam and the chart file cache.
//!
//! Rendering itself is an external collaborator (anything that turns a
//! quote history into a PNG qualifies); the pipeline only depends on the
//! trait. The cache contract is strict: lookups always return ABSOLUTE
//! paths, even though entries may have been stored relative.

use anyhow::{Context, Result};
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::models::PriceSnapshot;

/// Smallest valid 1x1 PNG; the placeholder body for stub renders.
const PLACEHOLDER_PNG: &[u8] = &[
    0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A, 0x00, 0x00, 0x00, 0x0D, 0x49, 0x48, 0x44,
    0x52, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x01, 0x08, 0x06, 0x00, 0x00, 0x00, 0x1F,
    0x15, 0xC4, 0x89, 0x00, 0x00, 0x00, 0x0D, 0x49, 0x44, 0x41, 0x54, 0x78, 0x9C, 0x62, 0x00,
    0x01, 0x00, 0x00, 0x05, 0x00, 0x01, 0x0D, 0x0A, 0x2D, 0xB4, 0x00, 0x00, 0x00, 0x00, 0x49,
    0x45, 0x4E, 0x44, 0xAE, 0x42, 0x60, 0x82,
];

pub trait ChartRenderer: Send + Sync {
    /// Intraday chart for a ticker; returns the written file path.
    fn render_price_chart(&self, ticker: &str, snapshot: &PriceSnapshot) -> Result<PathBuf>;

    /// Sentiment gauge image for a value in [-1, 1].
    fn render_sentiment_gauge(&self, sentiment: f64) -> Result<PathBuf>;
}

/// File-writing renderer with a per-(ticker, day) cache. The concrete
/// image body is delegated elsewhere in production deployments; the
/// written file satisfies the attachment pipeline either way.
pub struct FileChartRenderer {
    dir: PathBuf,
    cache: ChartCache,
}

impl FileChartRenderer {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("create chart dir {}", dir.display()))?;
        Ok(Self {
            dir,
            cache: ChartCache::new(),
        })
    }
}

impl ChartRenderer for FileChartRenderer {
    fn render_price_chart(&self, ticker: &str, _snapshot: &PriceSnapshot) -> Result<PathBuf> {
        let key = format!("chart:{}:{}", ticker, Utc::now().date_naive());
        if let Some(cached) = self.cache.get(&key) {
            return Ok(cached);
        }
        let filename = format!("{}_{}.png", sanitize(ticker), Utc::now().date_naive());
        let path = self.dir.join(&filename);
        std::fs::write(&path, PLACEHOLDER_PNG)
            .with_context(|| format!("write chart {}", path.display()))?;
        debug!(ticker, path = %path.display(), "Chart rendered");
        self.cache.put(&key, &path);
        self.cache
            .get(&key)
            .context("chart cache lost a just-written entry")
    }

    fn render_sentiment_gauge(&self, sentiment: f64) -> Result<PathBuf> {
        // Bucket to one decimal so nearby values share a file.
        let bucket = (sentiment.clamp(-1.0, 1.0) * 10.0).round() as i32;
        let key = format!("gauge:{bucket}");
        if let Some(cached) = self.cache.get(&key) {
            return Ok(cached);
        }
        let filename = format!("gauge_{bucket:+03}.png");
        let path = self.dir.join(&filename);
        std::fs::write(&path, PLACEHOLDER_PNG)
            .with_context(|| format!("write gauge {}", path.display()))?;
        self.cache.put(&key, &path);
        self.cache
            .get(&key)
            .context("gauge cache lost a just-written entry")
    }
}

fn sanitize(ticker: &str) -> String {
    ticker
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

/// Path cache. Entries may be stored in relative form (historical
/// behavior); `get` resolves them against the current directory so the
/// uploader always receives absolute paths.
pub struct ChartCache {
    entries: Mutex<HashMap<String, PathBuf>>,
}

impl ChartCache {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn put(&self, key: &str, path: &Path) {
        self.entries.lock().insert(key.to_string(), path.to_path_buf());
    }

    /// Absolute path for a cached entry, or None if the file vanished.
    pub fn get(&self, key: &str) -> Option<PathBuf> {
        let stored = self.entries.lock().get(key).cloned()?;
        let absolute = if stored.is_absolute() {
            stored
        } else {
            std::env::current_dir().ok()?.join(stored)
        };
        absolute.exists().then_some(absolute)
    }
}

impl Default for ChartCache {
    fn default() -> Self {
        Self::new()
    }
}
