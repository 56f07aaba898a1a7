//! Cross-source deduplication.
//!
//! Two signatures per item, both persisted:
//! - ID key: hash over `source | source_id` — exact match within a source.
//! - Content key: hash over canonical URL + normalized title; filings
//!   derive it from the accession number alone, so viewer, preview and
//!   archive URLs of one filing collapse to a single key.
//!
//! The SQLite layer is the source of truth; a short-TTL in-memory set
//! serves hot re-checks. Check-and-mark is atomic per key (single
//! connection mutex), so concurrent workers cannot both observe Fresh.

use anyhow::Result;
use chrono::Utc;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

use crate::models::{DedupDecision, NewsItem};
use crate::storage::Storage;

/// Similarity floor for treating two normalized titles as the same story.
const TITLE_SIMILARITY_THRESHOLD: f64 = 0.8;
/// How far back the fuzzy pass looks, and how many titles it compares.
const FUZZY_WINDOW_SECS: i64 = 48 * 3600;
const FUZZY_CANDIDATE_LIMIT: u32 = 512;
const HOT_CACHE_TTL: Duration = Duration::from_secs(15 * 60);

#[derive(Debug, Clone)]
pub struct DedupKeys {
    pub id_key: String,
    pub sig_key: String,
    pub title_norm: String,
}

fn sha256_hex(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
}

/// Lower-case, strip zero-width characters and punctuation, collapse
/// whitespace. Hashing only — display text keeps the original.
pub fn normalize_title(title: &str) -> String {
    let mut out = String::with_capacity(title.len());
    let mut last_space = true;
    for ch in title.chars() {
        match ch {
            '\u{200b}' | '\u{200c}' | '\u{200d}' | '\u{feff}' => continue,
            c if c.is_alphanumeric() => {
                for lower in c.to_lowercase() {
                    out.push(lower);
                }
                last_space = false;
            }
            _ => {
                if !last_space {
                    out.push(' ');
                    last_space = true;
                }
            }
        }
    }
    out.trim_end().to_string()
}

/// Strip tracking query parameters and the fragment; lower-case host.
pub fn canonicalize_url(url: &str) -> String {
    let no_fragment = url.split('#').next().unwrap_or(url);
    let (base, query) = match no_fragment.split_once('?') {
        Some((base, query)) => (base, Some(query)),
        None => (no_fragment, None),
    };
    let base = base.trim_end_matches('/').to_lowercase();
    let Some(query) = query else {
        return base;
    };
    let kept: Vec<&str> = query
        .split('&')
        .filter(|pair| {
            let key = pair.split('=').next().unwrap_or("");
            let key = key.to_lowercase();
            !(key.starts_with("utm_")
                || key == "ref"
                || key == "source"
                || key == "fbclid"
                || key == "gclid")
        })
        .collect();
    if kept.is_empty() {
        base
    } else {
        format!("{base}?{}", kept.join("&"))
    }
}

/// Derive both dedup keys for an item.
pub fn keys_for(item: &NewsItem) -> DedupKeys {
    let id_key = sha256_hex(&format!("{}|{}", item.source, item.source_id));
    let title_norm = normalize_title(&item.title);
    let sig_key = match &item.accession_no {
        Some(accession) => sha256_hex(&format!("accession|{}", accession.trim())),
        None => sha256_hex(&format!(
            "{}|{}",
            canonicalize_url(&item.url),
            title_norm
        )),
    };
    DedupKeys {
        id_key,
        sig_key,
        // Filings match exactly on accession; skip the fuzzy pass for them.
        title_norm: if item.is_filing { String::new() } else { title_norm },
    }
}

#[derive(Clone)]
pub struct DedupStore {
    storage: Storage,
    hot: Arc<Mutex<HashMap<String, Instant>>>,
}

impl DedupStore {
    pub fn new(storage: Storage) -> Self {
        Self {
            storage,
            hot: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Remove entries older than the TTL. Called once at startup.
    pub fn purge_expired(&self, seen_ttl_days: u32) -> Result<usize> {
        let cutoff = Utc::now().timestamp() - i64::from(seen_ttl_days) * 86_400;
        self.storage.purge_seen(cutoff)
    }

    fn cutoff_ts(seen_ttl_days: u32) -> i64 {
        Utc::now().timestamp() - i64::from(seen_ttl_days) * 86_400
    }

    fn hot_contains(&self, key: &str) -> bool {
        let mut hot = self.hot.lock();
        match hot.get(key) {
            Some(at) if at.elapsed() < HOT_CACHE_TTL => true,
            Some(_) => {
                hot.remove(key);
                false
            }
            None => false,
        }
    }

    fn hot_insert(&self, keys: &DedupKeys) {
        let mut hot = self.hot.lock();
        let now = Instant::now();
        hot.insert(keys.id_key.clone(), now);
        hot.insert(keys.sig_key.clone(), now);
        // Bound the hot set; expired entries dominate once large.
        if hot.len() > 65_536 {
            hot.retain(|_, at| at.elapsed() < HOT_CACHE_TTL);
        }
    }

    /// Read-only check against both indexes, including the fuzzy title
    /// pass for non-filing content.
    pub fn check(&self, keys: &DedupKeys, seen_ttl_days: u32) -> Result<DedupDecision> {
        if self.hot_contains(&keys.id_key) {
            return Ok(DedupDecision::SeenById);
        }
        if self.hot_contains(&keys.sig_key) {
            return Ok(DedupDecision::SeenBySig);
        }
        let cutoff = Self::cutoff_ts(seen_ttl_days);
        if self.storage.seen_id_contains(&keys.id_key, cutoff)? {
            return Ok(DedupDecision::SeenById);
        }
        if self.storage.seen_sig_contains(&keys.sig_key, cutoff)? {
            return Ok(DedupDecision::SeenBySig);
        }
        if !keys.title_norm.is_empty() && self.fuzzy_title_match(&keys.title_norm)? {
            return Ok(DedupDecision::SeenBySig);
        }
        Ok(DedupDecision::Fresh)
    }

    /// Atomic check-and-mark: exactly one caller per key observes Fresh,
    /// regardless of interleaving.
    pub fn check_and_mark(&self, keys: &DedupKeys, seen_ttl_days: u32) -> Result<DedupDecision> {
        let cutoff = Self::cutoff_ts(seen_ttl_days);
        let now = Utc::now().timestamp();
        let (id_hit, sig_hit) =
            self.storage
                .check_and_mark(&keys.id_key, &keys.sig_key, &keys.title_norm, now, cutoff)?;
        self.hot_insert(keys);
        if id_hit {
            Ok(DedupDecision::SeenById)
        } else if sig_hit {
            Ok(DedupDecision::SeenBySig)
        } else {
            Ok(DedupDecision::Fresh)
        }
    }

    /// Persist both keys (idempotent). Called after successful dispatch
    /// or a terminal rejection.
    pub fn mark_seen(&self, keys: &DedupKeys) -> Result<()> {
        self.storage
            .mark_seen(&keys.id_key, &keys.sig_key, &keys.title_norm, Utc::now().timestamp())?;
        self.hot_insert(keys);
        Ok(())
    }

    /// Forget both keys so a transiently failed dispatch is retried next
    /// cycle.
    pub fn unmark(&self, keys: &DedupKeys) -> Result<()> {
        self.storage.unmark(&keys.id_key, &keys.sig_key)?;
        let mut hot = self.hot.lock();
        hot.remove(&keys.id_key);
        hot.remove(&keys.sig_key);
        Ok(())
    }

    fn fuzzy_title_match(&self, title_norm: &str) -> Result<bool> {
        let since = Utc::now().timestamp() - FUZZY_WINDOW_SECS;
        let recent = self
            .storage
            .recent_sig_titles(since, FUZZY_CANDIDATE_LIMIT)?;
        for candidate in &recent {
            let similarity = strsim::sorensen_dice(title_norm, candidate);
            if similarity >= TITLE_SIMILARITY_THRESHOLD {
                debug!(similarity, "Fuzzy title match against recent signature");
                return Ok(true);
            }
        }
        Ok(false)
    }
}
