//! Ticker resolution and exchange validation.
//!
//! Filings resolve through a filer-id table; headlines through cashtags
//! and known-ticker uppercase tokens. Validation admits primary-exchange
//! common stock only: OTC suffixes, foreign-ADR shapes and warrant/unit/
//! right decorators are rejected with a structured reason.

use anyhow::{Context, Result};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use tracing::{info, warn};

use crate::models::NewsItem;

/// All-caps tokens that look like tickers but never are.
const STOPWORDS: &[&str] = &[
    "A", "AI", "AN", "CEO", "CFO", "EPS", "ETF", "FDA", "GAAP", "IPO", "LLC", "NASDAQ", "NYSE",
    "OTC", "Q1", "Q2", "Q3", "Q4", "SEC", "TO", "US", "USA", "USD", "VS",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickerReject {
    OtcSuffix,
    ForeignAdr,
    InstrumentDecorator,
    NotListed,
    Malformed,
}

impl TickerReject {
    pub fn as_str(&self) -> &'static str {
        match self {
            TickerReject::OtcSuffix => "otc_suffix",
            TickerReject::ForeignAdr => "foreign_adr",
            TickerReject::InstrumentDecorator => "instrument_decorator",
            TickerReject::NotListed => "not_listed",
            TickerReject::Malformed => "malformed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Primary {
        ticker: String,
        all: Vec<String>,
    },
    /// Sector/commentary items mapping to too many names.
    MultiTicker(usize),
    NoTicker,
    Rejected(TickerReject),
}

pub struct TickerResolver {
    /// Primary-exchange listings (NASDAQ/NYSE/AMEX), refreshed out of band.
    listings: HashSet<String>,
    /// Filer identifier (CIK) to primary ticker.
    filer_map: HashMap<String, String>,
}

impl TickerResolver {
    pub fn new(listings: HashSet<String>, filer_map: HashMap<String, String>) -> Self {
        Self { listings, filer_map }
    }

    /// Load the listings file (one ticker per line) and the filer map
    /// (JSON object of cik -> ticker). Either may be absent; an empty
    /// listings set disables the positive-exchange check.
    pub fn from_files(listings_path: Option<&Path>, filer_map_path: Option<&Path>) -> Result<Self> {
        let mut listings = HashSet::new();
        if let Some(path) = listings_path {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("read listings at {}", path.display()))?;
            for line in raw.lines() {
                let ticker = line.trim().to_uppercase();
                if !ticker.is_empty() && !ticker.starts_with('#') {
                    listings.insert(ticker);
                }
            }
            info!(count = listings.len(), "Exchange listings loaded");
        } else {
            warn!("No listings file configured; exchange membership check disabled");
        }

        let mut filer_map = HashMap::new();
        if let Some(path) = filer_map_path {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("read filer map at {}", path.display()))?;
            let parsed: HashMap<String, String> =
                serde_json::from_str(&raw).context("parse filer map json")?;
            for (cik, ticker) in parsed {
                filer_map.insert(normalize_cik(&cik), ticker.to_uppercase());
            }
            info!(count = filer_map.len(), "Filer map loaded");
        }
        Ok(Self { listings, filer_map })
    }

    /// Validate one symbol against the exclusion rules and (when
    /// available) the exchange listing set.
    pub fn validate(&self, ticker: &str) -> Result<(), TickerReject> {
        let t = ticker.trim().to_uppercase();
        if t.is_empty() || t.len() > 10 {
            return Err(TickerReject::Malformed);
        }
        if !t
            .chars()
            .all(|c| c.is_ascii_uppercase() || c == '.' || c == '-')
        {
            return Err(TickerReject::Malformed);
        }

        let (base, decorator) = split_decorator(&t);

        if let Some(decorator) = decorator {
            match decorator {
                "PK" | "QB" | "QX" => return Err(TickerReject::OtcSuffix),
                // Preferred-share series (e.g. ABC-PRA) are allowed.
                d if d.starts_with("PR") => {}
                "W" | "WT" | "WS" | "U" | "R" => {
                    return Err(TickerReject::InstrumentDecorator)
                }
                _ => return Err(TickerReject::Malformed),
            }
        }

        if base.len() >= 5 && (base.ends_with("PK") || base.ends_with("QB") || base.ends_with("QX"))
        {
            return Err(TickerReject::OtcSuffix);
        }
        // Five-letter symbols ending in F are overwhelmingly foreign ADRs.
        if base.len() >= 5 && base.ends_with('F') {
            return Err(TickerReject::ForeignAdr);
        }
        // Five-letter W-terminal symbols are warrants in dotted-suffix feeds.
        if base.len() == 5 && base.ends_with('W') && !self.listings.contains(base) {
            return Err(TickerReject::InstrumentDecorator);
        }

        if !self.listings.is_empty() && !self.listings.contains(base) {
            return Err(TickerReject::NotListed);
        }
        Ok(())
    }

    /// Resolve the primary ticker for an item.
    pub fn resolve(&self, item: &NewsItem, max_tickers: usize) -> Resolution {
        // Filings map through the filer table first.
        if item.is_filing {
            if let Some(cik) = item.annotations.get("cik").and_then(|v| v.as_str()) {
                if let Some(ticker) = self.filer_map.get(&normalize_cik(cik)) {
                    return match self.validate(ticker) {
                        Ok(()) => Resolution::Primary {
                            ticker: ticker.clone(),
                            all: vec![ticker.clone()],
                        },
                        Err(reject) => Resolution::Rejected(reject),
                    };
                }
            }
            // Fall through: some filing titles carry cashtags.
        }

        let mut candidates: Vec<String> = Vec::new();
        let mut push = |ticker: String, candidates: &mut Vec<String>| {
            if !candidates.contains(&ticker) {
                candidates.push(ticker);
            }
        };

        for pre_resolved in &item.tickers_mentioned {
            push(pre_resolved.to_uppercase(), &mut candidates);
        }
        for extracted in extract_candidates(&item.title, &self.listings) {
            push(extracted, &mut candidates);
        }

        if candidates.is_empty() {
            return Resolution::NoTicker;
        }
        if candidates.len() > max_tickers {
            return Resolution::MultiTicker(candidates.len());
        }

        // First candidate that survives validation wins; remember the
        // first rejection so a fully-invalid item reports why.
        let mut first_reject = None;
        for candidate in &candidates {
            match self.validate(candidate) {
                Ok(()) => {
                    return Resolution::Primary {
                        ticker: candidate.clone(),
                        all: candidates.clone(),
                    }
                }
                Err(reject) => {
                    if first_reject.is_none() {
                        first_reject = Some(reject);
                    }
                }
            }
        }
        match first_reject {
            Some(reject) => Resolution::Rejected(reject),
            None => Resolution::NoTicker,
        }
    }
}

fn normalize_cik(cik: &str) -> String {
    cik.trim().trim_start_matches('0').to_string()
}

/// Split a trailing decorator off `-X`/`.X` forms.
fn split_decorator(ticker: &str) -> (&str, Option<&str>) {
    for sep in ['-', '.'] {
        if let Some(idx) = ticker.rfind(sep) {
            let (base, rest) = ticker.split_at(idx);
            return (base, Some(&rest[1..]));
        }
    }
    (ticker, None)
}

/// Cashtags always qualify; bare uppercase tokens only when they appear
/// on the exchange list and are not common abbreviations.
fn extract_candidates(title: &str, listings: &HashSet<String>) -> Vec<String> {
    let mut out = Vec::new();
    let mut push = |t: String| {
        if !out.contains(&t) {
            out.push(t);
        }
    };
    for raw in title.split(|c: char| c.is_whitespace() || matches!(c, ',' | ';' | '(' | ')' | ':'))
    {
        let token = raw.trim_matches(|c: char| !c.is_ascii_alphanumeric() && c != '$');
        if let Some(tag) = token.strip_prefix('$') {
            let tag = tag.trim_matches(|c: char| !c.is_ascii_alphanumeric());
            if (1..=5).contains(&tag.len()) && tag.chars().all(|c| c.is_ascii_alphabetic()) {
                push(tag.to_uppercase());
            }
            continue;
        }
        if (2..=5).contains(&token.len())
            && token.chars().all(|c| c.is_ascii_uppercase())
            && !STOPWORDS.contains(&token)
            && listings.contains(token)
        {
            push(token.to_string());
        }
    }
    out
}
