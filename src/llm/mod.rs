//! LLM router: pre-filtered, complexity-routed, cached, cost-bounded.
//!
//! Sits between the classifier and the filter chain. Every failure mode
//! (provider error, budget ceiling, unparseable reply) converts to a
//! missing verdict; nothing here can fail a cycle.

pub mod client;

use chrono::{Datelike, Utc};
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::config::{LlmModels, ParamSnapshot};
use crate::models::LlmVerdict;
use crate::storage::Storage;
use self::client::{CompletionClient, CompletionParams};

const SYSTEM_PROMPT: &str = "You classify market catalysts for small-cap equities. \
Reply with exactly two lines:\nSENTIMENT=BULLISH|BEARISH|NEUTRAL\nCONFIDENCE=<0.0-1.0>";

/// Soft-warning fraction of either budget ceiling.
const BUDGET_SOFT_FRACTION: f64 = 0.8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Complexity {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelTier {
    Cheap,
    Medium,
    Expensive,
    Premium,
}

impl ModelTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelTier::Cheap => "cheap",
            ModelTier::Medium => "medium",
            ModelTier::Expensive => "expensive",
            ModelTier::Premium => "premium",
        }
    }

    /// Blended $ per 1k tokens used for budget accounting.
    fn rate_per_1k(&self) -> f64 {
        match self {
            ModelTier::Cheap => 0.0002,
            ModelTier::Medium => 0.0015,
            ModelTier::Expensive => 0.0090,
            ModelTier::Premium => 0.0250,
        }
    }
}

/// Route by complexity. Target tier shares are roughly 60/30/8/2: short,
/// keyword-light items stay cheap; long or high-stakes text escalates.
pub fn pick_tier(text: &str, hint: Complexity, score: f64) -> ModelTier {
    match hint {
        Complexity::Low => ModelTier::Cheap,
        Complexity::Medium => {
            if text.len() > 1200 {
                ModelTier::Expensive
            } else {
                ModelTier::Medium
            }
        }
        Complexity::High => {
            // The rare premium escalation: long text and a very strong
            // pre-score, where a wrong verdict is costly.
            if text.len() > 2000 && score >= 0.8 {
                ModelTier::Premium
            } else {
                ModelTier::Expensive
            }
        }
    }
}

/// Normalize a prompt for the semantic cache: case, punctuation and
/// whitespace differences must not cause a miss.
pub fn normalize_prompt(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut last_space = true;
    for ch in text.chars() {
        if ch.is_alphanumeric() {
            for lower in ch.to_lowercase() {
                out.push(lower);
            }
            last_space = false;
        } else if !last_space {
            out.push(' ');
            last_space = true;
        }
    }
    out.trim_end().to_string()
}

fn prompt_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(normalize_prompt(text).as_bytes());
    hex::encode(hasher.finalize())
}

/// Parse the two-line verdict DSL. Tolerant of extra prose around it.
pub fn parse_verdict(raw: &str, cached: bool) -> Option<LlmVerdict> {
    let mut sentiment: Option<(f64, String)> = None;
    let mut confidence: Option<f64> = None;
    for line in raw.lines() {
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        match key.trim().to_ascii_uppercase().as_str() {
            "SENTIMENT" => {
                let label = value.trim().to_ascii_uppercase();
                let value = match label.as_str() {
                    "BULLISH" => 0.8,
                    "BEARISH" => -0.8,
                    "NEUTRAL" => 0.0,
                    _ => continue,
                };
                sentiment = Some((value, label.to_lowercase()));
            }
            "CONFIDENCE" => {
                confidence = value
                    .trim()
                    .parse::<f64>()
                    .ok()
                    .filter(|v| v.is_finite())
                    .map(|v| v.clamp(0.0, 1.0));
            }
            _ => {}
        }
    }
    let (value, label) = sentiment?;
    Some(LlmVerdict {
        sentiment: value,
        confidence: confidence.unwrap_or(0.5),
        label,
        cached,
    })
}

#[derive(Debug, Default, Clone)]
pub struct RouterStats {
    pub requests: u64,
    pub cache_hits: u64,
    pub provider_calls: u64,
    pub provider_errors: u64,
    pub budget_blocked: u64,
}

pub struct LlmRequest {
    /// Index back into the caller's batch.
    pub index: usize,
    pub text: String,
    pub hint: Complexity,
    pub prescale: f64,
}

pub struct LlmRouter {
    client: Option<Arc<dyn CompletionClient>>,
    models: LlmModels,
    storage: Storage,
    stats: Mutex<RouterStats>,
}

impl LlmRouter {
    pub fn new(
        client: Option<Arc<dyn CompletionClient>>,
        models: LlmModels,
        storage: Storage,
    ) -> Self {
        Self {
            client,
            models,
            storage,
            stats: Mutex::new(RouterStats::default()),
        }
    }

    pub fn stats(&self) -> RouterStats {
        self.stats.lock().clone()
    }

    fn model_for(&self, tier: ModelTier) -> &str {
        match tier {
            ModelTier::Cheap => &self.models.cheap,
            ModelTier::Medium => &self.models.medium,
            ModelTier::Expensive => &self.models.expensive,
            ModelTier::Premium => &self.models.premium,
        }
    }

    fn day_key() -> String {
        format!("llm_cost:{}", Utc::now().date_naive())
    }

    fn month_key() -> String {
        let now = Utc::now();
        format!("llm_cost_month:{}-{:02}", now.year(), now.month())
    }

    fn spent(&self, key: &str) -> f64 {
        self.storage
            .meta_get(key)
            .ok()
            .flatten()
            .and_then(|raw| raw.parse().ok())
            .unwrap_or(0.0)
    }

    fn add_cost(&self, cost: f64) {
        for key in [Self::day_key(), Self::month_key()] {
            let total = self.spent(&key) + cost;
            if let Err(e) = self.storage.meta_set(&key, &format!("{total:.6}")) {
                warn!(error = %e, "LLM cost counter write failed");
            }
        }
    }

    /// True when either ceiling is exhausted. Warns once per soft crossing.
    fn budget_exhausted(&self, params: &ParamSnapshot) -> bool {
        let day = self.spent(&Self::day_key());
        let month = self.spent(&Self::month_key());
        if day >= params.llm_daily_budget_usd || month >= params.llm_monthly_budget_usd {
            return true;
        }
        if day >= params.llm_daily_budget_usd * BUDGET_SOFT_FRACTION
            || month >= params.llm_monthly_budget_usd * BUDGET_SOFT_FRACTION
        {
            warn!(
                day_spent = day,
                month_spent = month,
                "LLM budget approaching ceiling"
            );
        }
        false
    }

    /// Route one task. Missing verdict on any failure; never an error.
    pub async fn route(
        &self,
        task: &str,
        text: &str,
        hint: Complexity,
        prescale: f64,
        params: &ParamSnapshot,
    ) -> Option<LlmVerdict> {
        self.stats.lock().requests += 1;

        if prescale < params.llm_min_prescale {
            return None;
        }
        let tier = pick_tier(text, hint, prescale);
        let hash = prompt_hash(text);

        // Semantic cache first: a hit consumes no budget.
        match self.storage.llm_cache_get(&hash, tier.as_str()) {
            Ok(Some(cached)) => {
                if let Some(verdict) = parse_verdict(&cached.response, true) {
                    self.stats.lock().cache_hits += 1;
                    debug!(task, tier = tier.as_str(), "LLM cache hit");
                    return Some(verdict);
                }
            }
            Ok(None) => {}
            Err(e) => warn!(error = %e, "LLM cache read failed"),
        }

        if self.budget_exhausted(params) {
            self.stats.lock().budget_blocked += 1;
            debug!(task, "LLM budget exhausted; verdict absent");
            return None;
        }

        let client = self.client.as_ref()?;
        self.stats.lock().provider_calls += 1;
        let completion = match client
            .complete(
                self.model_for(tier),
                SYSTEM_PROMPT,
                text,
                CompletionParams::default(),
            )
            .await
        {
            Ok(completion) => completion,
            Err(e) => {
                self.stats.lock().provider_errors += 1;
                warn!(task, error = %e, "LLM provider error; verdict absent");
                return None;
            }
        };

        let tokens = completion.usage.total_tokens.unwrap_or_else(|| {
            // No usage reported: rough 4-chars-per-token estimate.
            ((SYSTEM_PROMPT.len() + text.len() + completion.text.len()) / 4) as u64
        });
        let cost = tokens as f64 / 1000.0 * tier.rate_per_1k();
        self.add_cost(cost);

        let verdict = parse_verdict(&completion.text, false);
        if verdict.is_some() {
            if let Err(e) =
                self.storage
                    .llm_cache_put(&hash, tier.as_str(), &completion.text, cost)
            {
                warn!(error = %e, "LLM cache write failed");
            }
        }
        verdict
    }

    /// Batched fan-out: chunks of `LLM_BATCH_SIZE` flushed concurrently,
    /// `LLM_BATCH_TIMEOUT` bounding each flush and `LLM_BATCH_DELAY`
    /// spacing between flushes. Returns one slot per request index.
    pub async fn enrich_batch(
        self: &Arc<Self>,
        requests: Vec<LlmRequest>,
        params: &ParamSnapshot,
    ) -> Vec<(usize, Option<LlmVerdict>)> {
        let mut results = Vec::with_capacity(requests.len());
        if requests.is_empty() {
            return results;
        }
        let batch_size = params.llm_batch_size.max(1);
        let timeout = Duration::from_millis(params.llm_batch_timeout_ms);
        let delay = Duration::from_millis(params.llm_batch_delay_ms);
        let total_batches = requests.len().div_ceil(batch_size);

        for (batch_no, chunk) in requests.chunks(batch_size).enumerate() {
            let mut set = JoinSet::new();
            for request in chunk {
                let router = Arc::clone(self);
                let params = params.clone();
                let text = request.text.clone();
                let hint = request.hint;
                let prescale = request.prescale;
                let index = request.index;
                set.spawn(async move {
                    let verdict = tokio::time::timeout(
                        timeout,
                        router.route("classify", &text, hint, prescale, &params),
                    )
                    .await
                    .unwrap_or_else(|_| {
                        debug!(index, "LLM batch entry timed out; verdict absent");
                        None
                    });
                    (index, verdict)
                });
            }
            while let Some(joined) = set.join_next().await {
                if let Ok(entry) = joined {
                    results.push(entry);
                }
            }
            if batch_no + 1 < total_batches && !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
        }
        let stats = self.stats();
        info!(
            requests = results.len(),
            cache_hits = stats.cache_hits,
            provider_calls = stats.provider_calls,
            "LLM batch complete"
        );
        results
    }
}
