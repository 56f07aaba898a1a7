//! Runtime configuration: static boot config from the environment plus
//! the live parameter store mutated through the control surface.

pub mod schema;
pub mod store;

pub use self::schema::ParamSnapshot;
pub use self::store::{ApplyError, ParamStore};

use anyhow::{Context, Result};

/// Static boot configuration. Anything an operator tunes at runtime lives
/// in the parameter store instead.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_path: String,
    pub outcomes_path: String,
    pub chart_dir: String,
    pub port: u16,
    /// Webhook for plain alert posts.
    pub alert_webhook_url: Option<String>,
    /// Hex-encoded shared secret for inbound interaction signatures.
    pub interaction_signing_key: Option<String>,
    /// Enables the control surface listener.
    pub control_enabled: bool,
    pub llm_api_key: Option<String>,
    pub llm_models: LlmModels,
    /// RSS press-release wire endpoints.
    pub wire_feed_urls: Vec<String>,
    pub filings_index_url: Option<String>,
    pub news_api_url: Option<String>,
    pub news_api_key: Option<String>,
    pub screener_url: Option<String>,
    pub quote_api_url: Option<String>,
    pub quote_fallback_url: Option<String>,
    /// Path to the dynamic keyword-weight overlay (JSON map).
    pub keyword_weights_path: Option<String>,
    /// Path to the exchange listings file (one ticker per line).
    pub listings_path: Option<String>,
    /// Path to the filer-id to ticker map (JSON).
    pub filer_map_path: Option<String>,
    /// Seconds allowed for in-flight dispatches on shutdown.
    pub shutdown_grace_secs: u64,
    pub nightly_report_hour_utc: u32,
}

/// Model names per complexity tier.
#[derive(Debug, Clone)]
pub struct LlmModels {
    pub cheap: String,
    pub medium: String,
    pub expensive: String,
    pub premium: String,
}

fn env_or(key: &str, fallback: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| fallback.to_string())
}

fn env_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();

        let port = env_or("PORT", "8080")
            .parse()
            .context("PORT must be a number")?;

        let wire_feed_urls = env_or("WIRE_FEED_URLS", "")
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();

        let shutdown_grace_secs = env_or("SHUTDOWN_GRACE_SECS", "30")
            .parse()
            .context("SHUTDOWN_GRACE_SECS must be a number")?;

        let nightly_report_hour_utc: u32 = env_or("NIGHTLY_REPORT_HOUR_UTC", "6")
            .parse()
            .context("NIGHTLY_REPORT_HOUR_UTC must be a number")?;
        if nightly_report_hour_utc > 23 {
            anyhow::bail!("NIGHTLY_REPORT_HOUR_UTC must be 0..=23");
        }

        let control_enabled = matches!(
            env_or("CONTROL_ENABLED", "true").as_str(),
            "1" | "true" | "TRUE" | "on" | "ON"
        );

        Ok(Self {
            database_path: env_or("DATABASE_PATH", "./catalyst.db"),
            outcomes_path: env_or("OUTCOMES_PATH", "./outcomes.jsonl"),
            chart_dir: env_or("CHART_DIR", "./charts"),
            port,
            alert_webhook_url: env_opt("ALERT_WEBHOOK_URL"),
            interaction_signing_key: env_opt("INTERACTION_SIGNING_KEY"),
            control_enabled,
            llm_api_key: env_opt("LLM_API_KEY"),
            llm_models: LlmModels {
                cheap: env_or("LLM_MODEL_CHEAP", "meta-llama/llama-3.1-8b-instruct"),
                medium: env_or("LLM_MODEL_MEDIUM", "anthropic/claude-3-haiku"),
                expensive: env_or("LLM_MODEL_EXPENSIVE", "anthropic/claude-3.5-sonnet"),
                premium: env_or("LLM_MODEL_PREMIUM", "openai/gpt-4o"),
            },
            wire_feed_urls,
            filings_index_url: env_opt("FILINGS_INDEX_URL"),
            news_api_url: env_opt("NEWS_API_URL"),
            news_api_key: env_opt("NEWS_API_KEY"),
            screener_url: env_opt("SCREENER_URL"),
            quote_api_url: env_opt("QUOTE_API_URL"),
            quote_fallback_url: env_opt("QUOTE_FALLBACK_URL"),
            keyword_weights_path: env_opt("KEYWORD_WEIGHTS_PATH"),
            listings_path: env_opt("LISTINGS_PATH"),
            filer_map_path: env_opt("FILER_MAP_PATH"),
            shutdown_grace_secs,
            nightly_report_hour_utc,
        })
    }
}
