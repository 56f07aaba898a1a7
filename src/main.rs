//! Catalyst-Bot runner: wiring, startup validation, shutdown drain.
//!
//! Exit codes: 0 normal termination; 1 invalid configuration at startup;
//! 2 mandatory external dependency unavailable at startup.

use anyhow::Result;
use clap::Parser;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use catalyst_bot::{
    alerts::{Dispatcher, LoggingTransport, WebhookTransport},
    charts::FileChartRenderer,
    classify::Classifier,
    config::{Config, ParamStore},
    control::{self, ControlState},
    dedup::DedupStore,
    feeds::{
        filings::FilingsFeed, newsapi::NewsApiFeed, screener::ScreenerFeed, wire::WireFeed,
        FeedAdapter, FeedSet,
    },
    llm::{client::OpenRouterClient, LlmRouter},
    phase,
    pipeline::{CycleOrchestrator, OrchestratorDeps},
    price::{HttpQuoteProvider, PriceService, QuoteProvider},
    report,
    storage::{OutcomeLog, Storage},
    ticker::TickerResolver,
};

#[derive(Debug, Parser)]
#[command(name = "catalyst-bot", about = "Market catalyst surveillance bot")]
struct Args {
    /// Run exactly one pipeline cycle, then exit (smoke testing).
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();
    std::process::exit(run(args).await);
}

async fn run(args: Args) -> i32 {
    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "Configuration invalid at startup");
            return 1;
        }
    };
    if config.control_enabled && config.interaction_signing_key.is_none() {
        error!("Control surface enabled but INTERACTION_SIGNING_KEY is unset; \
                the interactions endpoint cannot verify signatures");
        return 2;
    }

    match boot(config, args).await {
        Ok(()) => 0,
        Err(BootError::Dependency(e)) => {
            error!(error = %e, "Mandatory dependency unavailable at startup");
            2
        }
        Err(BootError::Config(e)) => {
            error!(error = %e, "Configuration invalid at startup");
            1
        }
    }
}

enum BootError {
    Config(anyhow::Error),
    Dependency(anyhow::Error),
}

async fn boot(config: Config, args: Args) -> Result<(), BootError> {
    let storage =
        Storage::open(Path::new(&config.database_path)).map_err(BootError::Dependency)?;
    let outcomes =
        OutcomeLog::open(Path::new(&config.outcomes_path)).map_err(BootError::Dependency)?;
    let params = Arc::new(ParamStore::load(storage.clone()).map_err(BootError::Dependency)?);

    let dedup = DedupStore::new(storage.clone());
    match dedup.purge_expired(params.params().seen_ttl_days) {
        Ok(purged) if purged > 0 => info!(purged, "Dedup TTL purge complete"),
        Ok(_) => {}
        Err(e) => warn!(error = %e, "Dedup purge failed"),
    }

    // Feed adapters from configuration.
    let mut adapters: Vec<Arc<dyn FeedAdapter>> = Vec::new();
    for (idx, url) in config.wire_feed_urls.iter().enumerate() {
        let name = format!("wire-{}", idx + 1);
        adapters.push(Arc::new(WireFeed::new(name, url.clone())));
    }
    if let Some(url) = &config.filings_index_url {
        adapters.push(Arc::new(FilingsFeed::new(url.clone())));
    }
    if let Some(url) = &config.news_api_url {
        adapters.push(Arc::new(NewsApiFeed::new(
            url.clone(),
            config.news_api_key.clone(),
        )));
    }
    if let Some(url) = &config.screener_url {
        adapters.push(Arc::new(ScreenerFeed::new(url.clone())));
    }
    if adapters.is_empty() {
        return Err(BootError::Config(anyhow::anyhow!(
            "no feed sources configured (set WIRE_FEED_URLS or FILINGS_INDEX_URL)"
        )));
    }
    let feeds = Arc::new(FeedSet::new(adapters));

    let resolver = Arc::new(
        TickerResolver::from_files(
            config.listings_path.as_deref().map(Path::new),
            config.filer_map_path.as_deref().map(Path::new),
        )
        .map_err(BootError::Config)?,
    );

    let mut providers: Vec<Arc<dyn QuoteProvider>> = Vec::new();
    if let Some(url) = &config.quote_api_url {
        providers.push(Arc::new(HttpQuoteProvider::new("primary", url.clone())));
    }
    if let Some(url) = &config.quote_fallback_url {
        providers.push(Arc::new(HttpQuoteProvider::new("fallback", url.clone())));
    }
    if providers.is_empty() {
        warn!("No quote providers configured; price gates will reject candidates");
    }
    let prices = Arc::new(PriceService::new(providers, Some(storage.clone())));

    let classifier = Arc::new(Classifier::new(
        None,
        config.keyword_weights_path.clone().map(PathBuf::from),
    ));

    let llm_client = match &config.llm_api_key {
        Some(key) => {
            let http = reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .map_err(|e| BootError::Dependency(e.into()))?;
            Some(Arc::new(OpenRouterClient::new(http, key.clone()).map_err(BootError::Config)?)
                as Arc<dyn catalyst_bot::llm::client::CompletionClient>)
        }
        None => {
            info!("No LLM key configured; running without LLM enrichment");
            None
        }
    };
    let llm = Arc::new(LlmRouter::new(
        llm_client,
        config.llm_models.clone(),
        storage.clone(),
    ));

    let transport: Arc<dyn catalyst_bot::alerts::AlertTransport> = match &config.alert_webhook_url
    {
        Some(url) => Arc::new(WebhookTransport::new(url.clone())),
        None => {
            warn!("No alert webhook configured; alerts will be logged only");
            Arc::new(LoggingTransport)
        }
    };
    let dispatcher = Arc::new(Dispatcher::new(transport.clone()));
    let charts =
        Arc::new(FileChartRenderer::new(config.chart_dir.clone()).map_err(BootError::Dependency)?);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Control surface.
    if config.control_enabled {
        let signing_key = config
            .interaction_signing_key
            .clone()
            .expect("checked at startup");
        let state = ControlState {
            params: params.clone(),
            signing_key: Arc::new(signing_key),
        };
        let app = control::router(state);
        let addr = std::net::SocketAddr::from(([0, 0, 0, 0], config.port));
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|e| BootError::Dependency(e.into()))?;
        info!(%addr, "Control surface listening");
        let mut control_shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            let serve = axum::serve(listener, app).with_graceful_shutdown(async move {
                let _ = control_shutdown.changed().await;
            });
            if let Err(e) = serve.await {
                error!(error = %e, "Control surface server error");
            }
        });
    }

    // Nightly report.
    tokio::spawn(report::run_nightly_loop(
        outcomes.clone(),
        prices.clone(),
        params.clone(),
        Some(transport.clone()),
        config.nightly_report_hour_utc,
        shutdown_rx.clone(),
    ));

    let deps = OrchestratorDeps {
        feeds,
        dedup,
        resolver,
        prices,
        classifier,
        llm,
        dispatcher,
        charts: Some(charts),
        outcomes,
        params: params.clone(),
        status_transport: Some(transport),
    };
    let mut orchestrator = CycleOrchestrator::new(deps, shutdown_rx);

    if args.once {
        let snapshot = params.params();
        let now = chrono::Utc::now();
        let current_phase = phase::phase_at(now, &phase::HolidayCalendar::us_equities());
        let cadence = phase::cadence(&snapshot, current_phase);
        let stats = orchestrator.run_cycle(&snapshot, cadence).await;
        info!(
            scanned = stats.scanned,
            alerted = stats.alerted,
            "Single cycle complete"
        );
        let _ = shutdown_tx.send(true);
        return Ok(());
    }

    // Run until a shutdown signal, then drain within the grace period.
    let grace = Duration::from_secs(config.shutdown_grace_secs);
    let driver = tokio::spawn(async move { orchestrator.run().await });
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Shutdown signal received"),
        Err(e) => warn!(error = %e, "Signal handler failed; shutting down"),
    }
    let _ = shutdown_tx.send(true);
    if tokio::time::timeout(grace, driver).await.is_err() {
        warn!(
            grace_secs = grace.as_secs(),
            "Drain grace period elapsed; aborting in-flight work"
        );
    }
    Ok(())
}
