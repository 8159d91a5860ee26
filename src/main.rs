// =============================================================================
// Candle Pipeline - Main Entry Point
// =============================================================================
//
// Producers (historical backfill, candle1m / trades / books5 streams) run as
// independent tasks and only send events. The event loop folds them into
// AppState, which the HTTP API reads.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod api;
mod app_state;
mod error;
mod events;
mod fetcher;
mod indicators;
mod market_data;
mod okx;
mod runtime_config;
mod types;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::{Days, Utc};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::app_state::AppState;
use crate::events::{EventSender, PipelineEvent};
use crate::fetcher::{CandleSource, FetchRequest, HistoricalFetcher, SharedFetcher};
use crate::market_data::{OrderBookTracker, TradeBarAggregator};
use crate::okx::OkxClient;
use crate::runtime_config::RuntimeConfig;
use crate::types::Channel;

const CONFIG_PATH: &str = "pipeline_config.json";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Candle pipeline starting up");

    let mut config = if Path::new(CONFIG_PATH).exists() {
        RuntimeConfig::load(CONFIG_PATH).unwrap_or_else(|e| {
            warn!(error = %e, "Failed to load config, using defaults");
            RuntimeConfig::default()
        })
    } else {
        let config = RuntimeConfig::default();
        if let Err(e) = config.save(CONFIG_PATH) {
            warn!(error = %e, "Failed to write default config");
        }
        config
    };
    config.apply_env_overrides();
    config.validate().context("invalid runtime configuration")?;

    info!(
        inst_id = %config.inst_id,
        bar = %config.bar,
        cache_dir = %config.cache_dir.display(),
        "Pipeline configured"
    );

    // ── 2. Fetcher, event channel, shared state ─────────────────────────
    let source: Arc<dyn CandleSource> = Arc::new(OkxClient::new(&config)?);
    let fetcher: SharedFetcher = Arc::new(
        HistoricalFetcher::new(source, config.cache_dir.clone())
            .with_page_limit(config.page_limit)
            .with_retry(config.retry_policy()),
    );

    let (events_tx, events_rx) = events::channel();
    let state = Arc::new(AppState::new(config.clone(), fetcher, events_tx.clone()));

    tokio::spawn(app_state::run_event_loop(state.clone(), events_rx));

    // ── 3. Spawn market data streams ─────────────────────────────────────
    let reconnect = config.reconnect_delay();

    // Candle 1m stream
    {
        let (url, inst, tx) = (config.ws_url.clone(), config.inst_id.clone(), events_tx.clone());
        tokio::spawn(async move {
            loop {
                let result = market_data::live_close::run_candle_stream(&url, &inst, &tx).await;
                report_disconnect(&tx, Channel::CANDLE_1M, result, reconnect);
                tokio::time::sleep(reconnect).await;
            }
        });
    }

    // Trade stream; the aggregator outlives reconnects.
    {
        let (url, inst, tx) = (config.ws_url.clone(), config.inst_id.clone(), events_tx.clone());
        tokio::spawn(async move {
            let mut aggregator = TradeBarAggregator::new();
            loop {
                let result =
                    market_data::trade_bar::run_trade_stream(&url, &inst, &mut aggregator, &tx).await;
                report_disconnect(&tx, Channel::TRADES, result, reconnect);
                tokio::time::sleep(reconnect).await;
            }
        });
    }

    // Orderbook stream
    {
        let (url, inst, tx) = (config.ws_url.clone(), config.inst_id.clone(), events_tx.clone());
        tokio::spawn(async move {
            let mut tracker = OrderBookTracker::new();
            loop {
                let result =
                    market_data::orderbook::run_depth_stream(&url, &inst, &mut tracker, &tx).await;
                report_disconnect(&tx, Channel::BOOKS5, result, reconnect);
                tokio::time::sleep(reconnect).await;
            }
        });
    }

    info!("Market data streams launched");

    // ── 4. Startup backfill ──────────────────────────────────────────────
    if config.backfill_on_start {
        let today = Utc::now().date_naive();
        let start = today
            .checked_sub_days(Days::new(u64::from(config.backfill_days)))
            .unwrap_or(today);
        match FetchRequest::from_dates(config.inst_id.clone(), config.bar.clone(), start, today, today) {
            Ok(request) => match state.start_fetch(request) {
                Ok(job) => info!(%job, %start, %today, "Startup backfill launched"),
                Err(e) => warn!(error = %e, "Startup backfill not started"),
            },
            Err(e) => warn!(error = %e, "Startup backfill range rejected"),
        }
    }

    // ── 5. Start the API server ──────────────────────────────────────────
    let bind_addr = config.socket_addr()?;
    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("Failed to bind API server on {bind_addr}"))?;
    info!(addr = %bind_addr, "API server listening");

    let app = api::rest::router(state.clone());
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!(error = %e, "API server failed");
        }
    });

    info!("All subsystems running. Press Ctrl+C to stop.");

    // ── 6. Shutdown ──────────────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("Shutdown signal received, stopping");
    Ok(())
}

/// Log a dropped stream and tell the consumer it is reconnecting.
fn report_disconnect(events: &EventSender, channel: Channel, result: anyhow::Result<()>, delay: Duration) {
    let message = match result {
        Ok(()) => "stream ended".to_string(),
        Err(e) => format!("{e:#}"),
    };
    error!(channel = %channel, error = %message, delay_secs = delay.as_secs(), "Stream disconnected, reconnecting");
    let _ = events.send(PipelineEvent::StreamError { channel, message });
}
