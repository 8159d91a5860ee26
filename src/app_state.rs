// =============================================================================
// Central Application State - published view of the pipeline
// =============================================================================
//
// Producer tasks never touch this struct. They send `PipelineEvent`s and the
// event loop below is the only writer; the HTTP API only reads.
//
// Thread safety:
//   - Atomic counter for lock-free version tracking.
//   - parking_lot::RwLock for every published collection.
// =============================================================================

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::AnalysisError;
use crate::events::{EventReceiver, EventSender, FetchEvent, FetchProgress, PipelineEvent};
use crate::fetcher::{spawn_fetch, FetchRequest, SharedFetcher};
use crate::indicators::{detect_levels, LevelParams};
use crate::market_data::{apply_minute_close, CandleSeries, LiveCloseOutcome, OrderBookSnapshot};
use crate::runtime_config::RuntimeConfig;
use crate::types::{Candle, Level};

// =============================================================================
// Error Record
// =============================================================================

/// A recorded stream or fetch failure for the status endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorRecord {
    /// Where it happened: a stream channel name or `fetch`.
    pub source: String,
    pub message: String,
    /// ISO 8601 timestamp.
    pub at: String,
}

/// Maximum number of recent errors to retain.
const MAX_RECENT_ERRORS: usize = 50;

// =============================================================================
// Fetch status
// =============================================================================

#[derive(Debug, Clone, Default, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum FetchStatus {
    #[default]
    Idle,
    Running {
        job: Uuid,
        request: FetchRequest,
        progress: Option<FetchProgress>,
    },
    Finished {
        job: Uuid,
        request: FetchRequest,
        rows: usize,
    },
    Failed {
        job: Uuid,
        message: String,
    },
}

impl FetchStatus {
    pub fn is_running(&self) -> bool {
        matches!(self, Self::Running { .. })
    }
}

/// The minute series readers see, with the request it was backfilled for.
#[derive(Debug, Clone, Default)]
pub struct PublishedSeries {
    /// `None` until the first backfill finishes.
    pub request: Option<FetchRequest>,
    pub series: CandleSeries,
}

/// A fetch was requested while another one is still running.
#[derive(Debug, thiserror::Error)]
#[error("fetch {0} is still running")]
pub struct FetchInFlight(pub Uuid);

// =============================================================================
// AppState
// =============================================================================

/// Shared across the event loop and HTTP handlers via `Arc<AppState>`.
pub struct AppState {
    /// Incremented on every applied event.
    pub state_version: AtomicU64,

    pub runtime_config: Arc<RwLock<RuntimeConfig>>,

    // ── Fetch launching ─────────────────────────────────────────────────
    fetcher: SharedFetcher,
    events: EventSender,
    fetch_status: RwLock<FetchStatus>,

    // ── Published market data ───────────────────────────────────────────
    /// Series windowed to the last finished fetch request.
    published: RwLock<PublishedSeries>,
    second_bars: RwLock<VecDeque<Candle>>,
    second_bar_capacity: usize,
    orderbook: RwLock<OrderBookSnapshot>,

    pub recent_errors: RwLock<VecDeque<ErrorRecord>>,

    /// Instant when the pipeline was started. Used for uptime calculations.
    pub start_time: std::time::Instant,
}

impl AppState {
    /// Construct the state. `events` is the sending half of the channel the
    /// event loop drains; fetches started through this state report on it.
    pub fn new(config: RuntimeConfig, fetcher: SharedFetcher, events: EventSender) -> Self {
        let second_bar_capacity = config.second_bar_capacity.max(1);

        Self {
            state_version: AtomicU64::new(1),
            runtime_config: Arc::new(RwLock::new(config)),
            fetcher,
            events,
            fetch_status: RwLock::new(FetchStatus::Idle),
            published: RwLock::new(PublishedSeries::default()),
            second_bars: RwLock::new(VecDeque::with_capacity(second_bar_capacity)),
            second_bar_capacity,
            orderbook: RwLock::new(OrderBookSnapshot::default()),
            recent_errors: RwLock::new(VecDeque::new()),
            start_time: std::time::Instant::now(),
        }
    }

    // ── Version Management ──────────────────────────────────────────────

    pub fn increment_version(&self) -> u64 {
        self.state_version.fetch_add(1, Ordering::SeqCst)
    }

    pub fn current_state_version(&self) -> u64 {
        self.state_version.load(Ordering::SeqCst)
    }

    // ── Fetch control ───────────────────────────────────────────────────

    /// Start a backfill on a worker task and return its job id.
    ///
    /// Rejected while another fetch is running.
    pub fn start_fetch(&self, request: FetchRequest) -> Result<Uuid, FetchInFlight> {
        let mut status = self.fetch_status.write();
        if let FetchStatus::Running { job, .. } = &*status {
            return Err(FetchInFlight(*job));
        }

        let job = Uuid::new_v4();
        info!(%job, inst_id = %request.inst_id, bar = %request.bar, start_ms = request.start_ms, end_ms = request.end_ms, "starting backfill");
        *status = FetchStatus::Running {
            job,
            request: request.clone(),
            progress: None,
        };
        drop(status);

        spawn_fetch(Arc::clone(&self.fetcher), request, job, self.events.clone());
        self.increment_version();
        Ok(job)
    }

    pub fn fetch_status(&self) -> FetchStatus {
        self.fetch_status.read().clone()
    }

    // ── Event application ───────────────────────────────────────────────

    /// Fold one producer event into the published view.
    pub fn apply_event(&self, event: PipelineEvent) {
        match event {
            PipelineEvent::Fetch(fetch) => self.apply_fetch_event(fetch),
            PipelineEvent::MinuteClose { ts, close } => {
                let outcome = apply_minute_close(&mut self.published.write().series, ts, close);
                if outcome == LiveCloseOutcome::Appended {
                    debug!(ts, close, "live minute appended");
                }
            }
            PipelineEvent::SecondBar(bar) => self.push_second_bar(bar),
            PipelineEvent::OrderBook(snapshot) => *self.orderbook.write() = snapshot,
            PipelineEvent::StreamError { channel, message } => {
                self.push_error(channel.to_string(), message);
            }
        }
        self.increment_version();
    }

    fn apply_fetch_event(&self, event: FetchEvent) {
        match event {
            FetchEvent::Progress { job, progress } => {
                let mut status = self.fetch_status.write();
                if let FetchStatus::Running {
                    job: running,
                    progress: slot,
                    ..
                } = &mut *status
                {
                    if *running == job {
                        *slot = Some(progress);
                    }
                }
            }
            FetchEvent::Finished {
                job,
                request,
                series,
            } => {
                let windowed = series.window(request.start_ms, request.end_ms);
                let rows = windowed.len();
                if windowed.is_empty() {
                    warn!(%job, cached = series.len(), "backfill has no rows inside the requested range");
                } else {
                    info!(%job, rows, cached = series.len(), bar = %request.bar, "backfill published");
                }
                *self.published.write() = PublishedSeries {
                    request: Some(request.clone()),
                    series: windowed,
                };
                *self.fetch_status.write() = FetchStatus::Finished { job, request, rows };
            }
            FetchEvent::Failed { job, message } => {
                warn!(%job, error = %message, "backfill failed");
                *self.fetch_status.write() = FetchStatus::Failed {
                    job,
                    message: message.clone(),
                };
                self.push_error("fetch".to_string(), message);
            }
        }
    }

    /// Append a completed second bar. A bar whose `ts` is not newer than the
    /// last one replaces it. The ring keeps the newest `second_bar_capacity`.
    fn push_second_bar(&self, bar: Candle) {
        let mut bars = self.second_bars.write();
        match bars.back_mut() {
            Some(last) if bar.ts <= last.ts => *last = bar,
            _ => bars.push_back(bar),
        }
        while bars.len() > self.second_bar_capacity {
            bars.pop_front();
        }
    }

    // ── Error Logging ───────────────────────────────────────────────────

    /// Record an error; the oldest entries are evicted past
    /// [`MAX_RECENT_ERRORS`].
    pub fn push_error(&self, source: String, message: String) {
        let mut errors = self.recent_errors.write();
        errors.push_back(ErrorRecord {
            source,
            message,
            at: Utc::now().to_rfc3339(),
        });
        while errors.len() > MAX_RECENT_ERRORS {
            errors.pop_front();
        }
    }

    // ── Readers ─────────────────────────────────────────────────────────

    pub fn candles(&self) -> PublishedSeries {
        self.published.read().clone()
    }

    pub fn second_bars(&self) -> Vec<Candle> {
        self.second_bars.read().iter().copied().collect()
    }

    pub fn orderbook(&self) -> OrderBookSnapshot {
        self.orderbook.read().clone()
    }

    pub fn recent_errors(&self) -> Vec<ErrorRecord> {
        self.recent_errors.read().iter().cloned().collect()
    }

    /// Run level detection over the published minute series.
    pub fn levels(&self, params: LevelParams) -> Result<Vec<Level>, AnalysisError> {
        detect_levels(self.published.read().series.as_slice(), params)
    }
}

/// Drain `rx` into `state` until every sender is gone.
pub async fn run_event_loop(state: Arc<AppState>, mut rx: EventReceiver) {
    info!("event loop started");
    while let Some(event) = rx.recv().await {
        state.apply_event(event);
    }
    info!("event loop stopped, all producers gone");
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    use crate::error::FetchError;
    use crate::events;
    use crate::fetcher::{CandleSource, HistoricalFetcher};
    use crate::types::{BookLevel, Channel};

    const MINUTE: i64 = 60_000;

    struct FixedSource(Vec<Candle>);

    #[async_trait]
    impl CandleSource for FixedSource {
        async fn fetch_page(
            &self,
            _inst_id: &str,
            _bar: &str,
            before: i64,
            limit: usize,
        ) -> Result<Vec<Candle>, FetchError> {
            Ok(self.0.iter().rev().filter(|c| c.ts <= before).take(limit).copied().collect())
        }
    }

    fn state_with(candles: Vec<Candle>, cache_dir: &std::path::Path) -> (Arc<AppState>, EventReceiver) {
        let source: Arc<dyn CandleSource> = Arc::new(FixedSource(candles));
        let fetcher: SharedFetcher = Arc::new(HistoricalFetcher::new(source, cache_dir));
        let (tx, rx) = events::channel();
        let config = RuntimeConfig {
            second_bar_capacity: 3,
            ..RuntimeConfig::default()
        };
        (Arc::new(AppState::new(config, fetcher, tx)), rx)
    }

    fn request(start_ms: i64, end_ms: i64) -> FetchRequest {
        FetchRequest {
            inst_id: "ETH-USDT".into(),
            bar: "1m".into(),
            start_ms,
            end_ms,
        }
    }

    fn bar(ts: i64, close: f64) -> Candle {
        Candle::flat(ts, close, 1.0)
    }

    #[test]
    fn second_bar_ring_replaces_and_caps() {
        let dir = tempfile::tempdir().unwrap();
        let (state, _rx) = state_with(Vec::new(), dir.path());

        state.apply_event(PipelineEvent::SecondBar(bar(1_000, 1.0)));
        state.apply_event(PipelineEvent::SecondBar(bar(1_000, 2.0)));
        assert_eq!(state.second_bars(), vec![bar(1_000, 2.0)]);

        for ts in [2_000, 3_000, 4_000] {
            state.apply_event(PipelineEvent::SecondBar(bar(ts, 3.0)));
        }
        let ts: Vec<i64> = state.second_bars().iter().map(|c| c.ts).collect();
        assert_eq!(ts, vec![2_000, 3_000, 4_000]);

        // Out-of-order bar overwrites the newest slot.
        state.apply_event(PipelineEvent::SecondBar(bar(500, 9.0)));
        assert_eq!(state.second_bars().last().unwrap().close, 9.0);
        assert_eq!(state.second_bars().len(), 3);
    }

    #[test]
    fn orderbook_and_stream_errors_are_published() {
        let dir = tempfile::tempdir().unwrap();
        let (state, _rx) = state_with(Vec::new(), dir.path());
        let v0 = state.current_state_version();

        let snapshot = OrderBookSnapshot::from_levels(
            vec![BookLevel { price: 99.0, size: 1.0 }],
            vec![BookLevel { price: 101.0, size: 1.0 }],
        );
        state.apply_event(PipelineEvent::OrderBook(snapshot.clone()));
        state.apply_event(PipelineEvent::StreamError {
            channel: Channel::TRADES,
            message: "connection reset".into(),
        });

        assert_eq!(state.orderbook(), snapshot);
        let errors = state.recent_errors();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].source, "trades");
        assert_eq!(state.current_state_version(), v0 + 2);
    }

    #[test]
    fn minute_close_before_backfill_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let (state, _rx) = state_with(Vec::new(), dir.path());
        state.apply_event(PipelineEvent::MinuteClose { ts: MINUTE, close: 1.0 });
        let published = state.candles();
        assert!(published.series.is_empty());
        assert!(published.request.is_none());
    }

    #[tokio::test]
    async fn fetch_publishes_windowed_series() {
        let dir = tempfile::tempdir().unwrap();
        let candles: Vec<Candle> = (0..50).map(|i| bar(i * MINUTE, 10.0 + i as f64)).collect();
        let (state, mut rx) = state_with(candles, dir.path());

        let job = state.start_fetch(request(10 * MINUTE, 19 * MINUTE)).unwrap();
        assert!(state.fetch_status().is_running());
        assert!(matches!(
            state.start_fetch(request(0, MINUTE)),
            Err(FetchInFlight(running)) if running == job
        ));

        while let Some(event) = rx.recv().await {
            let done = matches!(event, PipelineEvent::Fetch(FetchEvent::Finished { .. } | FetchEvent::Failed { .. }));
            state.apply_event(event);
            if done {
                break;
            }
        }

        match state.fetch_status() {
            FetchStatus::Finished { job: finished, rows, .. } => {
                assert_eq!(finished, job);
                assert_eq!(rows, 10);
            }
            other => panic!("expected finished, got {other:?}"),
        }
        let published = state.candles();
        assert_eq!(published.request, Some(request(10 * MINUTE, 19 * MINUTE)));
        assert_eq!(published.series.first_ts(), Some(10 * MINUTE));
        assert_eq!(published.series.last_ts(), Some(19 * MINUTE));

        // Live closes now land on the published series.
        state.apply_event(PipelineEvent::MinuteClose { ts: 19 * MINUTE, close: 99.0 });
        assert_eq!(state.candles().series.last().unwrap().close, 99.0);
        state.apply_event(PipelineEvent::MinuteClose { ts: 20 * MINUTE, close: 100.0 });
        assert_eq!(state.candles().series.len(), 11);

        // A new fetch is accepted once the previous one finished.
        assert!(state.start_fetch(request(10 * MINUTE, 19 * MINUTE)).is_ok());
    }

    #[test]
    fn failed_fetch_is_recorded() {
        let dir = tempfile::tempdir().unwrap();
        let (state, _rx) = state_with(Vec::new(), dir.path());
        let job = Uuid::new_v4();

        state.apply_event(PipelineEvent::Fetch(FetchEvent::Failed {
            job,
            message: "page request failed after 3 attempts".into(),
        }));

        assert!(matches!(state.fetch_status(), FetchStatus::Failed { job: failed, .. } if failed == job));
        assert_eq!(state.recent_errors()[0].source, "fetch");
    }

    #[test]
    fn levels_over_published_series() {
        let dir = tempfile::tempdir().unwrap();
        let (state, _rx) = state_with(Vec::new(), dir.path());
        assert!(state.levels(LevelParams::default()).unwrap().is_empty());
        assert!(state
            .levels(LevelParams { eps_multiplier: -1.0, min_hits: 2 })
            .is_err());
    }
}
