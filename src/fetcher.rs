// =============================================================================
// Historical Fetcher - paginated backfill of the cache gap
// =============================================================================
//
// Algorithm:
//   1. Load the cache for (instrument, bar). If the requested start precedes
//      the earliest cached candle the cache is discarded.
//   2. fetch_from = max(last_cached_ts + 1, start_ms). Nothing to do when
//      fetch_from > end_ms.
//   3. Page backward from end_ms with a `before` cursor. Each page is put in
//      chronological order; paging stops when a page is short (exhausted) or
//      reaches fetch_from (gap closed). Otherwise before = oldest_ts - 1.
//   4. Each page request gets a bounded number of attempts. Running out of
//      attempts aborts the fetch and nothing is written to the cache.
//   5. Merge (cache rows win on equal ts), save, return.
// =============================================================================

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{NaiveDate, NaiveTime};
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::error::FetchError;
use crate::events::{EventSender, FetchEvent, FetchProgress, PipelineEvent};
use crate::market_data::{CandleCache, CandleSeries};
use crate::types::Candle;

/// Largest page the candles endpoint serves.
pub const MAX_PAGE_LIMIT: usize = 300;

/// Candle intervals a backfill may be requested for.
pub const SUPPORTED_BARS: &[&str] = &["1m", "5m", "15m", "1H", "4H", "1D"];

pub fn is_supported_bar(bar: &str) -> bool {
    SUPPORTED_BARS.contains(&bar)
}

/// A paged source of historical candles.
#[async_trait]
pub trait CandleSource: Send + Sync {
    /// Up to `limit` candles with `ts <= before`, newest first.
    async fn fetch_page(
        &self,
        inst_id: &str,
        bar: &str,
        before: i64,
        limit: usize,
    ) -> Result<Vec<Candle>, FetchError>;
}

#[async_trait]
impl<T: CandleSource + ?Sized> CandleSource for Arc<T> {
    async fn fetch_page(
        &self,
        inst_id: &str,
        bar: &str,
        before: i64,
        limit: usize,
    ) -> Result<Vec<Candle>, FetchError> {
        (**self).fetch_page(inst_id, bar, before, limit).await
    }
}

/// The fetcher as held by the consumer: any source behind a trait object.
pub type SharedFetcher = Arc<HistoricalFetcher<Arc<dyn CandleSource>>>;

/// What to backfill. `start_ms` and `end_ms` are both inclusive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FetchRequest {
    pub inst_id: String,
    pub bar: String,
    pub start_ms: i64,
    pub end_ms: i64,
}

/// A backfill request that cannot be fetched.
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum InvalidRequest {
    #[error("start date {start} is after end date {end}")]
    Range { start: NaiveDate, end: NaiveDate },

    #[error("unsupported bar {0:?}, expected one of 1m, 5m, 15m, 1H, 4H, 1D")]
    Bar(String),
}

impl FetchRequest {
    /// Request covering whole UTC days `start..=end`.
    ///
    /// An `end` after `today` is clamped to `today`. `bar` must be one of
    /// [`SUPPORTED_BARS`].
    pub fn from_dates(
        inst_id: impl Into<String>,
        bar: impl Into<String>,
        start: NaiveDate,
        end: NaiveDate,
        today: NaiveDate,
    ) -> Result<Self, InvalidRequest> {
        let bar = bar.into();
        if !is_supported_bar(&bar) {
            return Err(InvalidRequest::Bar(bar));
        }

        let end = if end > today {
            warn!(%end, %today, "end date is in the future, clamping to today");
            today
        } else {
            end
        };
        if start > end {
            return Err(InvalidRequest::Range { start, end });
        }

        let start_ms = start.and_time(NaiveTime::MIN).and_utc().timestamp_millis();
        // Last millisecond of the end day.
        let end_ms = end
            .succ_opt()
            .map(|next| next.and_time(NaiveTime::MIN).and_utc().timestamp_millis() - 1)
            .unwrap_or(i64::MAX);

        Ok(Self {
            inst_id: inst_id.into(),
            bar,
            start_ms,
            end_ms,
        })
    }
}

/// Attempts per page and the base wait between them.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay: Duration::from_secs(1),
        }
    }
}

pub struct HistoricalFetcher<S> {
    source: S,
    cache_dir: PathBuf,
    page_limit: usize,
    retry: RetryPolicy,
}

impl<S: CandleSource> HistoricalFetcher<S> {
    pub fn new(source: S, cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            source,
            cache_dir: cache_dir.into(),
            page_limit: MAX_PAGE_LIMIT,
            retry: RetryPolicy::default(),
        }
    }

    /// Page size, clamped to `1..=MAX_PAGE_LIMIT`.
    pub fn with_page_limit(mut self, limit: usize) -> Self {
        self.page_limit = limit.clamp(1, MAX_PAGE_LIMIT);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Backfill `req` into the cache and return the merged series.
    ///
    /// `on_progress` is called once per page and once more when paging ends.
    #[instrument(skip(self, req, on_progress), fields(inst_id = %req.inst_id, bar = %req.bar))]
    pub async fn run<P>(&self, req: &FetchRequest, mut on_progress: P) -> Result<CandleSeries, FetchError>
    where
        P: FnMut(FetchProgress) + Send,
    {
        let cache = CandleCache::new(&self.cache_dir, &req.inst_id, &req.bar)?;
        let cached = cache.load_for(req.start_ms)?;

        let fetch_from = match cached.last_ts() {
            Some(last) => last.saturating_add(1).max(req.start_ms),
            None => req.start_ms,
        };
        if fetch_from > req.end_ms {
            info!(rows = cached.len(), "cache already covers the requested range");
            return Ok(cached);
        }

        info!(fetch_from, end_ms = req.end_ms, cached = cached.len(), "backfilling candle gap");
        let rows = self.fetch_gap(req, fetch_from, &mut on_progress).await?;
        let fetched = rows.len();

        let merged = cached.merge(rows);
        cache.save(&merged)?;
        info!(fetched, total = merged.len(), path = %cache.path().display(), "backfill complete");
        Ok(merged)
    }

    async fn fetch_gap<P>(
        &self,
        req: &FetchRequest,
        fetch_from: i64,
        on_progress: &mut P,
    ) -> Result<Vec<Candle>, FetchError>
    where
        P: FnMut(FetchProgress) + Send,
    {
        let mut pages: Vec<Vec<Candle>> = Vec::new();
        let mut before = req.end_ms;
        let mut pages_done: u32 = 0;

        loop {
            let mut page = self.fetch_page_with_retry(req, before).await?;
            if page.is_empty() {
                debug!(before, "empty page, history exhausted");
                break;
            }
            page.sort_by_key(|c| c.ts);

            let oldest = page[0].ts;
            let exhausted = page.len() < self.page_limit;
            pages_done += 1;
            debug!(page = pages_done, rows = page.len(), oldest, "page fetched");
            on_progress(FetchProgress {
                pages_done,
                total: None,
            });
            pages.push(page);

            if exhausted || oldest <= fetch_from {
                break;
            }
            if oldest > before {
                warn!(oldest, before, "page did not move past the cursor, stopping");
                break;
            }
            before = oldest - 1;
        }

        on_progress(FetchProgress {
            pages_done,
            total: Some(pages_done),
        });

        // Pages arrived newest-first; oldest page goes first.
        Ok(pages.into_iter().rev().flatten().collect())
    }

    async fn fetch_page_with_retry(&self, req: &FetchRequest, before: i64) -> Result<Vec<Candle>, FetchError> {
        let max_attempts = self.retry.max_attempts.max(1);
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            match self
                .source
                .fetch_page(&req.inst_id, &req.bar, before, self.page_limit)
                .await
            {
                Ok(rows) => return Ok(rows),
                Err(e) if e.is_retryable() && attempt < max_attempts => {
                    warn!(attempt, max_attempts, before, error = %e, "page request failed, retrying");
                    tokio::time::sleep(self.retry.delay * attempt).await;
                }
                Err(e) if e.is_retryable() => {
                    error!(attempt, before, error = %e, "page request failed, giving up");
                    return Err(FetchError::Exhausted {
                        attempts: attempt,
                        last: Box::new(e),
                    });
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Run `req` on a worker task, reporting progress and the outcome on `events`.
pub fn spawn_fetch<S>(
    fetcher: Arc<HistoricalFetcher<S>>,
    req: FetchRequest,
    job: Uuid,
    events: EventSender,
) -> JoinHandle<()>
where
    S: CandleSource + 'static,
{
    tokio::spawn(async move {
        let progress_tx = events.clone();
        let result = fetcher
            .run(&req, |progress| {
                let _ = progress_tx.send(PipelineEvent::Fetch(FetchEvent::Progress { job, progress }));
            })
            .await;

        let event = match result {
            Ok(series) => FetchEvent::Finished {
                job,
                request: req,
                series,
            },
            Err(e) => {
                error!(%job, error = %e, "backfill failed");
                FetchEvent::Failed {
                    job,
                    message: e.to_string(),
                }
            }
        };
        // The consumer may already be gone during shutdown.
        let _ = events.send(PipelineEvent::Fetch(event));
    })
}
