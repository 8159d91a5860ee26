// =============================================================================
// Trade Bar Aggregator - one-second OHLCV bars built from public trades
// =============================================================================
//
// State machine per trade, bucket = floor(ts / 1000) * 1000:
//   Empty                        -> open a bucket at the trade price
//   Accumulating, same bucket    -> extend high/low, close = price, add size
//   Accumulating, other bucket   -> emit the bucket, open a new one
//
// A bucket is only emitted once a trade from a different second arrives, so a
// silent second yields no bar at all rather than a zero-volume one.
// =============================================================================

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDateTime};
use serde_json::Value;
use tracing::{debug, warn};

use crate::events::{EventSender, PipelineEvent};
use crate::okx::{parse_f64, ws};
use crate::types::{Candle, Channel, Trade};

/// Width of an aggregated bar in milliseconds.
pub const BAR_WIDTH_MS: i64 = 1_000;

/// Start of the one-second bucket containing `ts`.
pub fn bucket_start(ts: i64) -> i64 {
    ts.div_euclid(BAR_WIDTH_MS) * BAR_WIDTH_MS
}

/// Buckets trades into one-second bars. Owned by a single stream task.
#[derive(Debug, Default)]
pub struct TradeBarAggregator {
    bucket: Option<Candle>,
}

impl TradeBarAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold `trade` into the current bucket.
    ///
    /// Returns the previous bucket as a completed bar when `trade` belongs to
    /// a different second.
    pub fn push(&mut self, trade: Trade) -> Option<Candle> {
        let bucket = bucket_start(trade.ts);

        match self.bucket.as_mut() {
            Some(bar) if bar.ts == bucket => {
                bar.high = bar.high.max(trade.price);
                bar.low = bar.low.min(trade.price);
                bar.close = trade.price;
                bar.volume += trade.size;
                bar.volume_ccy += trade.price * trade.size;
                None
            }
            _ => self.bucket.replace(open_bucket(bucket, trade)),
        }
    }

    /// The in-progress bucket, if any trade has been seen.
    pub fn current(&self) -> Option<&Candle> {
        self.bucket.as_ref()
    }
}

fn open_bucket(ts: i64, trade: Trade) -> Candle {
    Candle {
        ts,
        open: trade.price,
        high: trade.price,
        low: trade.price,
        close: trade.price,
        volume: trade.size,
        volume_ccy: trade.price * trade.size,
    }
}

// ---------------------------------------------------------------------------
// Trade WebSocket stream
// ---------------------------------------------------------------------------

/// Subscribe to `trades` for `inst_id` and emit completed one-second bars.
///
/// `aggregator` is owned by the caller so the in-progress bucket survives a
/// reconnect. Returns when the socket ends or fails.
pub async fn run_trade_stream(
    ws_url: &str,
    inst_id: &str,
    aggregator: &mut TradeBarAggregator,
    events: &EventSender,
) -> Result<()> {
    if let Some(open) = aggregator.current() {
        debug!(ts = open.ts, volume = open.volume, "resuming trades with an open bucket");
    }

    ws::run_channel(ws_url, inst_id, Channel::TRADES, |rows| {
        for row in &rows {
            match parse_trade(row) {
                Ok(trade) => {
                    if let Some(bar) = aggregator.push(trade) {
                        debug!(ts = bar.ts, close = bar.close, volume = bar.volume, "second bar");
                        let _ = events.send(PipelineEvent::SecondBar(bar));
                    }
                }
                Err(e) => warn!(error = %e, "skipping malformed trade"),
            }
        }
        Ok(())
    })
    .await
}

/// Parse one `trades` row `{ ts, px, sz, ... }`.
fn parse_trade(row: &Value) -> Result<Trade> {
    let ts = parse_trade_ts(row.get("ts").context("missing field ts")?)?;
    let price = parse_f64(row.get("px").context("missing field px")?, "px")?;
    let size = parse_f64(row.get("sz").context("missing field sz")?, "sz")?;
    Ok(Trade { ts, price, size })
}

/// Trade timestamps arrive as epoch-ms strings or ISO-8601 text.
fn parse_trade_ts(val: &Value) -> Result<i64> {
    if let Some(n) = val.as_i64() {
        return Ok(n);
    }
    let s = val.as_str().context("field ts has unexpected JSON type")?;
    if let Ok(ms) = s.parse::<i64>() {
        return Ok(ms);
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.timestamp_millis());
    }
    // ISO-8601 without an offset is taken as UTC.
    NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f")
        .map(|dt| dt.and_utc().timestamp_millis())
        .with_context(|| format!("unrecognised trade timestamp: {s}"))
}
