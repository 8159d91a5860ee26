// =============================================================================
// Shared types used across the candle pipeline
// =============================================================================

use serde::{Deserialize, Serialize};

/// A single OHLCV candle. `ts` is the bar open time in epoch milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub ts: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    #[serde(rename = "volumeCcy")]
    pub volume_ccy: f64,
}

impl Candle {
    /// A flat candle where every price equals `price`.
    pub fn flat(ts: i64, price: f64, volume: f64) -> Self {
        Self {
            ts,
            open: price,
            high: price,
            low: price,
            close: price,
            volume,
            volume_ccy: 0.0,
        }
    }
}

/// A single public trade from the `trades` channel.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Trade {
    pub ts: i64,
    pub price: f64,
    pub size: f64,
}

/// One price level of the order book.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BookLevel {
    pub price: f64,
    pub size: f64,
}

/// A support/resistance band produced by the level detector.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Level {
    /// Mean of the pivot closes that formed the cluster.
    pub price: f64,
    /// Number of pivots in the cluster.
    pub hits: usize,
}

/// Streaming channels the pipeline subscribes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct Channel(pub &'static str);

impl Channel {
    /// One-minute candles.
    pub const CANDLE_1M: Self = Self("candle1m");

    /// Public trades.
    pub const TRADES: Self = Self("trades");

    /// Top-5 depth snapshots.
    pub const BOOKS5: Self = Self("books5");

    pub fn as_str(&self) -> &'static str {
        self.0
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.0)
    }
}
