// =============================================================================
// Order Book Tracker - best-5 bid/ask snapshot from the books5 channel
// =============================================================================

use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::events::{EventSender, PipelineEvent};
use crate::okx::{parse_f64, ws};
use crate::types::{BookLevel, Channel};

/// Levels kept per side.
pub const BOOK_DEPTH: usize = 5;

/// Top of book: bids descending, asks ascending, at most `BOOK_DEPTH` each.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct OrderBookSnapshot {
    pub bids: Vec<BookLevel>,
    pub asks: Vec<BookLevel>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Ask,
    Bid,
}

/// One positional row of the 10-row ladder.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LadderRow {
    pub side: Side,
    pub level: Option<BookLevel>,
}

impl OrderBookSnapshot {
    /// Normalise raw levels: order each side and keep the best `BOOK_DEPTH`.
    pub fn from_levels(mut bids: Vec<BookLevel>, mut asks: Vec<BookLevel>) -> Self {
        bids.sort_by(|a, b| b.price.total_cmp(&a.price));
        asks.sort_by(|a, b| a.price.total_cmp(&b.price));
        bids.truncate(BOOK_DEPTH);
        asks.truncate(BOOK_DEPTH);
        Self { bids, asks }
    }

    pub fn best_bid(&self) -> Option<f64> {
        self.bids.first().map(|l| l.price)
    }

    pub fn best_ask(&self) -> Option<f64> {
        self.asks.first().map(|l| l.price)
    }

    /// Spread in basis points of the mid price. `None` when a side is empty.
    pub fn spread_bps(&self) -> Option<f64> {
        let (bid, ask) = (self.best_bid()?, self.best_ask()?);
        let mid = (bid + ask) / 2.0;
        (mid > 0.0).then(|| (ask - bid) / mid * 10_000.0)
    }

    /// Size imbalance across the visible levels, in [-1, +1].
    pub fn imbalance(&self) -> f64 {
        let bid_depth: f64 = self.bids.iter().map(|l| l.size).sum();
        let ask_depth: f64 = self.asks.iter().map(|l| l.size).sum();
        let total = bid_depth + ask_depth;
        if total > 0.0 {
            (bid_depth - ask_depth) / total
        } else {
            0.0
        }
    }

    /// Fixed 10-row presentation: rows 0..5 hold asks in ascending price
    /// order, rows 5..10 hold bids in descending price order. A side with
    /// fewer than `BOOK_DEPTH` levels leaves its trailing rows empty.
    pub fn ladder(&self) -> Vec<LadderRow> {
        let side_rows = |side: Side, levels: &[BookLevel]| {
            (0..BOOK_DEPTH)
                .map(|i| LadderRow {
                    side,
                    level: levels.get(i).copied(),
                })
                .collect::<Vec<_>>()
        };

        let mut rows = side_rows(Side::Ask, &self.asks);
        rows.extend(side_rows(Side::Bid, &self.bids));
        rows
    }
}

/// Holds the latest snapshot. Owned by the depth stream task.
#[derive(Debug, Default)]
pub struct OrderBookTracker {
    snapshot: OrderBookSnapshot,
    updates: u64,
}

impl OrderBookTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the snapshot wholesale with the given depth message.
    pub fn apply(&mut self, bids: Vec<BookLevel>, asks: Vec<BookLevel>) {
        self.snapshot = OrderBookSnapshot::from_levels(bids, asks);
        self.updates += 1;
    }

    pub fn snapshot(&self) -> &OrderBookSnapshot {
        &self.snapshot
    }

    pub fn updates(&self) -> u64 {
        self.updates
    }
}

// ---------------------------------------------------------------------------
// Depth WebSocket stream
// ---------------------------------------------------------------------------

/// Subscribe to `books5` for `inst_id` and publish a snapshot per message.
///
/// Runs until the stream disconnects or an error occurs, then returns so that
/// the supervisor in main.rs can reconnect.
pub async fn run_depth_stream(
    ws_url: &str,
    inst_id: &str,
    tracker: &mut OrderBookTracker,
    events: &EventSender,
) -> Result<()> {
    ws::run_channel(ws_url, inst_id, Channel::BOOKS5, |rows| {
        for row in &rows {
            match parse_book_row(row) {
                Ok((bids, asks)) => {
                    tracker.apply(bids, asks);
                    let snapshot = tracker.snapshot().clone();
                    debug!(
                        update = tracker.updates(),
                        best_bid = ?snapshot.best_bid(),
                        best_ask = ?snapshot.best_ask(),
                        "orderbook snapshot"
                    );
                    let _ = events.send(PipelineEvent::OrderBook(snapshot));
                }
                Err(e) => warn!(error = %e, "failed to parse depth row"),
            }
        }
        Ok(())
    })
    .await
}

/// Parse a `books5` row.
///
/// Expected shape:
/// ```json
/// {
///   "bids": [["2000.1", "1.5", "0", "3"], ...],
///   "asks": [["2000.2", "1.2", "0", "2"], ...],
///   "ts": "1700000000000"
/// }
/// ```
/// A missing side is treated as empty.
fn parse_book_row(row: &Value) -> Result<(Vec<BookLevel>, Vec<BookLevel>)> {
    Ok((parse_side(row, "bids")?, parse_side(row, "asks")?))
}

fn parse_side(row: &Value, name: &str) -> Result<Vec<BookLevel>> {
    let Some(levels) = row.get(name) else {
        return Ok(Vec::new());
    };
    let levels = levels
        .as_array()
        .with_context(|| format!("field {name} is not an array"))?;

    levels
        .iter()
        .map(|level| {
            let price = level.get(0).with_context(|| format!("{name} level without price"))?;
            let size = level.get(1).with_context(|| format!("{name} level without size"))?;
            Ok(BookLevel {
                price: parse_f64(price, "px")?,
                size: parse_f64(size, "sz")?,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn lvl(price: f64, size: f64) -> BookLevel {
        BookLevel { price, size }
    }

    #[test]
    fn seven_bids_three_asks() {
        let bids = vec![
            lvl(95.0, 1.0),
            lvl(99.0, 1.0),
            lvl(93.0, 1.0),
            lvl(98.0, 1.0),
            lvl(97.0, 1.0),
            lvl(94.0, 1.0),
            lvl(96.0, 1.0),
        ];
        let asks = vec![lvl(102.0, 1.0), lvl(100.0, 2.0), lvl(101.0, 1.0)];

        let mut tracker = OrderBookTracker::new();
        tracker.apply(bids, asks);
        let snap = tracker.snapshot().clone();

        let bid_prices: Vec<f64> = snap.bids.iter().map(|l| l.price).collect();
        let ask_prices: Vec<f64> = snap.asks.iter().map(|l| l.price).collect();
        assert_eq!(bid_prices, vec![99.0, 98.0, 97.0, 96.0, 95.0]);
        assert_eq!(ask_prices, vec![100.0, 101.0, 102.0]);

        let ladder = snap.ladder();
        assert_eq!(ladder.len(), 10);
        assert!(ladder[..5].iter().all(|r| r.side == Side::Ask));
        assert!(ladder[5..].iter().all(|r| r.side == Side::Bid));
        assert_eq!(ladder[0].level, Some(lvl(100.0, 2.0)));
        assert_eq!(ladder[2].level.map(|l| l.price), Some(102.0));
        assert_eq!(ladder[3].level, None);
        assert_eq!(ladder[4].level, None);
        assert_eq!(ladder[5].level.map(|l| l.price), Some(99.0));
        assert_eq!(ladder[9].level.map(|l| l.price), Some(95.0));
    }

    #[test]
    fn snapshot_is_replaced_wholesale() {
        let mut tracker = OrderBookTracker::new();
        tracker.apply(vec![lvl(1.0, 1.0)], vec![lvl(2.0, 1.0)]);
        tracker.apply(vec![], vec![lvl(3.0, 1.0)]);
        assert!(tracker.snapshot().bids.is_empty());
        assert_eq!(tracker.snapshot().best_ask(), Some(3.0));
        assert_eq!(tracker.updates(), 2);
    }

    #[test]
    fn spread_and_imbalance() {
        let snap = OrderBookSnapshot::from_levels(vec![lvl(99.0, 3.0)], vec![lvl(101.0, 1.0)]);
        assert!((snap.spread_bps().unwrap() - 200.0).abs() < 1e-9);
        assert!((snap.imbalance() - 0.5).abs() < 1e-12);

        let empty = OrderBookSnapshot::default();
        assert_eq!(empty.spread_bps(), None);
        assert_eq!(empty.imbalance(), 0.0);
        assert!(empty.ladder().iter().all(|r| r.level.is_none()));
    }

    #[test]
    fn parses_books5_row() {
        let row = json!({
            "asks": [["2000.2", "1.2", "0", "2"], ["2000.3", "0.5", "0", "1"]],
            "bids": [["2000.1", "1.5", "0", "3"]],
            "ts": "1700000000000"
        });
        let (bids, asks) = parse_book_row(&row).unwrap();
        assert_eq!(bids, vec![lvl(2000.1, 1.5)]);
        assert_eq!(asks.len(), 2);

        let (bids, asks) = parse_book_row(&json!({"asks": [["1", "1"]]})).unwrap();
        assert!(bids.is_empty());
        assert_eq!(asks, vec![lvl(1.0, 1.0)]);

        assert!(parse_book_row(&json!({"bids": [["x", "1"]]})).is_err());
        assert!(parse_book_row(&json!({"bids": [["1"]]})).is_err());
        assert!(parse_book_row(&json!({"bids": "nope"})).is_err());
    }
}
