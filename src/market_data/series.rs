// =============================================================================
// CandleSeries - strictly ascending, ts-unique candle sequence
// =============================================================================

use serde::Serialize;

use crate::types::Candle;

/// Ordered candles, strictly increasing and unique by `ts`.
///
/// Every way of building or extending a series goes through [`merge`] or
/// [`push_newer`], so the invariant holds for any value of this type.
///
/// [`merge`]: CandleSeries::merge
/// [`push_newer`]: CandleSeries::push_newer
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct CandleSeries {
    candles: Vec<Candle>,
}

impl CandleSeries {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a series from rows in any order. Duplicate timestamps keep the
    /// row that appears first in `rows`.
    pub fn from_rows(rows: Vec<Candle>) -> Self {
        Self::new().merge(rows)
    }

    /// Merge `new_rows` into this series.
    ///
    /// On duplicate `ts` the existing candle wins over the new row, and among
    /// the new rows the earliest occurrence wins. The result is sorted
    /// ascending.
    pub fn merge(self, new_rows: impl IntoIterator<Item = Candle>) -> Self {
        let mut candles = self.candles;
        candles.extend(new_rows);
        // Stable sort keeps existing rows ahead of new rows with the same ts,
        // so dedup_by_key retains the existing one.
        candles.sort_by_key(|c| c.ts);
        candles.dedup_by_key(|c| c.ts);
        Self { candles }
    }

    /// Append `candle` if it is newer than the current tip.
    ///
    /// Returns `false` (and leaves the series untouched) otherwise.
    pub fn push_newer(&mut self, candle: Candle) -> bool {
        match self.candles.last() {
            Some(last) if candle.ts <= last.ts => false,
            _ => {
                self.candles.push(candle);
                true
            }
        }
    }

    /// Candles with `start_ms <= ts <= end_ms`.
    pub fn window(&self, start_ms: i64, end_ms: i64) -> Self {
        let lo = self.candles.partition_point(|c| c.ts < start_ms);
        let hi = self.candles.partition_point(|c| c.ts <= end_ms);
        let candles = if lo < hi {
            self.candles[lo..hi].to_vec()
        } else {
            Vec::new()
        };
        Self { candles }
    }

    pub fn first_ts(&self) -> Option<i64> {
        self.candles.first().map(|c| c.ts)
    }

    pub fn last_ts(&self) -> Option<i64> {
        self.candles.last().map(|c| c.ts)
    }

    #[cfg(test)]
    pub fn last(&self) -> Option<&Candle> {
        self.candles.last()
    }

    /// Mutable access to the tip. Only price/volume fields may be changed
    /// through this; `ts` must stay as it is.
    pub(crate) fn last_mut(&mut self) -> Option<&mut Candle> {
        self.candles.last_mut()
    }

    pub fn as_slice(&self) -> &[Candle] {
        &self.candles
    }

    pub fn len(&self) -> usize {
        self.candles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candles.is_empty()
    }

    pub fn into_vec(self) -> Vec<Candle> {
        self.candles
    }
}
