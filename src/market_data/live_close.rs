// =============================================================================
// Live Close - fold the candle1m stream into the published minute series
// =============================================================================

use anyhow::Result;
use tracing::{debug, warn};

use crate::events::{EventSender, PipelineEvent};
use crate::market_data::CandleSeries;
use crate::okx::{parse_candle_row, ws};
use crate::types::{Candle, Channel};

/// What a live close did to the series.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LiveCloseOutcome {
    /// `ts` was not newer than the last bar; only its close changed.
    UpdatedLast,
    /// `ts` was newer; a flat placeholder bar was appended.
    Appended,
    /// The series was empty, nothing to update.
    Ignored,
}

/// Apply a live `{ts, close}` to `series`.
///
/// An appended bar is an approximation: the stream only contributes a close,
/// so open, high and low are set to it and both volumes are zero until a
/// later backfill replaces the row.
pub fn apply_minute_close(series: &mut CandleSeries, ts: i64, close: f64) -> LiveCloseOutcome {
    let Some(last) = series.last_mut() else {
        return LiveCloseOutcome::Ignored;
    };

    if ts <= last.ts {
        last.close = close;
        return LiveCloseOutcome::UpdatedLast;
    }

    series.push_newer(Candle::flat(ts, close, 0.0));
    LiveCloseOutcome::Appended
}

/// Subscribe to `candle1m` for `inst_id` and forward each row's close.
pub async fn run_candle_stream(ws_url: &str, inst_id: &str, events: &EventSender) -> Result<()> {
    ws::run_channel(ws_url, inst_id, Channel::CANDLE_1M, |rows| {
        for row in &rows {
            match parse_candle_row(row) {
                Ok(candle) => {
                    debug!(ts = candle.ts, close = candle.close, "minute close");
                    let _ = events.send(PipelineEvent::MinuteClose {
                        ts: candle.ts,
                        close: candle.close,
                    });
                }
                Err(e) => warn!(error = %e, "failed to parse candle1m row"),
            }
        }
        Ok(())
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn series(rows: &[(i64, f64)]) -> CandleSeries {
        CandleSeries::from_rows(rows.iter().map(|&(ts, p)| Candle::flat(ts, p, 1.0)).collect())
    }

    #[test]
    fn same_minute_updates_only_close() {
        let mut s = series(&[(0, 10.0), (60_000, 11.0)]);
        assert_eq!(apply_minute_close(&mut s, 60_000, 12.5), LiveCloseOutcome::UpdatedLast);

        let last = s.last().unwrap();
        assert_eq!(last.close, 12.5);
        assert_eq!(last.open, 11.0);
        assert_eq!(last.volume, 1.0);
        assert_eq!(s.len(), 2);
    }

    #[test]
    fn older_ts_still_targets_last_bar() {
        let mut s = series(&[(0, 10.0), (60_000, 11.0)]);
        assert_eq!(apply_minute_close(&mut s, 0, 9.0), LiveCloseOutcome::UpdatedLast);
        assert_eq!(s.as_slice()[0].close, 10.0);
        assert_eq!(s.last().unwrap().close, 9.0);
    }

    #[test]
    fn new_minute_appends_flat_bar() {
        let mut s = series(&[(0, 10.0)]);
        assert_eq!(apply_minute_close(&mut s, 60_000, 10.5), LiveCloseOutcome::Appended);

        let last = *s.last().unwrap();
        assert_eq!(last.ts, 60_000);
        assert_eq!((last.open, last.high, last.low, last.close), (10.5, 10.5, 10.5, 10.5));
        assert_eq!((last.volume, last.volume_ccy), (0.0, 0.0));
    }

    #[test]
    fn empty_series_is_ignored() {
        let mut s = CandleSeries::new();
        assert_eq!(apply_minute_close(&mut s, 60_000, 1.0), LiveCloseOutcome::Ignored);
        assert!(s.is_empty());
    }
}
